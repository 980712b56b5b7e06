//! Method metadata.

use crate::Attribute;
use skizo_ast::{Access, Body, ClassId, FieldId, LocalId, MethodId, TypeRef};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Normal,
    Ctor,
    Dtor,
}

/// Special-method tags. Most are compiler-generated forwarding shapes; the
/// thunk-manager ones are emitted as machine code instead of C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialMethod {
    None,
    /// Implemented outside Skizo: an ICall (runtime-internal) or an ECall
    /// (external module, described by the ecall descriptor).
    Native,
    /// ECalls in untrusted domains compile to stubs that abort at runtime.
    DisallowedECall,
    Fire,
    AddHandler,
    ForeignSync,
    ForeignAsync,
    EnumFromInt,
    /// Generated by the thunk manager instead of the C backend.
    ClosureCtor,
    BoxedMethod,
    BoxedCtor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    Cdecl,
    Stdcall,
}

/// ECall descriptor: where the native implementation of an externally
/// linked method lives.
#[derive(Debug, Clone)]
pub struct ECallDesc {
    pub module: Option<String>,
    pub entry_point: Option<String>,
    pub call_conv: CallConv,
    /// Resolved native pointer, populated at link time.
    pub ptr: Option<usize>,
}

impl Default for ECallDesc {
    fn default() -> Self {
        ECallDesc {
            module: None,
            entry_point: None,
            call_conv: CallConv::Cdecl,
            ptr: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeRef,
    pub is_captured: bool,
}

#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub ty: TypeRef,
    pub is_captured: bool,
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: TypeRef,
    pub is_static: bool,
}

impl Signature {
    pub fn param_by_name(&self, name: &str) -> Option<(u16, &Param)> {
        self.params
            .iter()
            .enumerate()
            .find(|(_, p)| p.name == name)
            .map(|(i, p)| (i as u16, p))
    }

    /// Signatures match for override purposes when param types and return
    /// type are equal.
    pub fn matches(&self, other: &Signature) -> bool {
        self.ret == other.ret
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty == b.ty)
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    pub id: MethodId,
    pub declaring_class: ClassId,
    /// Extension block the method came from, if any.
    pub declaring_ext_class: Option<ClassId>,
    pub kind: MethodKind,
    pub access: Access,
    pub name: String,
    pub sig: Signature,
    pub special: SpecialMethod,
    /// Position in the class's instance-method list; -1 if non-virtual.
    pub vtable_index: i32,
    /// The method this one overrides.
    pub base_method: Option<MethodId>,
    /// Enclosing method for closures; forms an acyclic chain rooted at a
    /// top-level method.
    pub parent_method: Option<MethodId>,
    pub body: Option<Body>,
    pub locals: HashMap<String, LocalId>,
    pub local_list: Vec<Local>,
    pub attrs: Vec<Attribute>,
    pub closure_env_class: Option<ClassId>,
    pub ecall: ECallDesc,
    /// Resolved native pointer for icalls.
    pub icall_ptr: Option<usize>,

    // Flag set
    pub is_abstract: bool,
    pub is_unsafe: bool,
    pub is_anonymous: bool,
    pub is_compiler_generated: bool,
    /// Off when no subclass overrides the method, enabling direct calls.
    pub is_truly_virtual: bool,
    pub is_self_captured: bool,
    pub has_break_exprs: bool,
    pub ever_called: bool,
    pub is_inferred: bool,
    pub attrs_resolved: bool,
    /// Set when the body is exactly `return field;` — the emitter inlines
    /// the field access at call sites.
    pub inlinable_field: Option<FieldId>,
}

impl Method {
    pub fn new(id: MethodId, declaring_class: ClassId, kind: MethodKind, name: String) -> Self {
        Method {
            id,
            declaring_class,
            declaring_ext_class: None,
            kind,
            access: Access::Public,
            name,
            sig: Signature {
                params: Vec::new(),
                ret: TypeRef::void(),
                is_static: false,
            },
            special: SpecialMethod::None,
            vtable_index: -1,
            base_method: None,
            parent_method: None,
            body: None,
            locals: HashMap::new(),
            local_list: Vec::new(),
            attrs: Vec::new(),
            closure_env_class: None,
            ecall: ECallDesc::default(),
            icall_ptr: None,
            is_abstract: false,
            is_unsafe: false,
            is_anonymous: false,
            is_compiler_generated: false,
            is_truly_virtual: false,
            is_self_captured: false,
            has_break_exprs: false,
            ever_called: false,
            is_inferred: false,
            attrs_resolved: false,
            inlinable_field: None,
        }
    }

    /// Registers a local, failing on duplicates is the caller's concern
    /// (name-set checks run in the transformer).
    pub fn add_local(&mut self, name: String, ty: TypeRef) -> LocalId {
        let id = LocalId(self.local_list.len() as u32);
        self.local_list.push(Local {
            name: name.clone(),
            ty,
            is_captured: false,
        });
        self.locals.insert(name, id);
        id
    }

    pub fn local(&self, id: LocalId) -> &Local {
        &self.local_list[id.index()]
    }

    pub fn local_mut(&mut self, id: LocalId) -> &mut Local {
        &mut self.local_list[id.index()]
    }

    /// A native or abstract method carries no body AST; everything else
    /// must have exactly one.
    pub fn expects_body(&self) -> bool {
        !self.is_abstract && self.special != SpecialMethod::Native
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matching() {
        let a = Signature {
            params: vec![Param {
                name: "x".into(),
                ty: TypeRef::int(),
                is_captured: false,
            }],
            ret: TypeRef::int(),
            is_static: false,
        };
        let mut b = a.clone();
        // Param names don't matter for overrides.
        b.params[0].name = "y".into();
        assert!(a.matches(&b));

        b.params[0].ty = TypeRef::float();
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_locals() {
        let mut m = Method::new(MethodId(0), ClassId(0), MethodKind::Normal, "m".into());
        let id = m.add_local("x".into(), TypeRef::int());
        assert_eq!(m.local(id).name, "x");
        assert_eq!(m.locals.get("x"), Some(&id));
    }
}
