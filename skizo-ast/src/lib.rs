//! AST shapes for the Skizo language.
//!
//! The parser produces a semantics-agnostic tree of expressions: it does not
//! know whether an identifier is a field access or a class access. All of
//! that is decided later by the transformer, which annotates the tree in
//! place (resolved idents, call targets, inserted casts, inferred types).

use serde::{Deserialize, Serialize};

mod ids;
mod typeref;

pub use ids::{ClassId, ConstId, FieldId, LocalId, MethodId};
pub use typeref::{PrimType, TypeRef, TypeRefKind};

/// One parsed source unit. `module` is the user-visible module name used in
/// metadata source locations and stack traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub module: String,
    /// `import Foo;` directives, resolved by the domain's source queue.
    pub imports: Vec<String>,
    /// `force T[]*?` directives: typerefs whose wrapper classes must exist
    /// even if no user code mentions them syntactically.
    pub forced_typerefs: Vec<TypeRef>,
    pub decls: Vec<ClassDecl>,
}

/// What kind of type-level declaration produced a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassDeclKind {
    Class,
    Struct,
    Interface,
    /// `extend A { ... }` — members are merged into an existing class.
    Extension,
    Enum,
    Alias,
}

/// Access modifiers for members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Private,
    Protected,
    Public,
    Internal,
}

/// Attribute parsed from `[key=value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrDecl {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDecl {
    pub kind: ClassDeclKind,
    pub name: String,
    /// Base class (`class B: A`), interfaces implemented, or the alias target.
    pub base: Option<TypeRef>,
    pub is_static: bool,
    pub is_abstract: bool,
    pub attrs: Vec<AttrDecl>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<MethodDecl>,
    pub consts: Vec<ConstDecl>,
    pub events: Vec<EventDecl>,
    /// Enum items in declaration order (enum decls only).
    pub enum_items: Vec<String>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub access: Access,
    pub is_static: bool,
    pub name: String,
    pub ty: TypeRef,
    pub attrs: Vec<AttrDecl>,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodDeclKind {
    Normal,
    Ctor,
    Dtor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDecl {
    pub access: Access,
    pub kind: MethodDeclKind,
    pub name: String,
    pub is_static: bool,
    pub is_abstract: bool,
    pub is_unsafe: bool,
    pub is_native: bool,
    pub params: Vec<ParamDecl>,
    pub ret: TypeRef,
    pub attrs: Vec<AttrDecl>,
    pub body: Option<Body>,
    pub line: u32,
}

/// Typed literal value of a constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Int(i32),
    Float(f64),
    Bool(bool),
    Char(char),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstDecl {
    pub access: Access,
    pub name: String,
    pub ty: TypeRef,
    pub value: ConstValue,
    pub line: u32,
}

/// `event changed: Action;` — the transformer generates the event class with
/// `fire`/`addHandler` specials around the handler method-class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDecl {
    pub access: Access,
    pub name: String,
    pub handler: TypeRef,
    pub line: u32,
}

// ---------------------------------------------------------------------------
// Expression tree
// ---------------------------------------------------------------------------

/// What an identifier resolved to (assigned by the transformer).
///
/// Captured variants carry the number of env hops from the reading method
/// to the owning method's closure env: 0 means the reader's own env, 1 the
/// immediate parent's env (`self->env`), each further hop an `_upper` link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ResolvedIdent {
    Field(FieldId),
    Local(LocalId),
    Param(u16),
    Const(ConstId),
    Class(ClassId),
    Method(MethodId),
    CapturedLocal(u16, LocalId),
    CapturedParam(u16, u16),
    /// `this` of the enclosing top-level method, reached through the chain.
    CapturedSelf(u16),
    /// An instance field of the top-level method's class, read from inside
    /// a closure through the captured `this`.
    CapturedField(u16, FieldId),
}

/// Cast classification attached to cast nodes by the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastInfo {
    Upcast,
    Downcast,
    ValueToFailable,
    ErrorToFailable,
    Box,
    Unbox,
}

/// How a call expression resolved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CallKind {
    Unresolved,
    MethodCall(MethodId),
    ConstAccess(ConstId),
}

/// A call expression: an ordered list of sub-expressions. The canonical
/// shape is `(target methodName args...)`; `(method args...)` calls a
/// method of the enclosing class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExpr {
    pub exprs: Vec<Expr>,
    pub kind: CallKind,
    /// Index of the first argument element (2 for `(target name args...)`,
    /// 1 for the self-call form `(method args...)`). Set by the transformer.
    pub args_start: u8,
    /// Instance call with an implicit `this` receiver (self-call form).
    pub implicit_this: bool,
}

impl CallExpr {
    pub fn unresolved(exprs: Vec<Expr>) -> Self {
        CallExpr {
            exprs,
            kind: CallKind::Unresolved,
            args_start: 2,
            implicit_this: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentExpr {
    pub name: String,
    /// `x: T = ...` declares a typed local at its first use site.
    pub type_at_decl: Option<TypeRef>,
    /// `x := ...` / `x: auto = ...` asks the transformer to infer.
    pub is_auto: bool,
    pub resolved: Option<ResolvedIdent>,
}

/// Top-level or closure body: a sequence of expressions owned by a method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub exprs: Vec<Expr>,
    /// Parameters of an anonymous method (`method (x:int) { ... }`); empty
    /// for bodies that belong to named methods.
    pub params: Vec<ParamDecl>,
    pub ret: TypeRef,
    /// The owning method; set by the builder for named methods and by the
    /// transformer for anonymous ones.
    pub method: Option<MethodId>,
    /// Closure-env class generated by the transformer when this body (or a
    /// nested one) captures storage.
    pub closure_class: Option<ClassId>,
    pub return_already_defined: bool,
}

impl Body {
    pub fn new() -> Self {
        Body {
            exprs: Vec::new(),
            params: Vec::new(),
            ret: TypeRef::void(),
            method: None,
            closure_class: None,
            return_already_defined: false,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Body(Body),
    Call(CallExpr),
    Ident(IdentExpr),
    IntLit(i32),
    FloatLit(f64),
    StringLit(String),
    CharLit(char),
    BoolLit(bool),
    NullLit,
    This,
    CCode(String),
    Return(Box<Expr>),
    Cast {
        target: TypeRef,
        expr: Box<Expr>,
        info: Option<CastInfo>,
    },
    Sizeof {
        target: TypeRef,
    },
    ArrayCreation {
        length: Box<Expr>,
    },
    ArrayInit {
        exprs: Vec<Expr>,
        /// Id of the generated array-init helper, assigned by the transformer.
        helper_id: Option<u32>,
    },
    IdentityComparison {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Assignment {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Abort(Box<Expr>),
    Assert(Box<Expr>),
    Ref(Box<Expr>),
    Is {
        expr: Box<Expr>,
        target: TypeRef,
    },
    Break,
    /// `cond then {..}` / `cond else {..}` / `pred while {..}` after the
    /// transformer replaced the closure call with a branch.
    InlinedCondition {
        cond: Box<Expr>,
        then_body: Box<Expr>,
        else_body: Option<Box<Expr>>,
        is_loop: bool,
    },
}

/// Every expression carries an inferred type (void until the transformer
/// runs) and a source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub inferred: TypeRef,
    pub line: u32,
}

impl Expr {
    pub fn new(kind: ExprKind, line: u32) -> Self {
        Expr {
            kind,
            inferred: TypeRef::void(),
            line,
        }
    }

    pub fn as_body(&self) -> Option<&Body> {
        match &self.kind {
            ExprKind::Body(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_body_mut(&mut self) -> Option<&mut Body> {
        match &mut self.kind {
            ExprKind::Body(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_starts_void() {
        let expr = Expr::new(ExprKind::IntLit(3), 7);
        assert!(expr.inferred.is_void());
        assert_eq!(expr.line, 7);
    }

    #[test]
    fn test_body_defaults() {
        let body = Body::new();
        assert!(body.exprs.is_empty());
        assert!(!body.return_already_defined);
        assert!(body.ret.is_void());
    }

    #[test]
    fn test_ast_serializes() {
        let expr = Expr::new(
            ExprKind::Call(CallExpr::unresolved(vec![
                Expr::new(ExprKind::IntLit(1), 1),
                Expr::new(
                    ExprKind::Ident(IdentExpr {
                        name: "+".to_string(),
                        type_at_decl: None,
                        is_auto: false,
                        resolved: None,
                    }),
                    1,
                ),
                Expr::new(ExprKind::IntLit(2), 1),
            ])),
            1,
        );
        let json = serde_json::to_string(&expr).unwrap();
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(expr, back);
    }
}
