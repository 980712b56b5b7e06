//! Class metadata: the central node everything else hangs off.

use crate::{Attribute, MemberRef};
use skizo_ast::{ClassId, ConstId, FieldId, MethodId, TypeRef};
use std::collections::HashMap;

/// Vtable slot 0 holds the class word (the class id, widened); slots 1..N
/// hold instance-method code pointers in vtable-index order.
pub const VTABLE_CLASS_SLOT: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialClass {
    None,
    Interface,
    Array,
    Failable,
    Foreign,
    Boxed,
    ClosureEnv,
    /// Closure/functor classes (Predicate, Action, user method classes).
    MethodClass,
    EventClass,
    Alias,
    /// `[nativeSize=N]` opaque value-type blob.
    BinaryBlob,
}

/// Layout facts the GC needs about a class.
#[derive(Debug, Clone, Default)]
pub struct GcInfo {
    /// Allocation size in bytes (including the header word for reference
    /// types; arrays override this per instance).
    pub content_size: u32,
    /// Size when used as a field or array item: the full struct for
    /// value-types, one word for reference types.
    pub size_for_use: u32,
    /// Sorted offsets of reference-typed slots within the object.
    pub gc_map: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Class {
    pub id: ClassId,
    /// Mangled internal name, unique within a domain (`0Array_int`).
    pub flat_name: String,
    /// User-visible name; stable across domains. A boxed wrapper has the
    /// same nice name as the value-type it wraps.
    pub nice_name: String,
    pub module: String,
    pub line: u32,

    pub is_value_type: bool,
    pub is_static: bool,
    pub is_abstract: bool,
    /// The root of the class hierarchy (`any`).
    pub is_hierarchy_root: bool,
    pub is_compiler_generated: bool,
    /// Set by the prolog once the static ctor has run without aborting.
    pub is_initialized: bool,
    /// Set by the transformer when the class needs a stage-1 static-ctor
    /// type-init check at use sites.
    pub has_static_ctor_check: bool,

    pub special: SpecialClass,

    pub base: Option<TypeRef>,

    pub instance_fields: Vec<FieldId>,
    pub static_fields: Vec<FieldId>,
    /// Prepended with inherited methods, so the vtable index of an
    /// instance method equals its position in this list.
    pub instance_methods: Vec<MethodId>,
    pub static_methods: Vec<MethodId>,
    pub instance_ctors: Vec<MethodId>,
    pub static_ctor: Option<MethodId>,
    pub instance_dtor: Option<MethodId>,
    pub static_dtor: Option<MethodId>,
    pub consts: Vec<ConstId>,

    /// Member-name uniqueness and lookup.
    pub name_set: HashMap<String, MemberRef>,

    pub gc_info: GcInfo,

    /// Value-types have no vtable.
    pub has_vtable: bool,
    /// Slot words; built by the domain prolog. Stable once frozen: object
    /// headers point into this buffer.
    pub vtable: Vec<usize>,

    /// The element/inner type for array/failable/foreign/boxed/alias/
    /// event-class wrappers.
    pub wrapped: Option<TypeRef>,

    pub attrs: Vec<Attribute>,
    /// `[nativeSize=N]` for binary blobs.
    pub native_size: Option<u32>,
    /// `[ptrWrapper]` marker.
    pub is_ptr_wrapper: bool,
    /// Item names in declaration order when this class came from an enum
    /// declaration; drives the generated toString/fromInt bodies.
    pub enum_items: Vec<String>,
}

impl Class {
    pub fn new(id: ClassId, flat_name: impl Into<String>) -> Self {
        let flat_name = flat_name.into();
        Class {
            id,
            nice_name: flat_name.clone(),
            flat_name,
            module: String::new(),
            line: 0,
            is_value_type: false,
            is_static: false,
            is_abstract: false,
            is_hierarchy_root: false,
            is_compiler_generated: false,
            is_initialized: false,
            has_static_ctor_check: false,
            special: SpecialClass::None,
            base: None,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            instance_methods: Vec::new(),
            static_methods: Vec::new(),
            instance_ctors: Vec::new(),
            static_ctor: None,
            instance_dtor: None,
            static_dtor: None,
            consts: Vec::new(),
            name_set: HashMap::new(),
            gc_info: GcInfo::default(),
            has_vtable: false,
            vtable: Vec::new(),
            wrapped: None,
            attrs: Vec::new(),
            native_size: None,
            is_ptr_wrapper: false,
            enum_items: Vec::new(),
        }
    }

    pub fn is_reference_type(&self) -> bool {
        !self.is_value_type
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn member(&self, name: &str) -> Option<MemberRef> {
        self.name_set.get(name).copied()
    }

    /// Resolved base class id, when the base typeref has been resolved.
    pub fn base_class(&self) -> Option<ClassId> {
        self.base.as_ref().and_then(|t| t.resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_class_defaults() {
        let c = Class::new(ClassId(0), "Program");
        assert_eq!(c.flat_name, "Program");
        assert_eq!(c.nice_name, "Program");
        assert_eq!(c.special, SpecialClass::None);
        assert!(!c.has_vtable);
        assert!(c.vtable.is_empty());
    }

    #[test]
    fn test_attr_lookup() {
        let mut c = Class::new(ClassId(0), "Blob");
        c.attrs.push(Attribute {
            name: "nativeSize".into(),
            value: "8".into(),
        });
        assert_eq!(c.attr("nativeSize"), Some("8"));
        assert_eq!(c.attr("missing"), None);
    }
}
