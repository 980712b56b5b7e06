//! The per-domain metadata store.
//!
//! Each category (classes, methods, fields, consts) is a flat append-only
//! store that doubles as the category's allocation arena: individual
//! deletion is a no-op and the whole store drops with the domain.

use crate::{Class, Const, Field, Method, MethodKind};
use skizo_ast::{ClassId, ConstId, FieldId, MethodId, TypeRef};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Class '{0}' is already defined in this domain")]
    DuplicateClass(String),
    #[error("Duplicate member '{1}' in class '{0}'")]
    DuplicateMember(String, String),
    #[error("Unknown class '{0}'")]
    UnknownClass(String),
}

/// Per-category arena usage, reportable for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub class_bytes: usize,
    pub method_bytes: usize,
    pub field_bytes: usize,
    pub const_bytes: usize,
}

#[derive(Debug, Default)]
pub struct Metadata {
    classes: Vec<Class>,
    methods: Vec<Method>,
    fields: Vec<Field>,
    consts: Vec<Const>,

    by_flat_name: HashMap<String, ClassId>,
    by_nice_name: HashMap<String, ClassId>,

    /// Lazily generated wrapper classes, cached per designator.
    pub array_cache: HashMap<TypeRef, ClassId>,
    pub failable_cache: HashMap<TypeRef, ClassId>,
    pub boxed_cache: HashMap<TypeRef, ClassId>,
    pub foreign_cache: HashMap<TypeRef, ClassId>,
    pub alias_classes: Vec<ClassId>,
    pub extensions: Vec<ClassId>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    /// Reserves the next class id without registering names yet.
    pub fn next_class_id(&self) -> ClassId {
        ClassId(self.classes.len() as u32)
    }

    /// Puts the class into the domain's containers. Flat names are unique
    /// within a domain; nice names may collide for boxed wrappers (the
    /// value-type keeps the nice-name slot).
    pub fn register_class(&mut self, class: Class) -> Result<ClassId, MetadataError> {
        if self.by_flat_name.contains_key(&class.flat_name) {
            return Err(MetadataError::DuplicateClass(class.flat_name));
        }
        let id = ClassId(self.classes.len() as u32);
        debug_assert_eq!(id, class.id);
        self.by_flat_name.insert(class.flat_name.clone(), id);
        self.by_nice_name.entry(class.nice_name.clone()).or_insert(id);
        self.classes.push(class);
        Ok(id)
    }

    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.index()]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.index()]
    }

    pub fn class_by_flat_name(&self, name: &str) -> Option<ClassId> {
        self.by_flat_name.get(name).copied()
    }

    pub fn class_by_nice_name(&self, name: &str) -> Option<ClassId> {
        self.by_nice_name.get(name).copied()
    }

    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter()
    }

    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> {
        (0..self.classes.len() as u32).map(ClassId)
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn flat_names(&self) -> impl Iterator<Item = &str> {
        self.by_flat_name.keys().map(|s| s.as_str())
    }

    // ------------------------------------------------------------------
    // Methods
    // ------------------------------------------------------------------

    pub fn next_method_id(&self) -> MethodId {
        MethodId(self.methods.len() as u32)
    }

    pub fn add_method(&mut self, method: Method) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        debug_assert_eq!(id, method.id);
        self.methods.push(method);
        id
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.index()]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id.index()]
    }

    pub fn method_ids(&self) -> impl Iterator<Item = MethodId> {
        (0..self.methods.len() as u32).map(MethodId)
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// `Class::method` style display name for stack traces and profiling.
    pub fn method_full_name(&self, id: MethodId) -> String {
        let method = self.method(id);
        let class = self.class(method.declaring_class);
        match method.kind {
            MethodKind::Dtor => format!("{}::dtor", class.nice_name),
            _ => format!("{}::{}", class.nice_name, method.name),
        }
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    pub fn next_field_id(&self) -> FieldId {
        FieldId(self.fields.len() as u32)
    }

    pub fn add_field(&mut self, field: Field) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        debug_assert_eq!(id, field.id);
        self.fields.push(field);
        id
    }

    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.index()]
    }

    pub fn field_mut(&mut self, id: FieldId) -> &mut Field {
        &mut self.fields[id.index()]
    }

    // ------------------------------------------------------------------
    // Consts
    // ------------------------------------------------------------------

    pub fn next_const_id(&self) -> ConstId {
        ConstId(self.consts.len() as u32)
    }

    pub fn add_const(&mut self, konst: Const) -> ConstId {
        let id = ConstId(self.consts.len() as u32);
        debug_assert_eq!(id, konst.id);
        self.consts.push(konst);
        id
    }

    pub fn const_(&self, id: ConstId) -> &Const {
        &self.consts[id.index()]
    }

    pub fn const_mut(&mut self, id: ConstId) -> &mut Const {
        &mut self.consts[id.index()]
    }

    // ------------------------------------------------------------------
    // Arena accounting
    // ------------------------------------------------------------------

    pub fn arena_stats(&self) -> ArenaStats {
        ArenaStats {
            class_bytes: self.classes.len() * std::mem::size_of::<Class>(),
            method_bytes: self.methods.len() * std::mem::size_of::<Method>(),
            field_bytes: self.fields.len() * std::mem::size_of::<Field>(),
            const_bytes: self.consts.len() * std::mem::size_of::<Const>(),
        }
    }

    // ------------------------------------------------------------------
    // Hierarchy helpers
    // ------------------------------------------------------------------

    /// Walks the base chain from `child` looking for `ancestor`.
    pub fn is_subclass_of(&self, child: ClassId, ancestor: ClassId) -> bool {
        let mut cur = Some(child);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.class(id).base_class();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut md = Metadata::new();
        let id = md.next_class_id();
        md.register_class(Class::new(id, "Program")).unwrap();
        assert_eq!(md.class_by_flat_name("Program"), Some(id));
        assert_eq!(md.class_by_nice_name("Program"), Some(id));
        assert!(md.class_by_flat_name("Other").is_none());
    }

    #[test]
    fn test_duplicate_flat_name_rejected() {
        let mut md = Metadata::new();
        let id = md.next_class_id();
        md.register_class(Class::new(id, "A")).unwrap();
        let id2 = md.next_class_id();
        assert!(md.register_class(Class::new(id2, "A")).is_err());
    }

    #[test]
    fn test_boxed_nice_name_does_not_shadow() {
        let mut md = Metadata::new();
        let id = md.next_class_id();
        let mut v = Class::new(id, "Point");
        v.is_value_type = true;
        md.register_class(v).unwrap();

        let id2 = md.next_class_id();
        let mut boxed = Class::new(id2, "0Boxed_Point");
        boxed.nice_name = "Point".into();
        md.register_class(boxed).unwrap();

        // The value type keeps the nice-name slot.
        assert_eq!(md.class_by_nice_name("Point"), Some(id));
        assert_eq!(md.class_by_flat_name("0Boxed_Point"), Some(id2));
    }

    #[test]
    fn test_subclass_walk() {
        let mut md = Metadata::new();
        let a = md.next_class_id();
        md.register_class(Class::new(a, "A")).unwrap();
        let b = md.next_class_id();
        let mut class_b = Class::new(b, "B");
        let mut base = TypeRef::object("A");
        base.resolved = Some(a);
        class_b.base = Some(base);
        md.register_class(class_b).unwrap();

        assert!(md.is_subclass_of(b, a));
        assert!(!md.is_subclass_of(a, b));
    }

    #[test]
    fn test_arena_stats_grow() {
        let mut md = Metadata::new();
        let before = md.arena_stats();
        let id = md.next_class_id();
        md.register_class(Class::new(id, "A")).unwrap();
        assert!(md.arena_stats().class_bytes > before.class_bytes);
    }
}
