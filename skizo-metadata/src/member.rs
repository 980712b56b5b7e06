//! Fields, constants and attributes.

use skizo_ast::{Access, ClassId, ConstId, ConstValue, FieldId, MethodId, TypeRef};

/// Attribute parsed from `[key=value]`, resolved against a member.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub id: FieldId,
    pub declaring_class: ClassId,
    pub access: Access,
    pub is_static: bool,
    pub name: String,
    pub ty: TypeRef,
    /// Byte offset inside the object (including the header word for
    /// reference types). Assigned by the transformer's layout pass.
    pub offset: u32,
    pub attrs: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct Const {
    pub id: ConstId,
    pub declaring_class: ClassId,
    pub access: Access,
    pub name: String,
    pub ty: TypeRef,
    pub value: ConstValue,
}

/// What a member name in a class's name set refers to. Used for
/// duplicate-member checks and member lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRef {
    Field(FieldId),
    Method(MethodId),
    Const(ConstId),
}
