//! The in-memory metadata model of a Skizo domain.
//!
//! Classes, methods, fields and constants live in flat per-category stores
//! owned by the domain; everything refers to them through plain indices
//! (`ClassId` and friends from `skizo-ast`). Lifetimes align to the domain,
//! so the reference cycles of a pointer-graph design never form.

pub mod class;
pub mod interner;
pub mod member;
pub mod method;
pub mod registry;

pub use class::{Class, GcInfo, SpecialClass, VTABLE_CLASS_SLOT};
pub use interner::{Interner, Sym};
pub use member::{Attribute, Const, Field, MemberRef};
pub use method::{CallConv, ECallDesc, Local, Method, MethodKind, Param, Signature, SpecialMethod};
pub use registry::{ArenaStats, Metadata, MetadataError};

// Re-exported so downstream crates name one metadata surface.
pub use skizo_ast::{ClassId, ConstId, FieldId, LocalId, MethodId, PrimType, TypeRef, TypeRefKind};

/// Machine word size of the only supported target (32-bit x86).
pub const WORD_SIZE: u32 = 4;

/// Object header: a single vtable word in front of instance fields.
pub const OBJECT_HEADER_SIZE: u32 = WORD_SIZE;

/// Array object layout: vtable word, int32 length, then the items.
pub const ARRAY_FIRST_ITEM_OFFSET: u32 = 8;

/// Size in bytes of a primitive when stored in a field or array slot.
pub fn prim_size(prim: PrimType) -> u32 {
    match prim {
        PrimType::Void => 0,
        PrimType::Int => 4,
        PrimType::Float => 4,
        PrimType::Bool => 1,
        PrimType::Char => 2,
        PrimType::IntPtr => WORD_SIZE,
        PrimType::Object => WORD_SIZE,
    }
}
