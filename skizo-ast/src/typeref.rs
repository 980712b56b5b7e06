//! Type designators. A typeref encodes a range of types as written in code,
//! from a simple `T` to a complex `[T]?`. When first created by the parser
//! it is unresolved: only the name, array level and wrapper kind are known.
//! The resolver later populates `resolved` with the backing class.

use crate::ClassId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Primitive type kinds, used for quickly creating typerefs from primitive
/// types. `Object` covers both value-types and reference types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimType {
    /// A lack of any type (method returns, default value).
    Void,
    Int,
    Float,
    Bool,
    Char,
    IntPtr,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRefKind {
    Normal,
    /// `T?` — wraps either a result of type T or an Error.
    Failable,
    /// `T*` — a proxy for an object that exists in a separate domain.
    Foreign,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRef {
    pub prim: PrimType,
    /// Class name when `prim == Object`.
    pub class_name: Option<String>,
    /// `[T]` has level 1, `[[T]]` level 2, etc.
    pub array_level: u32,
    pub kind: TypeRefKind,
    /// Unresolved typerefs have this set to None. Excluded from equality:
    /// the same typeref in different domains resolves to different classes.
    pub resolved: Option<ClassId>,
}

impl TypeRef {
    pub fn void() -> Self {
        Self::prim(PrimType::Void)
    }

    pub fn int() -> Self {
        Self::prim(PrimType::Int)
    }

    pub fn float() -> Self {
        Self::prim(PrimType::Float)
    }

    pub fn bool_() -> Self {
        Self::prim(PrimType::Bool)
    }

    pub fn char_() -> Self {
        Self::prim(PrimType::Char)
    }

    pub fn intptr() -> Self {
        Self::prim(PrimType::IntPtr)
    }

    pub fn prim(prim: PrimType) -> Self {
        TypeRef {
            prim,
            class_name: None,
            array_level: 0,
            kind: TypeRefKind::Normal,
            resolved: None,
        }
    }

    pub fn object(name: impl Into<String>) -> Self {
        TypeRef {
            prim: PrimType::Object,
            class_name: Some(name.into()),
            array_level: 0,
            kind: TypeRefKind::Normal,
            resolved: None,
        }
    }

    /// `[self]`
    pub fn array_of(mut self) -> Self {
        self.array_level += 1;
        self.resolved = None;
        self
    }

    /// `self?`
    pub fn failable_of(mut self) -> Self {
        self.kind = TypeRefKind::Failable;
        self.resolved = None;
        self
    }

    /// `self*`
    pub fn foreign_of(mut self) -> Self {
        self.kind = TypeRefKind::Foreign;
        self.resolved = None;
        self
    }

    pub fn is_void(&self) -> bool {
        self.prim == PrimType::Void && self.array_level == 0 && self.kind == TypeRefKind::Normal
    }

    /// True when this typeref needs wrapper-class generation to resolve
    /// (arrays, failables, foreign proxies).
    pub fn is_composite(&self) -> bool {
        self.array_level > 0 || self.kind != TypeRefKind::Normal
    }

    /// The inner element/referent of a composite typeref. The outermost
    /// wrapper strips first: `[int]?` is a failable wrapping `[int]`, so
    /// its inner type is `[int]`; `[T]` -> `T`.
    pub fn inner(&self) -> Option<TypeRef> {
        if self.kind != TypeRefKind::Normal {
            let mut inner = self.clone();
            inner.kind = TypeRefKind::Normal;
            inner.resolved = None;
            Some(inner)
        } else if self.array_level > 0 {
            let mut inner = self.clone();
            inner.array_level -= 1;
            inner.resolved = None;
            Some(inner)
        } else {
            None
        }
    }

    /// Equality of the designator only (what spec'd typeref equality means).
    pub fn same_type(&self, other: &TypeRef) -> bool {
        self.prim == other.prim
            && self.class_name == other.class_name
            && self.array_level == other.array_level
            && self.kind == other.kind
    }
}

// The resolved class pointer is excluded from equality and hashing: two
// typerefs denote the same type iff their designators match.
impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_type(other)
    }
}

impl Eq for TypeRef {}

impl Hash for TypeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.prim.hash(state);
        self.class_name.hash(state);
        self.array_level.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for _ in 0..self.array_level {
            write!(f, "[")?;
        }
        match self.prim {
            PrimType::Void => write!(f, "void")?,
            PrimType::Int => write!(f, "int")?,
            PrimType::Float => write!(f, "float")?,
            PrimType::Bool => write!(f, "bool")?,
            PrimType::Char => write!(f, "char")?,
            PrimType::IntPtr => write!(f, "intptr")?,
            PrimType::Object => write!(f, "{}", self.class_name.as_deref().unwrap_or("?"))?,
        }
        for _ in 0..self.array_level {
            write!(f, "]")?;
        }
        match self.kind {
            TypeRefKind::Normal => Ok(()),
            TypeRefKind::Failable => write!(f, "?"),
            TypeRefKind::Foreign => write!(f, "*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_resolution() {
        let mut a = TypeRef::object("A");
        let b = TypeRef::object("A");
        a.resolved = Some(ClassId(5));
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_of_designators() {
        assert_ne!(TypeRef::object("A"), TypeRef::object("B"));
        assert_ne!(TypeRef::object("A"), TypeRef::object("A").array_of());
        assert_ne!(TypeRef::object("A"), TypeRef::object("A").failable_of());
        assert_ne!(TypeRef::int(), TypeRef::float());
    }

    #[test]
    fn test_inner() {
        let arr = TypeRef::object("A").array_of().array_of();
        let inner = arr.inner().unwrap();
        assert_eq!(inner.array_level, 1);

        let failable = TypeRef::int().failable_of();
        assert_eq!(failable.inner().unwrap(), TypeRef::int());

        assert!(TypeRef::int().inner().is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeRef::object("A").array_of().to_string(), "[A]");
        assert_eq!(TypeRef::int().failable_of().to_string(), "int?");
        assert_eq!(TypeRef::object("A").foreign_of().to_string(), "A*");
    }
}
