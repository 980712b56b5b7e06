// Typeref parsing: T, [T], T?, T*, [[T]]?, etc.

use super::Parser;
use crate::ParseError;
use skizo_ast::{PrimType, TypeRef};
use skizo_lexer::Token;

impl<'a> Parser<'a> {
    /// Parses a type designator. Primitive names map to their prim kinds,
    /// everything else is an object typeref by class name.
    pub(crate) fn parse_typeref(&mut self) -> Result<TypeRef, ParseError> {
        // Array levels nest through brackets: [T], [[T]].
        if self.match_token(&Token::LBracket) {
            let inner = self.parse_typeref()?;
            self.consume(&Token::RBracket, "Expected ']' in array typeref")?;
            let mut ty = inner.array_of();
            ty = self.parse_typeref_suffix(ty);
            return Ok(ty);
        }

        let name = self.consume_identifier("Expected a type name")?;
        let mut ty = match name.as_str() {
            "void" => TypeRef::prim(PrimType::Void),
            "int" => TypeRef::int(),
            "float" => TypeRef::float(),
            "bool" => TypeRef::bool_(),
            "char" => TypeRef::char_(),
            "intptr" => TypeRef::intptr(),
            _ => TypeRef::object(name),
        };

        ty = self.parse_typeref_suffix(ty);
        Ok(ty)
    }

    fn parse_typeref_suffix(&mut self, ty: TypeRef) -> TypeRef {
        if self.match_token(&Token::FailableSuffix) {
            ty.failable_of()
        } else if self.match_token(&Token::Asterisk) {
            ty.foreign_of()
        } else {
            ty
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_ast::TypeRefKind;

    fn typeref(source: &str) -> TypeRef {
        Parser::new("test", source).unwrap().parse_typeref().unwrap()
    }

    #[test]
    fn test_primitives() {
        assert_eq!(typeref("int"), TypeRef::int());
        assert_eq!(typeref("float"), TypeRef::float());
        assert_eq!(typeref("intptr"), TypeRef::intptr());
    }

    #[test]
    fn test_object() {
        assert_eq!(typeref("Program"), TypeRef::object("Program"));
    }

    #[test]
    fn test_array_failable_foreign() {
        let ty = typeref("[int]?");
        assert_eq!(ty.array_level, 1);
        assert_eq!(ty.kind, TypeRefKind::Failable);

        let ty = typeref("Obj*");
        assert_eq!(ty.kind, TypeRefKind::Foreign);

        let ty = typeref("[[A]]");
        assert_eq!(ty.array_level, 2);
    }
}
