// Modular parser for the Skizo language
// This module organizes the parser into logical components

use crate::ParseError;
use skizo_ast::*;
use skizo_lexer::{Lexer, Token, TokenSpan};

// Sub-modules for different parsing responsibilities
mod expressions;
mod items;
mod types;

// Re-export Parser as the main public interface
pub struct Parser<'a> {
    pub(crate) tokens: Vec<TokenSpan>,
    pub(crate) current: usize,
    pub(crate) module: &'a str,
}

impl<'a> Parser<'a> {
    pub fn new(module: &'a str, source: &str) -> Result<Self, ParseError> {
        let lexer = Lexer::new(source);
        let tokens: Result<Vec<_>, _> = lexer.collect();
        let tokens = tokens.map_err(|e| ParseError::LexerError(format!("{:?}", e)))?;

        Ok(Self {
            tokens,
            current: 0,
            module,
        })
    }

    /// Parses a whole source unit: imports, forced typerefs, class declarations.
    pub fn parse_unit(&mut self) -> Result<Unit, ParseError> {
        let mut imports = Vec::new();
        let mut forced_typerefs = Vec::new();
        let mut decls = Vec::new();

        while !self.is_at_end() {
            if self.check(&Token::Import) {
                self.advance();
                let name = self.consume_identifier("Expected module name after 'import'")?;
                self.consume(&Token::Semicolon, "Expected ';' after import")?;
                imports.push(name);
            } else if self.check(&Token::Force) {
                self.advance();
                forced_typerefs.push(self.parse_typeref()?);
                self.consume(&Token::Semicolon, "Expected ';' after forced typeref")?;
            } else {
                decls.push(self.parse_class_decl()?);
            }
        }

        Ok(Unit {
            module: self.module.to_string(),
            imports,
            forced_typerefs,
            decls,
        })
    }

    // ==================== Helper Methods ====================

    pub(crate) fn match_token(&mut self, kind: &Token) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn check(&self, kind: &Token) -> bool {
        if self.is_at_end() {
            false
        } else {
            std::mem::discriminant(self.peek()) == std::mem::discriminant(kind)
        }
    }

    pub(crate) fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.current >= self.tokens.len()
    }

    pub(crate) fn peek_span(&self) -> Option<&TokenSpan> {
        self.tokens.get(self.current)
    }

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.current].token
    }

    pub(crate) fn previous(&self) -> &Token {
        &self.tokens[self.current - 1].token
    }

    pub(crate) fn line(&self) -> u32 {
        self.peek_span()
            .map(|t| t.line as u32)
            .or_else(|| self.tokens.last().map(|t| t.line as u32))
            .unwrap_or(0)
    }

    pub(crate) fn consume(&mut self, kind: &Token, message: &str) -> Result<(), ParseError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    pub(crate) fn consume_identifier(&mut self, message: &str) -> Result<String, ParseError> {
        match self.peek_span().map(|t| t.token.clone()) {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(message)),
        }
    }

    pub(crate) fn error(&self, message: &str) -> ParseError {
        let location = match self.peek_span() {
            Some(span) => format!("{}:{}", self.module, span.line),
            None => format!("{}:<end of file>", self.module),
        };

        ParseError::SyntaxError {
            location,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Unit {
        Parser::new("test", source).unwrap().parse_unit().unwrap()
    }

    #[test]
    fn test_parse_imports_and_force() {
        let unit = parse("import core; force [int]; class A { }");
        assert_eq!(unit.imports, vec!["core".to_string()]);
        assert_eq!(unit.forced_typerefs.len(), 1);
        assert_eq!(unit.forced_typerefs[0].array_level, 1);
        assert_eq!(unit.decls.len(), 1);
    }

    #[test]
    fn test_unexpected_top_level() {
        let result = Parser::new("test", "return;").unwrap().parse_unit();
        assert!(result.is_err());
    }
}
