use logos::Logos;

/// Helper function to unescape string literals
fn unescape_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some('0') => result.push('\0'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some('\\') => result.push('\\'),
                Some('u') => {
                    // Unicode escape: \uXXXX
                    let hex: String = chars.by_ref().take(4).collect();
                    if let Ok(code) = u32::from_str_radix(&hex, 16) {
                        if let Some(unicode_char) = char::from_u32(code) {
                            result.push(unicode_char);
                        }
                    }
                }
                Some(c) => {
                    result.push('\\');
                    result.push(c);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Token types for the Skizo programming language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*[^/])*\*/")]
pub enum Token {
    // Declaration keywords
    #[token("class")]
    Class,
    #[token("struct")]
    Struct,
    #[token("interface")]
    Interface,
    #[token("extend")]
    Extend,
    #[token("enum")]
    Enum,
    #[token("alias")]
    Alias,
    #[token("field")]
    Field,
    #[token("method")]
    Method,
    #[token("ctor")]
    Ctor,
    #[token("dtor")]
    Dtor,
    #[token("const")]
    Const,
    #[token("event")]
    Event,
    #[token("property")]
    Property,
    #[token("boxed")]
    Boxed,

    // Modifiers
    #[token("private")]
    Private,
    #[token("protected")]
    Protected,
    #[token("public")]
    Public,
    #[token("internal")]
    Internal,
    #[token("static")]
    Static,
    #[token("abstract")]
    Abstract,
    #[token("unsafe")]
    Unsafe,
    #[token("native")]
    Native,

    // Expression keywords
    #[token("return")]
    Return,
    #[token("this")]
    This,
    #[token("null")]
    Null,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("cast")]
    Cast,
    #[token("is")]
    Is,
    #[token("abort")]
    Abort,
    #[token("assert")]
    Assert,
    #[token("ref")]
    Ref,
    #[token("break")]
    Break,
    #[token("sizeof")]
    Sizeof,
    #[token("array")]
    NewArray,
    #[token("auto")]
    Auto,
    #[token("import")]
    Import,
    #[token("force")]
    Force,

    // Punctuation
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token("?")]
    FailableSuffix,
    #[token("===")]
    IdentityComparison,
    #[token("==")]
    EqualsOp,
    #[token("=")]
    Assignment,

    // Operators (become method-name identifiers inside call expressions)
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Asterisk,
    #[token("/")]
    Div,
    #[token("%")]
    Modulo,
    #[token(">")]
    Greater,
    #[token("<")]
    Less,
    #[token("|")]
    BinOr,
    #[token("&")]
    BinAnd,
    #[token(".")]
    Dot,

    // Inline C code: @ raw text @
    #[regex(r"@[^@]*@", |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    CCode(String),

    // Literals
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    FloatLiteral(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().to_string())]
    IntLiteral(String),
    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    StringLiteral(String),
    #[regex(r"'([^'\\]|\\.)'", |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1]).chars().next()
    })]
    CharLiteral(char),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

impl Token {
    /// True for tokens that are allowed to stand in for a method name inside
    /// a call expression (`1 + 2` calls the method named `+` on `1`).
    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            Token::Plus
                | Token::Minus
                | Token::Asterisk
                | Token::Div
                | Token::Modulo
                | Token::Greater
                | Token::Less
                | Token::EqualsOp
                | Token::BinOr
                | Token::BinAnd
        )
    }

    /// The identifier an operator token turns into inside a call expression.
    pub fn operator_name(&self) -> Option<&'static str> {
        Some(match self {
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Asterisk => "*",
            Token::Div => "/",
            Token::Modulo => "%",
            Token::Greater => ">",
            Token::Less => "<",
            Token::EqualsOp => "==",
            Token::BinOr => "|",
            Token::BinAnd => "&",
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenSpan {
    pub token: Token,
    pub span: std::ops::Range<usize>,
    pub line: usize,
}

pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    source: &'source str,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            source,
        }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.source[..offset.min(self.source.len())]
            .chars()
            .filter(|&c| c == '\n')
            .count()
            + 1
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<TokenSpan, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.inner.next()?;
        let span = self.inner.span();
        let line = self.line_of(span.start);

        match token {
            Ok(tok) => Some(Ok(TokenSpan { token: tok, span, line })),
            Err(_) => Some(Err(LexError::InvalidToken { span, line })),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LexError {
    #[error("Invalid token at line {line} ({span:?})")]
    InvalidToken {
        span: std::ops::Range<usize>,
        line: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        Lexer::new(source).map(|r| r.unwrap().token).collect()
    }

    #[test]
    fn test_keywords() {
        let toks = tokens("class struct field method ctor dtor static abstract");
        assert_eq!(
            toks,
            vec![
                Token::Class,
                Token::Struct,
                Token::Field,
                Token::Method,
                Token::Ctor,
                Token::Dtor,
                Token::Static,
                Token::Abstract,
            ]
        );
    }

    #[test]
    fn test_literals() {
        let toks = tokens(r#"42 3.14 "hello\n" 'x'"#);
        assert_eq!(toks[0], Token::IntLiteral("42".to_string()));
        assert_eq!(toks[1], Token::FloatLiteral(3.14));
        assert_eq!(toks[2], Token::StringLiteral("hello\n".to_string()));
        assert_eq!(toks[3], Token::CharLiteral('x'));
    }

    #[test]
    fn test_operators_without_spaces() {
        let toks = tokens("1+2");
        assert_eq!(
            toks,
            vec![
                Token::IntLiteral("1".to_string()),
                Token::Plus,
                Token::IntLiteral("2".to_string()),
            ]
        );
    }

    #[test]
    fn test_typeref_punctuation() {
        // a:[int]?   (array of int, failable)
        let toks = tokens("a:[int]?");
        assert_eq!(toks[0], Token::Ident("a".to_string()));
        assert_eq!(toks[1], Token::Colon);
        assert_eq!(toks[2], Token::LBracket);
        assert_eq!(toks[3], Token::Ident("int".to_string()));
        assert_eq!(toks[4], Token::RBracket);
        assert_eq!(toks[5], Token::FailableSuffix);
    }

    #[test]
    fn test_identity_comparison_vs_assignment() {
        let toks = tokens("a === b = c");
        assert_eq!(toks[1], Token::IdentityComparison);
        assert_eq!(toks[3], Token::Assignment);
    }

    #[test]
    fn test_auto_assignment_form() {
        // a:=(A create);  lexes as ident, colon, '=', '(' ...
        let toks = tokens("a:=(A create);");
        assert_eq!(toks[0], Token::Ident("a".to_string()));
        assert_eq!(toks[1], Token::Colon);
        assert_eq!(toks[2], Token::Assignment);
        assert_eq!(toks[3], Token::LParen);
    }

    #[test]
    fn test_ccode_fragment() {
        let toks = tokens("@ printf(\"hi\"); @");
        assert_eq!(toks[0], Token::CCode(" printf(\"hi\"); ".to_string()));
    }

    #[test]
    fn test_comments_skipped() {
        let toks = tokens("class // trailing\n/* block */ A");
        assert_eq!(toks, vec![Token::Class, Token::Ident("A".to_string())]);
    }

    #[test]
    fn test_line_numbers() {
        let spans: Vec<_> = Lexer::new("class\nA\n{").map(|r| r.unwrap()).collect();
        assert_eq!(spans[0].line, 1);
        assert_eq!(spans[1].line, 2);
        assert_eq!(spans[2].line, 3);
    }
}
