// Method body parsing.
//
// A body is a sequence of statements, each of which is a call expression:
// an ordered list of sub-expressions terminated by ';'. Parentheses nest
// call expressions; brackets build array initializers. Keywords like
// return/cast/abort enter the element list as markers and the completed
// list is reconstructed into the proper expression kind when the call
// closes. The parser stays semantics-agnostic: identifiers are resolved by
// the transformer later.

use super::Parser;
use crate::ParseError;
use skizo_ast::*;
use skizo_lexer::Token;

/// An element of an in-flight call expression. Marker variants are
/// reconstructed into real expressions when the call completes.
enum Elem {
    Expr(Expr),
    Return,
    Cast(TypeRef),
    Sizeof(TypeRef),
    Abort,
    Assert,
    Ref,
    ArrayCreation,
    ArrayInit,
    Assignment,
    Is(TypeRef),
    IdentityComparison,
    Break,
}

impl Elem {
    fn is_operator_ident(&self) -> bool {
        match self {
            Elem::Expr(e) => match &e.kind {
                ExprKind::Ident(id) => {
                    matches!(
                        id.name.as_str(),
                        "+" | "-" | "*" | "/" | "%" | ">" | "<" | "==" | "|" | "&"
                    )
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn is_value(&self) -> bool {
        matches!(self, Elem::Expr(_)) && !self.is_operator_ident()
    }
}

struct PendingCall {
    elems: Vec<Elem>,
    is_marked: bool,
    line: u32,
}

impl PendingCall {
    fn new(line: u32) -> Self {
        PendingCall {
            elems: Vec::new(),
            is_marked: false,
            line,
        }
    }
}

impl<'a> Parser<'a> {
    /// Parses `{ statements }` into a Body. `ret` is the declared return
    /// type of the owning method; `in_unsafe` gates inline C code.
    pub(crate) fn parse_method_body(
        &mut self,
        ret: TypeRef,
        in_unsafe: bool,
    ) -> Result<Body, ParseError> {
        self.consume(&Token::LBrace, "Expected '{'")?;

        let mut call_stack: Vec<PendingCall> = Vec::new();
        let mut body_stack: Vec<Body> = Vec::new();

        let mut cur_body = Body::new();
        cur_body.ret = ret;
        let mut cur_call = PendingCall::new(self.line());

        loop {
            if self.is_at_end() {
                return Err(self.error("Unexpected end of stream; method body expected"));
            }
            let line = self.line();
            let token = self.advance().clone();

            match token {
                Token::Ident(name) => {
                    // Peek whether this identifier is typed at this point:
                    // `x: T = ...` or `x := ...`.
                    if self.check(&Token::Colon) {
                        if cur_call.elems.len() == 1 {
                            return Err(self.error("Trying to type a method name"));
                        }
                        self.advance(); // the colon

                        let ident = if self.check(&Token::Auto) || self.check(&Token::Assignment) {
                            if self.check(&Token::Auto) {
                                self.advance();
                            }
                            IdentExpr {
                                name,
                                type_at_decl: None,
                                is_auto: true,
                                resolved: None,
                            }
                        } else {
                            let ty = self.parse_typeref()?;
                            IdentExpr {
                                name,
                                type_at_decl: Some(ty),
                                is_auto: false,
                                resolved: None,
                            }
                        };

                        // Typed vars are only allowed to be lvalues of assignment.
                        let is_lvalue = cur_call.elems.is_empty() && self.check(&Token::Assignment);
                        if !is_lvalue {
                            return Err(
                                self.error("Typed variables can only be lvalues of assignment")
                            );
                        }

                        cur_call
                            .elems
                            .push(Elem::Expr(Expr::new(ExprKind::Ident(ident), line)));
                    } else {
                        cur_call.elems.push(Elem::Expr(Expr::new(
                            ExprKind::Ident(IdentExpr {
                                name,
                                type_at_decl: None,
                                is_auto: false,
                                resolved: None,
                            }),
                            line,
                        )));
                    }
                }
                Token::IntLiteral(text) => {
                    let value: i32 = text
                        .parse()
                        .map_err(|_| self.error("Integer literal out of range"))?;
                    cur_call
                        .elems
                        .push(Elem::Expr(Expr::new(ExprKind::IntLit(value), line)));
                }
                Token::FloatLiteral(value) => {
                    cur_call
                        .elems
                        .push(Elem::Expr(Expr::new(ExprKind::FloatLit(value), line)));
                }
                Token::StringLiteral(value) => {
                    cur_call
                        .elems
                        .push(Elem::Expr(Expr::new(ExprKind::StringLit(value), line)));
                }
                Token::CharLiteral(value) => {
                    cur_call
                        .elems
                        .push(Elem::Expr(Expr::new(ExprKind::CharLit(value), line)));
                }
                Token::Null => {
                    cur_call
                        .elems
                        .push(Elem::Expr(Expr::new(ExprKind::NullLit, line)));
                }
                Token::True | Token::False => {
                    cur_call.elems.push(Elem::Expr(Expr::new(
                        ExprKind::BoolLit(token == Token::True),
                        line,
                    )));
                }
                Token::This => {
                    cur_call
                        .elems
                        .push(Elem::Expr(Expr::new(ExprKind::This, line)));
                }
                Token::Break => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'break' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::Break);
                }
                Token::Return => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'return' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::Return);
                }
                Token::Cast => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'cast' used in an inappropriate context"));
                    }
                    let target = self.parse_typeref()?;
                    cur_call.elems.push(Elem::Cast(target));
                    cur_call.is_marked = true;
                }
                Token::Sizeof => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'sizeof' used in an inappropriate context"));
                    }
                    let target = self.parse_typeref()?;
                    cur_call.elems.push(Elem::Sizeof(target));
                    cur_call.is_marked = true;
                }
                Token::Abort => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'abort' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::Abort);
                    cur_call.is_marked = true;
                }
                Token::Assert => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'assert' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::Assert);
                    cur_call.is_marked = true;
                }
                Token::Ref => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'ref' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::Ref);
                    cur_call.is_marked = true;
                }
                Token::NewArray => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'array' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::ArrayCreation);
                    cur_call.is_marked = true;
                }
                Token::Is => {
                    // 'is' must be at the second place in an unmarked call.
                    if cur_call.elems.len() != 1 || cur_call.is_marked {
                        return Err(self.error("'is' used in an inappropriate context"));
                    }
                    let target = self.parse_typeref()?;
                    cur_call.elems.push(Elem::Is(target));
                    cur_call.is_marked = true;
                }
                Token::IdentityComparison => {
                    if cur_call.elems.len() != 1 || cur_call.is_marked {
                        return Err(self.error("'===' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::IdentityComparison);
                    cur_call.is_marked = true;
                }
                Token::Assignment => {
                    if cur_call.elems.len() != 1 || cur_call.is_marked {
                        return Err(self.error("'=' used in an inappropriate context"));
                    }
                    cur_call.elems.push(Elem::Assignment);
                    cur_call.is_marked = true;
                }
                Token::CCode(code) => {
                    if !in_unsafe {
                        return Err(self.error("Only unsafe contexts allow inline C code"));
                    }
                    if !cur_call.elems.is_empty() {
                        return Err(
                            self.error("Can't create a C code fragment inside a call expression")
                        );
                    }
                    cur_body.exprs.push(Expr::new(ExprKind::CCode(code), line));
                }
                Token::LParen => {
                    call_stack.push(cur_call);
                    cur_call = PendingCall::new(line);
                }
                Token::LBracket => {
                    call_stack.push(cur_call);
                    cur_call = PendingCall::new(line);
                    cur_call.elems.push(Elem::ArrayInit);
                    cur_call.is_marked = true;
                }
                Token::RParen => {
                    let mut prev = call_stack
                        .pop()
                        .ok_or_else(|| self.error("Parenthesis mismatch"))?;
                    if matches!(cur_call.elems.first(), Some(Elem::ArrayInit)) {
                        return Err(self.error("Expected ']', got ')'"));
                    }
                    let expr = self.complete_call(cur_call)?;
                    prev.elems.push(Elem::Expr(expr));
                    cur_call = prev;
                }
                Token::RBracket => {
                    let mut prev = call_stack
                        .pop()
                        .ok_or_else(|| self.error("Bracket mismatch"))?;
                    if !matches!(cur_call.elems.first(), Some(Elem::ArrayInit)) {
                        return Err(self.error("Expected ')', got ']'"));
                    }
                    let line = cur_call.line;
                    let mut items = Vec::new();
                    for elem in cur_call.elems.into_iter().skip(1) {
                        match elem {
                            Elem::Expr(e) => items.push(e),
                            _ => return Err(self.error("Unexpected marker in array initializer")),
                        }
                    }
                    // [] is not inferrable from its items; it becomes
                    // (array 0), whose type comes from the surroundings.
                    let expr = if items.is_empty() {
                        Expr::new(
                            ExprKind::ArrayCreation {
                                length: Box::new(Expr::new(ExprKind::IntLit(0), line)),
                            },
                            line,
                        )
                    } else {
                        Expr::new(
                            ExprKind::ArrayInit {
                                exprs: items,
                                helper_id: None,
                            },
                            line,
                        )
                    };
                    prev.elems.push(Elem::Expr(expr));
                    cur_call = prev;
                }
                Token::Semicolon => {
                    if cur_call.elems.is_empty() && !cur_call.is_marked {
                        return Err(self.error("Empty statement"));
                    }
                    let expr = self.complete_call(cur_call)?;
                    let is_return = matches!(expr.kind, ExprKind::Return(_));
                    if is_return && cur_body.return_already_defined {
                        return Err(self.error("Multiple return expressions are not allowed"));
                    }
                    cur_body.exprs.push(expr);
                    if is_return {
                        cur_body.return_already_defined = true;
                    }
                    cur_call = PendingCall::new(self.line());
                }
                Token::Method => {
                    // Anonymous method (closure) literal.
                    body_stack.push(cur_body);
                    cur_body = Body::new();
                    call_stack.push(cur_call);
                    cur_call = PendingCall::new(line);

                    // Optional params and return type: method (x:int): int {
                    if self.match_token(&Token::LParen) {
                        while !self.check(&Token::RParen) {
                            let name =
                                self.consume_identifier("Expected a parameter name or ')'")?;
                            self.consume(&Token::Colon, "Expected ':' after parameter name")?;
                            let ty = self.parse_typeref()?;
                            cur_body.params.push(ParamDecl { name, ty });
                        }
                        self.consume(&Token::RParen, "Expected ')'")?;
                    }
                    if self.match_token(&Token::Colon) {
                        cur_body.ret = self.parse_typeref()?;
                    }
                    self.consume(&Token::LBrace, "Expected '{' after closure signature")?;
                }
                Token::RBrace => {
                    if !cur_call.elems.is_empty() || cur_call.is_marked {
                        return Err(self.error("'}', found before the statement was terminated"));
                    }
                    // A method that returns a value must end with a return
                    // expression (or inline C code in unsafe contexts).
                    if !cur_body.ret.is_void() && !body_has_valid_last_expr(&cur_body) {
                        return Err(self.error(
                            "In a method which returns a value, the last expression must be a return expression",
                        ));
                    }

                    match body_stack.pop() {
                        None => {
                            if !call_stack.is_empty() {
                                return Err(self.error("Parenthesis mismatch"));
                            }
                            return Ok(cur_body);
                        }
                        Some(prev_body) => {
                            let closed = cur_body;
                            cur_body = prev_body;
                            cur_call = call_stack
                                .pop()
                                .ok_or_else(|| self.error("Brace mismatch"))?;
                            cur_call
                                .elems
                                .push(Elem::Expr(Expr::new(ExprKind::Body(closed), line)));
                        }
                    }
                }
                other => {
                    if let Some(op) = other.operator_name() {
                        cur_call.elems.push(Elem::Expr(Expr::new(
                            ExprKind::Ident(IdentExpr {
                                name: op.to_string(),
                                type_at_decl: None,
                                is_auto: false,
                                resolved: None,
                            }),
                            line,
                        )));
                    } else {
                        return Err(self.error(&format!(
                            "Unexpected token {:?} in method body",
                            other
                        )));
                    }
                }
            }
        }
    }

    /// Completes a call expression: folds infix operator runs, reconstructs
    /// marker forms, and validates the generic call shape.
    fn complete_call(&self, mut call: PendingCall) -> Result<Expr, ParseError> {
        fold_operator_runs(&mut call.elems);
        let line = call.line;

        // Marker at the head?
        match call.elems.first() {
            Some(Elem::Return) => {
                let mut it = call.elems.into_iter().skip(1);
                let arg = match (it.next(), it.next()) {
                    (Some(Elem::Expr(e)), None) => e,
                    _ => return Err(self.error("Return expression requires 1 argument")),
                };
                return Ok(Expr::new(ExprKind::Return(Box::new(arg)), line));
            }
            Some(Elem::Cast(_)) => {
                let mut it = call.elems.into_iter();
                let target = match it.next() {
                    Some(Elem::Cast(t)) => t,
                    _ => unreachable!(),
                };
                let arg = match (it.next(), it.next()) {
                    (Some(Elem::Expr(e)), None) => e,
                    _ => return Err(self.error("Cast expression requires 2 arguments")),
                };
                return Ok(Expr::new(
                    ExprKind::Cast {
                        target,
                        expr: Box::new(arg),
                        info: None,
                    },
                    line,
                ));
            }
            Some(Elem::Sizeof(_)) => {
                if call.elems.len() != 1 {
                    return Err(self.error("Sizeof expression requires 1 argument"));
                }
                let target = match call.elems.into_iter().next() {
                    Some(Elem::Sizeof(t)) => t,
                    _ => unreachable!(),
                };
                return Ok(Expr::new(ExprKind::Sizeof { target }, line));
            }
            Some(Elem::Abort) => {
                let mut it = call.elems.into_iter().skip(1);
                let arg = match (it.next(), it.next()) {
                    (Some(Elem::Expr(e)), None) => e,
                    _ => return Err(self.error("Abort expression requires 1 argument")),
                };
                return Ok(Expr::new(ExprKind::Abort(Box::new(arg)), line));
            }
            Some(Elem::Assert) => {
                let mut it = call.elems.into_iter().skip(1);
                let arg = match (it.next(), it.next()) {
                    (Some(Elem::Expr(e)), None) => e,
                    _ => return Err(self.error("Assert expression requires 1 argument")),
                };
                return Ok(Expr::new(ExprKind::Assert(Box::new(arg)), line));
            }
            Some(Elem::Ref) => {
                let mut it = call.elems.into_iter().skip(1);
                let arg = match (it.next(), it.next()) {
                    (Some(Elem::Expr(e)), None) => e,
                    _ => return Err(self.error("Ref expression requires 1 argument")),
                };
                return Ok(Expr::new(ExprKind::Ref(Box::new(arg)), line));
            }
            Some(Elem::ArrayCreation) => {
                let mut it = call.elems.into_iter().skip(1);
                let arg = match (it.next(), it.next()) {
                    (Some(Elem::Expr(e)), None) => e,
                    _ => return Err(self.error("Array expression requires 1 argument")),
                };
                return Ok(Expr::new(
                    ExprKind::ArrayCreation {
                        length: Box::new(arg),
                    },
                    line,
                ));
            }
            Some(Elem::Break) => {
                if call.elems.len() != 1 {
                    return Err(self.error("'break' takes no arguments"));
                }
                return Ok(Expr::new(ExprKind::Break, line));
            }
            _ => {}
        }

        // Marker at the second position?
        if call.elems.len() >= 2 {
            match &call.elems[1] {
                Elem::Is(_) => {
                    if call.elems.len() != 2 {
                        return Err(self.error("'is' expression requires 2 elements"));
                    }
                    let mut it = call.elems.into_iter();
                    let subject = match it.next() {
                        Some(Elem::Expr(e)) => e,
                        _ => return Err(self.error("'is' requires a value on the left")),
                    };
                    let target = match it.next() {
                        Some(Elem::Is(t)) => t,
                        _ => unreachable!(),
                    };
                    return Ok(Expr::new(
                        ExprKind::Is {
                            expr: Box::new(subject),
                            target,
                        },
                        line,
                    ));
                }
                Elem::IdentityComparison => {
                    if call.elems.len() != 3 {
                        return Err(self.error("Identity comparison requires 3 elements"));
                    }
                    let mut it = call.elems.into_iter();
                    let left = match it.next() {
                        Some(Elem::Expr(e)) => e,
                        _ => return Err(self.error("'===' requires a value on the left")),
                    };
                    it.next(); // the marker
                    let right = match it.next() {
                        Some(Elem::Expr(e)) => e,
                        _ => return Err(self.error("'===' requires a value on the right")),
                    };
                    return Ok(Expr::new(
                        ExprKind::IdentityComparison {
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        line,
                    ));
                }
                Elem::Assignment => {
                    if call.elems.len() != 3 {
                        return Err(self.error("Assignment expression requires 3 elements"));
                    }
                    let mut it = call.elems.into_iter();
                    let left = match it.next() {
                        Some(Elem::Expr(e)) if matches!(e.kind, ExprKind::Ident(_)) => e,
                        _ => {
                            return Err(self.error(
                            "Left value of an assignment should be a local, this object's field or param",
                        ))
                        }
                    };
                    it.next(); // the marker
                    let right = match it.next() {
                        Some(Elem::Expr(e)) => e,
                        _ => return Err(self.error("Assignment requires a value on the right")),
                    };
                    return Ok(Expr::new(
                        ExprKind::Assignment {
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        line,
                    ));
                }
                _ => {}
            }
        }

        // A single parenthesized value is plain grouping.
        if call.elems.len() == 1 {
            if let Some(Elem::Expr(_)) = call.elems.first() {
                match call.elems.into_iter().next() {
                    Some(Elem::Expr(e)) => return Ok(e),
                    _ => unreachable!(),
                }
            }
        }

        // Plain call expression: (target method args...) or (method args...).
        if call.elems.len() < 2 {
            return Err(
                self.error("A call expression requires at least 2 elements (object and method)")
            );
        }

        let second_is_name = matches!(
            &call.elems[1],
            Elem::Expr(Expr {
                kind: ExprKind::Ident(_) | ExprKind::StringLit(_),
                ..
            })
        );
        let first_is_ident = matches!(
            &call.elems[0],
            Elem::Expr(Expr {
                kind: ExprKind::Ident(_),
                ..
            })
        );
        if !second_is_name && !first_is_ident {
            return Err(self.error("Second argument in a call expression must be a method name"));
        }

        let mut exprs = Vec::with_capacity(call.elems.len());
        for elem in call.elems {
            match elem {
                Elem::Expr(e) => exprs.push(e),
                _ => return Err(self.error("Unexpected marker in call expression")),
            }
        }

        Ok(Expr::new(ExprKind::Call(CallExpr::unresolved(exprs)), line))
    }
}

fn body_has_valid_last_expr(body: &Body) -> bool {
    match body.exprs.last() {
        None => false,
        // Unsafe methods may end in inline C instead of a return.
        Some(e) => matches!(e.kind, ExprKind::Return(_) | ExprKind::CCode(_)),
    }
}

/// Folds maximal `value op value` runs left-associatively so that
/// `print 1 + 2` and `x = 1 + 2` work without extra parentheses. A bare
/// 3-element list is already a valid operator call and stays untouched.
fn fold_operator_runs(elems: &mut Vec<Elem>) {
    if matches!(elems.first(), Some(Elem::ArrayInit)) {
        return;
    }

    while elems.len() > 3 {
        let mut folded = false;
        for i in 0..elems.len().saturating_sub(2) {
            if elems[i].is_value() && elems[i + 1].is_operator_ident() && elems[i + 2].is_value() {
                let right = match elems.remove(i + 2) {
                    Elem::Expr(e) => e,
                    _ => unreachable!(),
                };
                let op = match elems.remove(i + 1) {
                    Elem::Expr(e) => e,
                    _ => unreachable!(),
                };
                let left = match elems.remove(i) {
                    Elem::Expr(e) => e,
                    _ => unreachable!(),
                };
                let line = left.line;
                elems.insert(
                    i,
                    Elem::Expr(Expr::new(
                        ExprKind::Call(CallExpr::unresolved(vec![left, op, right])),
                        line,
                    )),
                );
                folded = true;
                break;
            }
        }
        if !folded {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Parser;

    fn body_of(source: &str) -> Body {
        let unit = Parser::new("test", source).unwrap().parse_unit().unwrap();
        unit.decls[0].methods[0].body.clone().unwrap()
    }

    #[test]
    fn test_print_with_infix_operator() {
        // `print 1+2` folds into (print (1 + 2)).
        let body = body_of("class Program { static method main { print 1+2; } }");
        assert_eq!(body.exprs.len(), 1);
        match &body.exprs[0].kind {
            ExprKind::Call(call) => {
                assert_eq!(call.exprs.len(), 2);
                match &call.exprs[0].kind {
                    ExprKind::Ident(id) => assert_eq!(id.name, "print"),
                    other => panic!("expected ident head, got {:?}", other),
                }
                match &call.exprs[1].kind {
                    ExprKind::Call(inner) => {
                        assert_eq!(inner.exprs.len(), 3);
                        assert!(matches!(inner.exprs[0].kind, ExprKind::IntLit(1)));
                        assert!(matches!(inner.exprs[2].kind, ExprKind::IntLit(2)));
                    }
                    other => panic!("expected folded call, got {:?}", other),
                }
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_auto_local_assignment() {
        let body = body_of("class Program { static method main { a:=(A create); } }");
        match &body.exprs[0].kind {
            ExprKind::Assignment { left, right } => {
                match &left.kind {
                    ExprKind::Ident(id) => {
                        assert_eq!(id.name, "a");
                        assert!(id.is_auto);
                    }
                    other => panic!("expected ident lvalue, got {:?}", other),
                }
                assert!(matches!(right.kind, ExprKind::Call(_)));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_typed_local_assignment() {
        let body = body_of("class Program { static method main { x: int = 5; } }");
        match &body.exprs[0].kind {
            ExprKind::Assignment { left, .. } => match &left.kind {
                ExprKind::Ident(id) => {
                    assert_eq!(id.type_at_decl, Some(TypeRef::int()));
                }
                other => panic!("expected ident, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_return_statement() {
        let body = body_of("class A { method get:int { return 42; } }");
        assert!(body.return_already_defined);
        assert!(matches!(body.exprs[0].kind, ExprKind::Return(_)));
    }

    #[test]
    fn test_missing_return_is_an_error() {
        let result = Parser::new("test", "class A { method get:int { } }")
            .unwrap()
            .parse_unit();
        assert!(result.is_err());
    }

    #[test]
    fn test_nested_calls() {
        // (a foo (b bar) 3)
        let body = body_of("class A { method m { (a foo (b bar) 3); } }");
        match &body.exprs[0].kind {
            ExprKind::Call(call) => {
                assert_eq!(call.exprs.len(), 4);
                assert!(matches!(call.exprs[2].kind, ExprKind::Call(_)));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_array_init_and_empty_array() {
        let body = body_of("class A { method m { xs: [int] = [1 2 3]; ys: [int] = []; } }");
        match &body.exprs[0].kind {
            ExprKind::Assignment { right, .. } => match &right.kind {
                ExprKind::ArrayInit { exprs, .. } => assert_eq!(exprs.len(), 3),
                other => panic!("expected array init, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
        match &body.exprs[1].kind {
            ExprKind::Assignment { right, .. } => {
                assert!(matches!(right.kind, ExprKind::ArrayCreation { .. }))
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_cast_is_and_identity() {
        let body = body_of(
            "class A { method m { x := (cast int y); b := (x is Foo); c := (x === y); } }",
        );
        match &body.exprs[0].kind {
            ExprKind::Assignment { right, .. } => {
                assert!(matches!(right.kind, ExprKind::Cast { .. }))
            }
            _ => panic!(),
        }
        match &body.exprs[1].kind {
            ExprKind::Assignment { right, .. } => {
                assert!(matches!(right.kind, ExprKind::Is { .. }))
            }
            _ => panic!(),
        }
        match &body.exprs[2].kind {
            ExprKind::Assignment { right, .. } => {
                assert!(matches!(right.kind, ExprKind::IdentityComparison { .. }))
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_closure_literal() {
        let body = body_of("class A { method m { f := (method (x:int): int { return x; }); } }");
        match &body.exprs[0].kind {
            ExprKind::Assignment { right, .. } => match &right.kind {
                ExprKind::Body(b) => {
                    assert_eq!(b.params.len(), 1);
                    assert_eq!(b.ret, TypeRef::int());
                }
                other => panic!("expected closure body, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_abort_and_assert() {
        let body = body_of("class A { method m { abort \"bad\"; assert (x < 3); } }");
        assert!(matches!(body.exprs[0].kind, ExprKind::Abort(_)));
        assert!(matches!(body.exprs[1].kind, ExprKind::Assert(_)));
    }

    #[test]
    fn test_ccode_requires_unsafe() {
        let err = Parser::new("test", "class A { method m { @x@ } }")
            .unwrap()
            .parse_unit();
        assert!(err.is_err());

        let body = body_of("class A { unsafe method m { @x@ } }");
        assert!(matches!(body.exprs[0].kind, ExprKind::CCode(_)));
    }

    #[test]
    fn test_multiple_returns_rejected() {
        let result = Parser::new("test", "class A { method m:int { return 1; return 2; } }")
            .unwrap()
            .parse_unit();
        assert!(result.is_err());
    }

    #[test]
    fn test_paren_mismatch() {
        let result = Parser::new("test", "class A { method m { (a foo; } }")
            .unwrap()
            .parse_unit();
        assert!(result.is_err());
    }
}
