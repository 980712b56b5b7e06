// Class-level declarations: classes, structs, interfaces, extensions,
// enums, aliases and their members.

use super::Parser;
use crate::ParseError;
use skizo_ast::*;
use skizo_lexer::Token;

impl<'a> Parser<'a> {
    pub(crate) fn parse_class_decl(&mut self) -> Result<ClassDecl, ParseError> {
        let line = self.line();
        let attrs = self.parse_attrs()?;

        let mut is_static = false;
        let mut is_abstract = false;
        loop {
            if self.match_token(&Token::Static) {
                is_static = true;
            } else if self.match_token(&Token::Abstract) {
                is_abstract = true;
            } else {
                break;
            }
        }

        let kind = if self.match_token(&Token::Class) {
            ClassDeclKind::Class
        } else if self.match_token(&Token::Struct) {
            ClassDeclKind::Struct
        } else if self.match_token(&Token::Interface) {
            ClassDeclKind::Interface
        } else if self.match_token(&Token::Extend) {
            ClassDeclKind::Extension
        } else if self.match_token(&Token::Enum) {
            ClassDeclKind::Enum
        } else if self.match_token(&Token::Alias) {
            return self.parse_alias_decl(attrs, line);
        } else {
            return Err(self.error(
                "Expected top-level declaration (class, struct, interface, extend, enum, alias, import, force)",
            ));
        };

        let name = self.consume_identifier("Expected a name for the declaration")?;

        let base = if self.match_token(&Token::Colon) {
            Some(self.parse_typeref()?)
        } else {
            None
        };

        let mut decl = ClassDecl {
            kind,
            name,
            base,
            is_static,
            is_abstract,
            attrs,
            fields: Vec::new(),
            methods: Vec::new(),
            consts: Vec::new(),
            events: Vec::new(),
            enum_items: Vec::new(),
            line,
        };

        self.consume(&Token::LBrace, "Expected '{'")?;

        if kind == ClassDeclKind::Enum {
            while !self.check(&Token::RBrace) && !self.is_at_end() {
                let item = self.consume_identifier("Expected an enum item name")?;
                decl.enum_items.push(item);
                // Items are ';'-separated; the final separator is optional.
                if !self.match_token(&Token::Semicolon) {
                    break;
                }
            }
        } else {
            while !self.check(&Token::RBrace) && !self.is_at_end() {
                self.parse_member(&mut decl)?;
            }
        }

        self.consume(&Token::RBrace, "Expected '}'")?;
        Ok(decl)
    }

    fn parse_alias_decl(
        &mut self,
        attrs: Vec<AttrDecl>,
        line: u32,
    ) -> Result<ClassDecl, ParseError> {
        let name = self.consume_identifier("Expected an alias name")?;
        self.consume(&Token::Assignment, "Expected '=' in alias declaration")?;
        let target = self.parse_typeref()?;
        self.consume(&Token::Semicolon, "Expected ';' after alias declaration")?;

        Ok(ClassDecl {
            kind: ClassDeclKind::Alias,
            name,
            base: Some(target),
            is_static: false,
            is_abstract: false,
            attrs,
            fields: Vec::new(),
            methods: Vec::new(),
            consts: Vec::new(),
            events: Vec::new(),
            enum_items: Vec::new(),
            line,
        })
    }

    /// `[key=value]` lists. Values may be identifiers, string literals or
    /// integers; they are all recorded as raw text.
    pub(crate) fn parse_attrs(&mut self) -> Result<Vec<AttrDecl>, ParseError> {
        let mut attrs = Vec::new();
        while self.check(&Token::LBracket) {
            self.advance();
            let name = self.consume_identifier("Expected an attribute name")?;
            let value = if self.match_token(&Token::Assignment) {
                match self.peek_span().map(|t| t.token.clone()) {
                    Some(Token::Ident(s)) => {
                        self.advance();
                        s
                    }
                    Some(Token::StringLiteral(s)) => {
                        self.advance();
                        s
                    }
                    Some(Token::IntLiteral(s)) => {
                        self.advance();
                        s
                    }
                    _ => return Err(self.error("Expected an attribute value")),
                }
            } else {
                String::new()
            };
            self.consume(&Token::RBracket, "Expected ']' after attribute")?;
            attrs.push(AttrDecl { name, value });
        }
        Ok(attrs)
    }

    fn parse_member(&mut self, decl: &mut ClassDecl) -> Result<(), ParseError> {
        let line = self.line();
        let attrs = self.parse_attrs()?;

        let mut access = None;
        let mut is_static = false;
        let mut is_abstract = false;
        let mut is_unsafe = false;
        let mut is_native = false;
        loop {
            if self.match_token(&Token::Private) {
                access = Some(Access::Private);
            } else if self.match_token(&Token::Protected) {
                access = Some(Access::Protected);
            } else if self.match_token(&Token::Public) {
                access = Some(Access::Public);
            } else if self.match_token(&Token::Internal) {
                access = Some(Access::Internal);
            } else if self.match_token(&Token::Static) {
                is_static = true;
            } else if self.match_token(&Token::Abstract) {
                is_abstract = true;
            } else if self.match_token(&Token::Unsafe) {
                is_unsafe = true;
            } else if self.match_token(&Token::Native) {
                is_native = true;
            } else {
                break;
            }
        }

        if self.match_token(&Token::Field) {
            let name = self.consume_identifier("Expected a field name")?;
            self.consume(&Token::Colon, "Expected ':' after field name")?;
            let ty = self.parse_typeref()?;
            self.consume(&Token::Semicolon, "Expected ';' after field declaration")?;
            decl.fields.push(FieldDecl {
                access: access.unwrap_or(Access::Private),
                is_static,
                name,
                ty,
                attrs,
                line,
            });
            return Ok(());
        }

        if self.match_token(&Token::Const) {
            let name = self.consume_identifier("Expected a const name")?;
            let explicit_ty = if self.match_token(&Token::Colon) {
                Some(self.parse_typeref()?)
            } else {
                None
            };
            self.consume(&Token::Assignment, "Expected '=' in const declaration")?;
            let (value, inferred_ty) = self.parse_const_value()?;
            self.consume(&Token::Semicolon, "Expected ';' after const declaration")?;
            decl.consts.push(ConstDecl {
                access: access.unwrap_or(Access::Public),
                name,
                ty: explicit_ty.unwrap_or(inferred_ty),
                value,
                line,
            });
            return Ok(());
        }

        if self.match_token(&Token::Event) {
            let name = self.consume_identifier("Expected an event name")?;
            self.consume(&Token::Colon, "Expected ':' after event name")?;
            let handler = self.parse_typeref()?;
            self.consume(&Token::Semicolon, "Expected ';' after event declaration")?;
            decl.events.push(EventDecl {
                access: access.unwrap_or(Access::Public),
                name,
                handler,
                line,
            });
            return Ok(());
        }

        if self.match_token(&Token::Property) {
            return self.parse_auto_property(decl, access, line);
        }

        if self.match_token(&Token::Method) {
            let name = self.consume_identifier("Expected a method name")?;
            // Interface methods carry no bodies.
            let is_abstract = is_abstract || decl.kind == ClassDeclKind::Interface;
            let mut method = MethodDecl {
                access: access.unwrap_or(Access::Public),
                kind: MethodDeclKind::Normal,
                name,
                is_static,
                is_abstract,
                is_unsafe,
                is_native,
                params: Vec::new(),
                ret: TypeRef::void(),
                attrs,
                body: None,
                line,
            };
            self.parse_method_sig(&mut method)?;
            self.parse_method_tail(&mut method)?;
            decl.methods.push(method);
            return Ok(());
        }

        if self.match_token(&Token::Ctor) {
            // Instance ctors are named (`ctor create(...)`); the static ctor
            // and dtors are nameless.
            let name = if is_static {
                String::new()
            } else {
                self.consume_identifier("Expected a constructor name")?
            };
            let mut method = MethodDecl {
                access: access.unwrap_or(Access::Public),
                kind: MethodDeclKind::Ctor,
                name,
                is_static,
                is_abstract: false,
                is_unsafe,
                is_native,
                params: Vec::new(),
                ret: TypeRef::void(),
                attrs,
                body: None,
                line,
            };
            self.parse_method_sig(&mut method)?;
            self.parse_method_tail(&mut method)?;
            decl.methods.push(method);
            return Ok(());
        }

        if self.match_token(&Token::Dtor) {
            let mut method = MethodDecl {
                access: access.unwrap_or(Access::Public),
                kind: MethodDeclKind::Dtor,
                name: String::new(),
                is_static,
                is_abstract: false,
                is_unsafe,
                is_native,
                params: Vec::new(),
                ret: TypeRef::void(),
                attrs,
                body: None,
                line,
            };
            self.parse_method_tail(&mut method)?;
            decl.methods.push(method);
            return Ok(());
        }

        Err(self.error("Expected a member (field, method, ctor, dtor, const, event, property)"))
    }

    /// Parses `(a:int b:float)` and `: ret`. Both are optional: `method main {`
    /// declares a parameterless void method. Params have no separators.
    fn parse_method_sig(&mut self, method: &mut MethodDecl) -> Result<(), ParseError> {
        if self.match_token(&Token::LParen) {
            while !self.check(&Token::RParen) {
                let name = self.consume_identifier("Expected a parameter name or ')'")?;
                if method.params.iter().any(|p| p.name == name) {
                    return Err(self.error("Duplicate param name"));
                }
                self.consume(&Token::Colon, "Expected ':' after parameter name")?;
                let ty = self.parse_typeref()?;
                method.params.push(ParamDecl { name, ty });
            }
            self.consume(&Token::RParen, "Expected ')'")?;
        }

        if method.kind == MethodDeclKind::Normal && self.match_token(&Token::Colon) {
            method.ret = self.parse_typeref()?;
        }
        Ok(())
    }

    /// Either a `{ ... }` body, or `;` for abstract/native methods.
    fn parse_method_tail(&mut self, method: &mut MethodDecl) -> Result<(), ParseError> {
        if method.is_abstract || method.is_native {
            self.consume(&Token::Semicolon, "Expected ';' after a bodiless method")?;
            return Ok(());
        }
        let ret = method.ret.clone();
        let is_unsafe = method.is_unsafe;
        method.body = Some(self.parse_method_body(ret, is_unsafe)?);
        Ok(())
    }

    /// `property name: T;` expands to a private backing field plus a
    /// getter/setter pair, the way hand-written accessors would look.
    fn parse_auto_property(
        &mut self,
        decl: &mut ClassDecl,
        access: Option<Access>,
        line: u32,
    ) -> Result<(), ParseError> {
        let name = self.consume_identifier("Expected a property name")?;
        self.consume(&Token::Colon, "Expected ':' after property name")?;
        let ty = self.parse_typeref()?;
        self.consume(&Token::Semicolon, "Expected ';' after property declaration")?;

        let field_name = format!("m_{}", name);
        decl.fields.push(FieldDecl {
            access: Access::Private,
            is_static: false,
            name: field_name.clone(),
            ty: ty.clone(),
            attrs: Vec::new(),
            line,
        });

        let ident = |n: &str| {
            Expr::new(
                ExprKind::Ident(IdentExpr {
                    name: n.to_string(),
                    type_at_decl: None,
                    is_auto: false,
                    resolved: None,
                }),
                line,
            )
        };

        let mut getter_body = Body::new();
        getter_body.exprs.push(Expr::new(
            ExprKind::Return(Box::new(ident(&field_name))),
            line,
        ));
        getter_body.return_already_defined = true;
        decl.methods.push(MethodDecl {
            access: access.unwrap_or(Access::Public),
            kind: MethodDeclKind::Normal,
            name: name.clone(),
            is_static: false,
            is_abstract: false,
            is_unsafe: false,
            is_native: false,
            params: Vec::new(),
            ret: ty.clone(),
            attrs: Vec::new(),
            body: Some(getter_body),
            line,
        });

        let mut setter_body = Body::new();
        setter_body.exprs.push(Expr::new(
            ExprKind::Assignment {
                left: Box::new(ident(&field_name)),
                right: Box::new(ident("value")),
            },
            line,
        ));
        let setter_name = format!(
            "set{}{}",
            name.chars().next().unwrap_or('_').to_uppercase(),
            name.chars().skip(1).collect::<String>()
        );
        decl.methods.push(MethodDecl {
            access: access.unwrap_or(Access::Public),
            kind: MethodDeclKind::Normal,
            name: setter_name,
            is_static: false,
            is_abstract: false,
            is_unsafe: false,
            is_native: false,
            params: vec![ParamDecl {
                name: "value".to_string(),
                ty,
            }],
            ret: TypeRef::void(),
            attrs: Vec::new(),
            body: Some(setter_body),
            line,
        });

        Ok(())
    }

    fn parse_const_value(&mut self) -> Result<(ConstValue, TypeRef), ParseError> {
        let negative = self.match_token(&Token::Minus);
        let Some(token) = self.peek_span().map(|t| t.token.clone()) else {
            return Err(self.error("Expected a literal constant value"));
        };
        match token {
            Token::IntLiteral(text) => {
                self.advance();
                let value: i32 = text
                    .parse()
                    .map_err(|_| self.error("Integer constant out of range"))?;
                let value = if negative { -value } else { value };
                Ok((ConstValue::Int(value), TypeRef::int()))
            }
            Token::FloatLiteral(value) => {
                self.advance();
                let value = if negative { -value } else { value };
                Ok((ConstValue::Float(value), TypeRef::float()))
            }
            Token::True => {
                self.advance();
                Ok((ConstValue::Bool(true), TypeRef::bool_()))
            }
            Token::False => {
                self.advance();
                Ok((ConstValue::Bool(false), TypeRef::bool_()))
            }
            Token::CharLiteral(c) => {
                self.advance();
                Ok((ConstValue::Char(c), TypeRef::char_()))
            }
            Token::StringLiteral(s) => {
                self.advance();
                Ok((ConstValue::String(s), TypeRef::object("string")))
            }
            _ => Err(self.error("Expected a literal constant value")),
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
    fn test_class_with_field_and_method() {
        let unit = parse("class A { field x:int; method get:int { return x; } }");
        let decl = &unit.decls[0];
        assert_eq!(decl.name, "A");
        assert_eq!(decl.fields.len(), 1);
        assert_eq!(decl.fields[0].ty, TypeRef::int());
        assert_eq!(decl.methods.len(), 1);
        assert_eq!(decl.methods[0].ret, TypeRef::int());
    }

    #[test]
    fn test_struct_and_interface() {
        let unit = parse("struct V { field x:float; } interface I { method run; }");
        assert_eq!(unit.decls[0].kind, ClassDeclKind::Struct);
        assert_eq!(unit.decls[1].kind, ClassDeclKind::Interface);
    }

    #[test]
    fn test_abstract_method_has_no_body() {
        let unit = parse("class A { abstract method run; }");
        let m = &unit.decls[0].methods[0];
        assert!(m.is_abstract);
        assert!(m.body.is_none());
    }

    #[test]
    fn test_enum_items() {
        let unit = parse("enum Color { Red; Green; Blue }");
        assert_eq!(unit.decls[0].enum_items, vec!["Red", "Green", "Blue"]);
    }

    #[test]
    fn test_alias() {
        let unit = parse("alias Money = int;");
        let decl = &unit.decls[0];
        assert_eq!(decl.kind, ClassDeclKind::Alias);
        assert_eq!(decl.base, Some(TypeRef::int()));
    }

    #[test]
    fn test_attrs() {
        let unit = parse("class A { [module=libm] [callConv=stdcall] native method cosf(x:float):float; }");
        let m = &unit.decls[0].methods[0];
        assert_eq!(m.attrs[0].name, "module");
        assert_eq!(m.attrs[0].value, "libm");
        assert_eq!(m.attrs[1].value, "stdcall");
        assert!(m.is_native);
    }

    #[test]
    fn test_nativesize_blob_attr() {
        let unit = parse("[nativeSize=8] struct Pair { }");
        assert_eq!(unit.decls[0].attrs[0].name, "nativeSize");
        assert_eq!(unit.decls[0].attrs[0].value, "8");
    }

    #[test]
    fn test_ctor_dtor() {
        let unit = parse("class A { ctor create { } dtor { } static ctor { } }");
        let methods = &unit.decls[0].methods;
        assert_eq!(methods[0].kind, MethodDeclKind::Ctor);
        assert_eq!(methods[0].name, "create");
        assert_eq!(methods[1].kind, MethodDeclKind::Dtor);
        assert!(methods[2].is_static);
        assert_eq!(methods[2].kind, MethodDeclKind::Ctor);
    }

    #[test]
    fn test_params_without_separators() {
        let unit = parse("class A { method add(a:int b:int):int { return (a + b); } }");
        let m = &unit.decls[0].methods[0];
        assert_eq!(m.params.len(), 2);
        assert_eq!(m.params[1].name, "b");
    }

    #[test]
    fn test_auto_property_expands() {
        let unit = parse("class A { property size: int; }");
        let decl = &unit.decls[0];
        assert_eq!(decl.fields[0].name, "m_size");
        let names: Vec<_> = decl.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["size", "setSize"]);
    }

    #[test]
    fn test_event_member() {
        let unit = parse("class A { event changed: Action; }");
        assert_eq!(unit.decls[0].events[0].name, "changed");
    }

    #[test]
    fn test_base_class() {
        let unit = parse("class B: A { }");
        assert_eq!(unit.decls[0].base, Some(TypeRef::object("A")));
    }
}
