//! The per-method body walker: binds identifiers, infers types bottom-up,
//! resolves calls, inserts implicit conversions as explicit cast nodes,
//! lifts captured storage, and inlines branch forms.
//!
//! Inference is strict: nothing upcasts silently. Where an assignment,
//! argument or return needs a widening, the walker wraps the value in a
//! cast node labelled with its cast-info so the emitter sees every
//! conversion spelled out.

use crate::resolver::{
    get_or_create_array, get_or_create_boxed, is_reference_typeref, resolve_typeref, unalias,
};
use crate::{mangle, CompileError, CompileOptions};
use skizo_ast::{Access, Body, CallKind, CastInfo, Expr, ExprKind, ResolvedIdent};
use skizo_metadata::{
    Class, ClassId, Field, MemberRef, Metadata, Method, MethodId, MethodKind, PrimType,
    SpecialClass, TypeRef, OBJECT_HEADER_SIZE, WORD_SIZE,
};
use std::collections::HashSet;

pub struct TransformState {
    options: CompileOptions,
    method_stack: Vec<MethodId>,
    needs_env: HashSet<MethodId>,
    self_captured_roots: HashSet<MethodId>,
    anon_counter: u32,
    array_init_counter: u32,
}

struct Resolution {
    resolved: ResolvedIdent,
    ty: TypeRef,
}

impl TransformState {
    pub fn new(options: CompileOptions) -> Self {
        TransformState {
            options,
            method_stack: Vec::new(),
            needs_env: HashSet::new(),
            self_captured_roots: HashSet::new(),
            anon_counter: 0,
            array_init_counter: 0,
        }
    }

    fn err(&self, md: &Metadata, line: u32, message: impl Into<String>) -> CompileError {
        let module = self
            .method_stack
            .first()
            .map(|&m| md.class(md.method(m).declaring_class).module.clone())
            .unwrap_or_default();
        CompileError::transform(module, line, message)
    }

    fn current(&self) -> MethodId {
        *self.method_stack.last().expect("no method in transform")
    }

    fn root(&self) -> MethodId {
        *self.method_stack.first().expect("no method in transform")
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    pub fn transform_method(&mut self, md: &mut Metadata, mid: MethodId) -> Result<(), CompileError> {
        let Some(mut body) = md.method_mut(mid).body.take() else {
            return Ok(());
        };
        body.method = Some(mid);
        self.method_stack.push(mid);
        let result = self.transform_body_exprs(md, &mut body.exprs);
        self.method_stack.pop();
        md.method_mut(mid).body = Some(body);
        result
    }

    fn transform_body_exprs(
        &mut self,
        md: &mut Metadata,
        exprs: &mut [Expr],
    ) -> Result<(), CompileError> {
        for expr in exprs {
            self.transform_expr(md, expr)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expression dispatch
    // ------------------------------------------------------------------

    fn transform_expr(&mut self, md: &mut Metadata, expr: &mut Expr) -> Result<(), CompileError> {
        let line = expr.line;
        match &mut expr.kind {
            ExprKind::IntLit(_) => expr.inferred = self.prim_ty(md, "int"),
            ExprKind::FloatLit(_) => expr.inferred = self.prim_ty(md, "float"),
            ExprKind::BoolLit(_) => expr.inferred = self.prim_ty(md, "bool"),
            ExprKind::CharLit(_) => expr.inferred = self.prim_ty(md, "char"),
            ExprKind::StringLit(_) => expr.inferred = self.class_ty(md, "string"),
            ExprKind::NullLit => expr.inferred = self.class_ty(md, "any"),
            ExprKind::CCode(_) => expr.inferred = TypeRef::void(),
            ExprKind::Break => {
                expr.inferred = TypeRef::void();
                let root = self.root();
                md.method_mut(root).has_break_exprs = true;
            }
            ExprKind::This => {
                expr.inferred = self.resolve_this(md, line)?;
            }
            ExprKind::Ident(_) => {
                let ExprKind::Ident(ident) = &mut expr.kind else {
                    unreachable!()
                };
                if ident.is_auto || ident.type_at_decl.is_some() {
                    return Err(self.err(
                        md,
                        line,
                        "Typed variables can only be lvalues of assignment",
                    ));
                }
                let name = ident.name.clone();
                match self.resolve_ident(md, &name)? {
                    Some(resolution) => {
                        let ExprKind::Ident(ident) = &mut expr.kind else {
                            unreachable!()
                        };
                        ident.resolved = Some(resolution.resolved);
                        expr.inferred = resolution.ty;
                    }
                    None => {
                        let help = self.ident_suggestion(md, &name);
                        return Err(self.err(
                            md,
                            line,
                            format!("Unresolved identifier '{}'{}", name, help),
                        ));
                    }
                }
            }
            ExprKind::Call(_) => {
                let inferred = self.transform_call(md, expr)?;
                expr.inferred = inferred;
            }
            ExprKind::Assignment { .. } => {
                self.transform_assignment(md, expr)?;
            }
            ExprKind::Return(inner) => {
                let ret = md.method(self.current()).sig.ret.clone();
                if ret.is_void() {
                    return Err(self.err(md, line, "Returning a value from a void method"));
                }
                self.transform_expr(md, inner)?;
                self.insert_conversion(md, inner, &ret)?;
                expr.inferred = TypeRef::void();
            }
            ExprKind::Cast { .. } => {
                let (target_ty, mut inner_expr) = {
                    let ExprKind::Cast { target, expr: inner, .. } = &mut expr.kind else {
                        unreachable!()
                    };
                    resolve_typeref(md, target)?;
                    let inner_expr =
                        std::mem::replace(inner.as_mut(), Expr::new(ExprKind::NullLit, line));
                    (target.clone(), inner_expr)
                };
                self.transform_expr(md, &mut inner_expr)?;
                let from = inner_expr.inferred.clone();
                let computed = if self.types_equal(md, &from, &target_ty) {
                    CastInfo::Upcast
                } else {
                    match self.cast_info(md, &from, &target_ty)? {
                        Some(ci) => ci,
                        None => {
                            return Err(self.err(
                                md,
                                line,
                                format!("Cannot cast '{}' to '{}'", from, target_ty),
                            ))
                        }
                    }
                };
                let ExprKind::Cast { expr: inner, info, .. } = &mut expr.kind else {
                    unreachable!()
                };
                *inner.as_mut() = inner_expr;
                *info = Some(computed);
                expr.inferred = target_ty;
            }
            ExprKind::Is { expr: inner, target } => {
                resolve_typeref(md, target)?;
                self.transform_expr(md, inner)?;
                if !is_reference_typeref(md, &inner.inferred) {
                    return Err(self.err(md, line, "'is' requires a reference-typed value"));
                }
                expr.inferred = self.prim_ty(md, "bool");
            }
            ExprKind::Sizeof { target } => {
                resolve_typeref(md, target)?;
                expr.inferred = self.prim_ty(md, "int");
            }
            ExprKind::ArrayCreation { length } => {
                self.transform_expr(md, length)?;
                let int_ty = self.prim_ty(md, "int");
                self.insert_conversion(md, length, &int_ty)?;
                // The element type comes from the surroundings
                // (assignment, argument or return); void until then.
                expr.inferred = TypeRef::void();
            }
            ExprKind::ArrayInit { exprs, helper_id } => {
                if exprs.is_empty() {
                    return Err(self.err(md, line, "Empty array initializer"));
                }
                *helper_id = Some(self.array_init_counter);
                self.array_init_counter += 1;
                let ExprKind::ArrayInit { exprs, .. } = &mut expr.kind else {
                    unreachable!()
                };
                for e in exprs.iter_mut() {
                    self.transform_expr(md, e)?;
                }
                let elem_ty = exprs[0].inferred.clone();
                for e in exprs.iter() {
                    if !self.types_equal(md, &e.inferred, &elem_ty) {
                        return Err(self.err(
                            md,
                            e.line,
                            format!(
                                "Array items must share one exact type: expected '{}', found '{}'",
                                elem_ty, e.inferred
                            ),
                        ));
                    }
                }
                let array_class = get_or_create_array(md, &elem_ty)?;
                let mut array_ty = elem_ty.array_of();
                array_ty.resolved = Some(array_class);
                expr.inferred = array_ty;
            }
            ExprKind::IdentityComparison { left, right } => {
                self.transform_expr(md, left)?;
                self.transform_expr(md, right)?;
                let both_refs = is_reference_typeref(md, &left.inferred)
                    && is_reference_typeref(md, &right.inferred);
                // Same-class value types compare bitwise.
                let both_same_value = self.types_equal(md, &left.inferred, &right.inferred)
                    && left
                        .inferred
                        .resolved
                        .map(|id| md.class(id).is_value_type)
                        .unwrap_or(false);
                if !both_refs && !both_same_value {
                    return Err(self.err(
                        md,
                        line,
                        "'===' compares references or two values of one value type",
                    ));
                }
                expr.inferred = self.prim_ty(md, "bool");
            }
            ExprKind::Abort(inner) => {
                self.transform_expr(md, inner)?;
                let string_ty = self.class_ty(md, "string");
                self.insert_conversion(md, inner, &string_ty)?;
                expr.inferred = TypeRef::void();
            }
            ExprKind::Assert(inner) => {
                self.transform_expr(md, inner)?;
                let bool_ty = self.prim_ty(md, "bool");
                self.insert_conversion(md, inner, &bool_ty)?;
                expr.inferred = TypeRef::void();
            }
            ExprKind::Ref(inner) => {
                self.transform_expr(md, inner)?;
                if !matches!(inner.kind, ExprKind::Ident(_)) {
                    return Err(self.err(md, line, "'ref' requires a variable"));
                }
                expr.inferred = self.prim_ty(md, "intptr");
            }
            ExprKind::Body(_) => {
                let inferred = self.transform_closure_literal(md, expr)?;
                expr.inferred = inferred;
            }
            ExprKind::InlinedCondition { .. } => {
                // Produced by this pass; never an input.
                return Err(self.err(md, line, "Unexpected inlined condition in source tree"));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identifiers, this, captures
    // ------------------------------------------------------------------

    fn resolve_this(&mut self, md: &mut Metadata, line: u32) -> Result<TypeRef, CompileError> {
        let root = self.root();
        let root_method = md.method(root);
        let is_static_ctx = root_method.kind == MethodKind::Normal && root_method.sig.is_static
            || (root_method.kind == MethodKind::Ctor && root_method.name.is_empty());
        if is_static_ctx {
            return Err(self.err(md, line, "'this' is not available in a static context"));
        }
        let class_id = root_method.declaring_class;
        if md.class(class_id).is_value_type && self.method_stack.len() > 1 {
            return Err(self.err(
                md,
                line,
                "'this' of a value type cannot be captured by a closure",
            ));
        }
        if self.method_stack.len() > 1 {
            self.mark_self_capture(md);
        }
        Ok(self.class_ty_by_id(md, class_id))
    }

    fn mark_self_capture(&mut self, md: &mut Metadata) {
        let depth = self.method_stack.len() - 1;
        for k in 0..depth {
            self.needs_env.insert(self.method_stack[k]);
        }
        self.self_captured_roots.insert(self.root());
        for &mid in &self.method_stack[1..] {
            md.method_mut(mid).is_self_captured = true;
        }
    }

    /// Resolution order: locals/params innermost-out (capturing on the
    /// way), then fields and consts of the enclosing class chain, then
    /// class names. Returns None for names that only exist as methods.
    fn resolve_ident(
        &mut self,
        md: &mut Metadata,
        name: &str,
    ) -> Result<Option<Resolution>, CompileError> {
        let top = self.method_stack.len() - 1;
        for depth in (0..self.method_stack.len()).rev() {
            let mid = self.method_stack[depth];
            let method = md.method(mid);
            if let Some(&local_id) = method.locals.get(name) {
                let ty = method.local(local_id).ty.clone();
                let hops = (top - depth) as u16;
                if depth < top {
                    md.method_mut(mid).local_mut(local_id).is_captured = true;
                    for k in depth..top {
                        self.needs_env.insert(self.method_stack[k]);
                    }
                    return Ok(Some(Resolution {
                        resolved: ResolvedIdent::CapturedLocal(hops, local_id),
                        ty,
                    }));
                }
                // Storage the current method owns but that a closure captured
                // lives in the env object; hops = 0.
                if method.local(local_id).is_captured {
                    return Ok(Some(Resolution {
                        resolved: ResolvedIdent::CapturedLocal(0, local_id),
                        ty,
                    }));
                }
                return Ok(Some(Resolution {
                    resolved: ResolvedIdent::Local(local_id),
                    ty,
                }));
            }
            if let Some((index, param)) = method.sig.param_by_name(name) {
                let ty = param.ty.clone();
                if depth < top {
                    let hops = (top - depth) as u16;
                    md.method_mut(mid).sig.params[index as usize].is_captured = true;
                    for k in depth..top {
                        self.needs_env.insert(self.method_stack[k]);
                    }
                    return Ok(Some(Resolution {
                        resolved: ResolvedIdent::CapturedParam(hops, index),
                        ty,
                    }));
                }
                if method.sig.params[index as usize].is_captured {
                    return Ok(Some(Resolution {
                        resolved: ResolvedIdent::CapturedParam(0, index),
                        ty,
                    }));
                }
                return Ok(Some(Resolution {
                    resolved: ResolvedIdent::Param(index),
                    ty,
                }));
            }
        }

        // Fields and consts of the enclosing class chain.
        let root = self.root();
        let root_method = md.method(root);
        let root_class = root_method.declaring_class;
        let instance_ok = !(root_method.kind == MethodKind::Normal && root_method.sig.is_static
            || (root_method.kind == MethodKind::Ctor && root_method.name.is_empty()));

        let mut cursor = Some(root_class);
        while let Some(cid) = cursor {
            match md.class(cid).member(name) {
                Some(MemberRef::Field(fid)) => {
                    let field = md.field(fid);
                    let ty = field.ty.clone();
                    if field.is_static {
                        return Ok(Some(Resolution {
                            resolved: ResolvedIdent::Field(fid),
                            ty,
                        }));
                    }
                    if !instance_ok {
                        return Err(self.err(
                            md,
                            0,
                            format!("Instance field '{}' used in a static context", name),
                        ));
                    }
                    if self.method_stack.len() > 1 {
                        self.mark_self_capture(md);
                        let hops = (self.method_stack.len() - 1) as u16;
                        return Ok(Some(Resolution {
                            resolved: ResolvedIdent::CapturedField(hops, fid),
                            ty,
                        }));
                    }
                    return Ok(Some(Resolution {
                        resolved: ResolvedIdent::Field(fid),
                        ty,
                    }));
                }
                Some(MemberRef::Const(cid_)) => {
                    return Ok(Some(Resolution {
                        resolved: ResolvedIdent::Const(cid_),
                        ty: md.const_(cid_).ty.clone(),
                    }));
                }
                _ => {}
            }
            cursor = md.class(cid).base_class();
        }

        // Class name.
        if let Some(cid) = md.class_by_flat_name(name) {
            return Ok(Some(Resolution {
                resolved: ResolvedIdent::Class(cid),
                ty: self.class_ty_by_id(md, cid),
            }));
        }

        Ok(None)
    }

    fn ident_suggestion(&self, md: &Metadata, name: &str) -> String {
        let method = md.method(self.current());
        let mut candidates: Vec<&str> = method.locals.keys().map(|s| s.as_str()).collect();
        candidates.extend(method.sig.params.iter().map(|p| p.name.as_str()));
        candidates.extend(
            md.class(md.method(self.root()).declaring_class)
                .name_set
                .keys()
                .map(|s| s.as_str()),
        );
        candidates.extend(md.flat_names());
        match skizo_diagnostics::closest_match(name, candidates) {
            Some(c) => format!(" (did you mean '{}'?)", c),
            None => String::new(),
        }
    }

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    fn transform_assignment(&mut self, md: &mut Metadata, expr: &mut Expr) -> Result<(), CompileError> {
        let line = expr.line;
        let ExprKind::Assignment { left, right } = &mut expr.kind else {
            unreachable!()
        };
        self.transform_expr(md, right)?;
        let rhs_ty = right.inferred.clone();

        let ExprKind::Ident(ident) = &mut left.kind else {
            return Err(self.err(md, line, "Assignment target must be an identifier"));
        };

        if ident.is_auto || ident.type_at_decl.is_some() {
            // Declares a new local at its first use site.
            let name = ident.name.clone();
            let current = self.current();
            if md.method(current).locals.contains_key(&name)
                || md.method(current).sig.param_by_name(&name).is_some()
            {
                return Err(self.err(md, line, format!("'{}' is already defined", name)));
            }
            let mut local_ty = match ident.type_at_decl.clone() {
                Some(mut ty) => {
                    resolve_typeref(md, &mut ty)?;
                    ty
                }
                None => {
                    if rhs_ty.is_void() {
                        return Err(self.err(
                            md,
                            line,
                            "Cannot infer the type of a local from a void expression",
                        ));
                    }
                    rhs_ty.clone()
                }
            };
            if local_ty.resolved.is_none() {
                resolve_typeref(md, &mut local_ty)?;
            }
            let local_id = md.method_mut(current).add_local(name, local_ty.clone());
            let ExprKind::Ident(ident) = &mut left.kind else {
                unreachable!()
            };
            ident.resolved = Some(ResolvedIdent::Local(local_id));
            left.inferred = local_ty.clone();
            self.insert_conversion(md, right, &local_ty)?;
        } else {
            let name = ident.name.clone();
            let resolution = self.resolve_ident(md, &name)?.ok_or_else(|| {
                let help = self.ident_suggestion(md, &name);
                self.err(md, line, format!("Unresolved identifier '{}'{}", name, help))
            })?;
            match resolution.resolved {
                ResolvedIdent::Local(_)
                | ResolvedIdent::Param(_)
                | ResolvedIdent::Field(_)
                | ResolvedIdent::CapturedLocal(..)
                | ResolvedIdent::CapturedParam(..)
                | ResolvedIdent::CapturedField(..) => {}
                _ => {
                    return Err(self.err(
                        md,
                        line,
                        "Left value of an assignment should be a local, this object's field or param",
                    ))
                }
            }
            let ExprKind::Ident(ident) = &mut left.kind else {
                unreachable!()
            };
            ident.resolved = Some(resolution.resolved);
            left.inferred = resolution.ty.clone();
            self.insert_conversion(md, right, &resolution.ty)?;
        }

        expr.inferred = TypeRef::void();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn transform_call(&mut self, md: &mut Metadata, expr: &mut Expr) -> Result<TypeRef, CompileError> {
        let line = expr.line;

        // Branch-form inlining replaces the whole node.
        if let Some(inlined) = self.try_inline_branch(md, expr)? {
            *expr = inlined;
            return Ok(TypeRef::void());
        }

        let ExprKind::Call(call) = &mut expr.kind else {
            unreachable!()
        };

        // Self-call form: the head identifier is a method of the enclosing
        // class (or the built-in `print`).
        let head_name = match &call.exprs[0].kind {
            ExprKind::Ident(id) if id.resolved.is_none() => Some(id.name.clone()),
            _ => None,
        };
        if let Some(name) = head_name {
            let resolvable = self.resolve_ident(md, &name)?;
            match resolvable {
                Some(resolution) => {
                    let ExprKind::Call(call) = &mut expr.kind else {
                        unreachable!()
                    };
                    let ExprKind::Ident(head) = &mut call.exprs[0].kind else {
                        unreachable!()
                    };
                    head.resolved = Some(resolution.resolved);
                    call.exprs[0].inferred = resolution.ty;
                }
                None => {
                    if name == "print" {
                        return self.transform_print(md, expr);
                    }
                    let root_class = md.method(self.root()).declaring_class;
                    if let Some(mid) = self.find_method_in_chain(md, root_class, &name) {
                        return self.finish_self_call(md, expr, mid);
                    }
                    let help = self.ident_suggestion(md, &name);
                    return Err(self.err(
                        md,
                        line,
                        format!("Unresolved identifier '{}'{}", name, help),
                    ));
                }
            }
        } else {
            // Non-identifier head (literal, nested call, closure literal):
            // transform it as a value.
            self.transform_child(md, expr, 0)?;
        }

        // Regular form: (target name args...)
        let ExprKind::Call(call) = &expr.kind else {
            unreachable!()
        };
        if call.exprs.len() < 2 {
            return Err(self.err(md, line, "A call expression requires a method name"));
        }
        let method_name = match &call.exprs[1].kind {
            ExprKind::Ident(id) => id.name.clone(),
            ExprKind::StringLit(_) => {
                return Err(self.err(
                    md,
                    line,
                    "Dynamic method names are only available through reflection",
                ))
            }
            _ => return Err(self.err(md, line, "Second element of a call must be a method name")),
        };

        let head_resolution = match &call.exprs[0].kind {
            ExprKind::Ident(id) => id.resolved,
            _ => None,
        };

        if let Some(ResolvedIdent::Class(target_class)) = head_resolution {
            // Static context: static methods, ctors, consts.
            match md.class(target_class).member(&method_name) {
                Some(MemberRef::Method(mid)) => {
                    let method = md.method(mid);
                    if method.kind == MethodKind::Normal && !method.sig.is_static {
                        return Err(self.err(
                            md,
                            line,
                            format!(
                                "'{}' is an instance method; call it on an instance",
                                method_name
                            ),
                        ));
                    }
                    self.finish_call(md, expr, mid, 2, false)
                }
                Some(MemberRef::Const(cid)) => {
                    let ExprKind::Call(call) = &mut expr.kind else {
                        unreachable!()
                    };
                    if call.exprs.len() != 2 {
                        return Err(self.err(md, line, "A constant takes no arguments"));
                    }
                    call.kind = CallKind::ConstAccess(cid);
                    call.args_start = 2;
                    Ok(md.const_(cid).ty.clone())
                }
                Some(MemberRef::Field(_)) => Err(self.err(
                    md,
                    line,
                    format!(
                        "Static field '{}' cannot be read through a call; add a getter",
                        method_name
                    ),
                )),
                None => Err(self.err(
                    md,
                    line,
                    format!(
                        "Class '{}' has no static member '{}'",
                        md.class(target_class).nice_name,
                        method_name
                    ),
                )),
            }
        } else {
            // Instance context.
            let recv_ty = {
                let ExprKind::Call(call) = &expr.kind else {
                    unreachable!()
                };
                call.exprs[0].inferred.clone()
            };
            let Some(recv_class) = recv_ty.resolved else {
                return Err(self.err(
                    md,
                    line,
                    format!("Cannot call '{}' on a value of type '{}'", method_name, recv_ty),
                ));
            };
            let recv_class = unalias(md, recv_class);
            let Some(mid) = self.find_method_in_chain(md, recv_class, &method_name) else {
                let help = match skizo_diagnostics::closest_match(
                    &method_name,
                    md.class(recv_class).name_set.keys().map(|s| s.as_str()),
                ) {
                    Some(c) => format!(" (did you mean '{}'?)", c),
                    None => String::new(),
                };
                return Err(self.err(
                    md,
                    line,
                    format!(
                        "Class '{}' has no member '{}'{}",
                        md.class(recv_class).nice_name,
                        method_name,
                        help
                    ),
                ));
            };
            if md.method(mid).sig.is_static && md.method(mid).kind == MethodKind::Normal {
                return Err(self.err(
                    md,
                    line,
                    format!("'{}' is static; call it through the class name", method_name),
                ));
            }
            self.finish_call(md, expr, mid, 2, false)
        }
    }

    fn find_method_in_chain(&self, md: &Metadata, class: ClassId, name: &str) -> Option<MethodId> {
        let mut cursor = Some(class);
        while let Some(cid) = cursor {
            if let Some(MemberRef::Method(mid)) = md.class(cid).member(name) {
                return Some(mid);
            }
            cursor = md.class(cid).base_class();
        }
        None
    }

    fn finish_self_call(
        &mut self,
        md: &mut Metadata,
        expr: &mut Expr,
        mid: MethodId,
    ) -> Result<TypeRef, CompileError> {
        let line = expr.line;
        let target = md.method(mid);
        let implicit_this = !target.sig.is_static;
        if implicit_this {
            // The implicit receiver is `this`; validate its availability
            // (and capture it when called from inside a closure).
            self.resolve_this(md, line)?;
        }
        self.finish_call(md, expr, mid, 1, implicit_this)
    }

    /// Shared tail: transforms arguments, inserts conversions, stamps the
    /// call kind and computes the call's type.
    fn finish_call(
        &mut self,
        md: &mut Metadata,
        expr: &mut Expr,
        mid: MethodId,
        args_start: usize,
        implicit_this: bool,
    ) -> Result<TypeRef, CompileError> {
        let line = expr.line;
        let param_tys: Vec<TypeRef> = md.method(mid).sig.params.iter().map(|p| p.ty.clone()).collect();

        let arg_count = {
            let ExprKind::Call(call) = &expr.kind else {
                unreachable!()
            };
            call.exprs.len() - args_start
        };
        if arg_count != param_tys.len() {
            return Err(self.err(
                md,
                line,
                format!(
                    "'{}' expects {} argument(s), found {}",
                    md.method_full_name(mid),
                    param_tys.len(),
                    arg_count
                ),
            ));
        }

        for (i, param_ty) in param_tys.iter().enumerate() {
            let index = args_start + i;
            self.transform_child(md, expr, index)?;
            let ExprKind::Call(call) = &mut expr.kind else {
                unreachable!()
            };
            self.insert_conversion_raw(md, &mut call.exprs[index], param_ty)?;
        }

        md.method_mut(mid).ever_called = true;

        let (ret, kind) = {
            let method = md.method(mid);
            let ret = if method.kind == MethodKind::Ctor {
                self.class_ty_by_id(md, method.declaring_class)
            } else {
                method.sig.ret.clone()
            };
            (ret, CallKind::MethodCall(mid))
        };

        let ExprKind::Call(call) = &mut expr.kind else {
            unreachable!()
        };
        call.kind = kind;
        call.args_start = args_start as u8;
        call.implicit_this = implicit_this;
        Ok(ret)
    }

    /// `print x` lowers to the Console icall that matches the argument's
    /// primitive type.
    fn transform_print(&mut self, md: &mut Metadata, expr: &mut Expr) -> Result<TypeRef, CompileError> {
        let line = expr.line;
        {
            let ExprKind::Call(call) = &expr.kind else {
                unreachable!()
            };
            if call.exprs.len() != 2 {
                return Err(self.err(md, line, "'print' expects exactly one argument"));
            }
        }
        self.transform_child(md, expr, 1)?;

        let arg_ty = {
            let ExprKind::Call(call) = &expr.kind else {
                unreachable!()
            };
            call.exprs[1].inferred.clone()
        };
        let target_name = if arg_ty.array_level == 0 && arg_ty.kind == skizo_ast::TypeRefKind::Normal
        {
            match arg_ty.prim {
                PrimType::Int => "printInt",
                PrimType::Float => "printFloat",
                PrimType::Bool => "printBool",
                PrimType::Char => "printChar",
                PrimType::Object
                    if arg_ty.resolved == md.class_by_flat_name("string") =>
                {
                    "printString"
                }
                _ => {
                    return Err(self.err(
                        md,
                        line,
                        format!("'print' cannot format a value of type '{}'", arg_ty),
                    ))
                }
            }
        } else {
            return Err(self.err(
                md,
                line,
                format!("'print' cannot format a value of type '{}'", arg_ty),
            ));
        };

        let console = md
            .class_by_flat_name("Console")
            .ok_or_else(|| CompileError::Verify("Console class missing".into()))?;
        let Some(MemberRef::Method(mid)) = md.class(console).member(target_name) else {
            return Err(CompileError::Verify(format!(
                "Console::{} missing",
                target_name
            )));
        };
        md.method_mut(mid).ever_called = true;

        let ExprKind::Call(call) = &mut expr.kind else {
            unreachable!()
        };
        call.kind = CallKind::MethodCall(mid);
        call.args_start = 1;
        call.implicit_this = false;
        Ok(TypeRef::void())
    }

    fn transform_child(
        &mut self,
        md: &mut Metadata,
        expr: &mut Expr,
        index: usize,
    ) -> Result<(), CompileError> {
        let ExprKind::Call(call) = &mut expr.kind else {
            unreachable!()
        };
        let mut child = std::mem::replace(&mut call.exprs[index], Expr::new(ExprKind::NullLit, 0));
        self.transform_expr(md, &mut child)?;
        let ExprKind::Call(call) = &mut expr.kind else {
            unreachable!()
        };
        call.exprs[index] = child;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Branch inlining
    // ------------------------------------------------------------------

    /// `cond then {..}` / `cond else {..}` / `{pred} while {..}` become
    /// branch nodes, removing the closure allocation on hot paths.
    fn try_inline_branch(
        &mut self,
        md: &mut Metadata,
        expr: &mut Expr,
    ) -> Result<Option<Expr>, CompileError> {
        let line = expr.line;
        let ExprKind::Call(call) = &mut expr.kind else {
            unreachable!()
        };
        if call.exprs.len() != 3 {
            return Ok(None);
        }
        let keyword = match &call.exprs[1].kind {
            ExprKind::Ident(id) if matches!(id.name.as_str(), "then" | "else" | "while") => {
                id.name.clone()
            }
            _ => return Ok(None),
        };
        let body_is_literal = matches!(&call.exprs[2].kind, ExprKind::Body(b) if b.params.is_empty());
        if !body_is_literal {
            return Ok(None);
        }

        let mut cond = call.exprs.remove(0);
        let mut body_expr = call.exprs.pop().expect("checked length");

        let bool_ty = self.prim_ty(md, "bool");
        if keyword == "while" {
            // The predicate must be a literal closure so its re-evaluation
            // can be spliced into the loop.
            let ExprKind::Body(pred) = &mut cond.kind else {
                return Err(self.err(
                    md,
                    line,
                    "'while' requires a literal predicate closure on the left",
                ));
            };
            if !pred.params.is_empty() {
                return Err(self.err(md, line, "A 'while' predicate takes no parameters"));
            }
            // The tail return carries the loop condition; it is not a
            // return of the enclosing method, so transform its value only.
            pred.method = Some(self.current());
            let expr_count = pred.exprs.len();
            if expr_count == 0 {
                return Err(self.err(
                    md,
                    line,
                    "A 'while' predicate must end with a return of a bool",
                ));
            }
            for stmt in &mut pred.exprs[..expr_count - 1] {
                self.transform_expr(md, stmt)?;
            }
            match &mut pred.exprs[expr_count - 1].kind {
                ExprKind::Return(value) => {
                    self.transform_expr(md, value)?;
                    if !self.types_equal(md, &value.inferred, &bool_ty) {
                        return Err(self.err(md, line, "A 'while' predicate must return bool"));
                    }
                }
                _ => {
                    return Err(self.err(
                        md,
                        line,
                        "A 'while' predicate must end with a return of a bool",
                    ))
                }
            }
            cond.inferred = bool_ty;
        } else {
            self.transform_expr(md, &mut cond)?;
            self.insert_conversion(md, &mut cond, &bool_ty)?;
        }

        let ExprKind::Body(body) = &mut body_expr.kind else {
            unreachable!()
        };
        self.transform_inline_body(md, body)?;

        let (then_body, else_body, is_loop) = match keyword.as_str() {
            "then" => (Box::new(body_expr), None, false),
            "while" => (Box::new(body_expr), None, true),
            // `cond else { .. }` runs the body when the condition is false.
            _ => (
                Box::new(Expr::new(ExprKind::Body(Body::new()), line)),
                Some(Box::new(body_expr)),
                false,
            ),
        };

        let mut inlined = Expr::new(
            ExprKind::InlinedCondition {
                cond: Box::new(cond),
                then_body,
                else_body,
                is_loop,
            },
            line,
        );
        inlined.inferred = TypeRef::void();
        Ok(Some(inlined))
    }

    /// Inlined bodies stay in the current method: their locals merge into
    /// the enclosing method's scope and no closure class is generated.
    fn transform_inline_body(&mut self, md: &mut Metadata, body: &mut Body) -> Result<(), CompileError> {
        body.method = Some(self.current());
        self.transform_body_exprs(md, &mut body.exprs)
    }

    // ------------------------------------------------------------------
    // Closure literals
    // ------------------------------------------------------------------

    /// A `method (params) { ... }` literal becomes a compiler-generated
    /// method class whose single instance method is the body; the literal
    /// site later compiles to the closure-ctor thunk.
    fn transform_closure_literal(
        &mut self,
        md: &mut Metadata,
        expr: &mut Expr,
    ) -> Result<TypeRef, CompileError> {
        let line = expr.line;
        let parent = self.current();
        let n = self.anon_counter;
        self.anon_counter += 1;

        let ExprKind::Body(body) = &mut expr.kind else {
            unreachable!()
        };
        let mut params = std::mem::take(&mut body.params);
        let mut ret = body.ret.clone();
        let exprs = std::mem::take(&mut body.exprs);

        for p in &mut params {
            resolve_typeref(md, &mut p.ty)?;
            // Closure thunks push arguments in word granules; non-primitive
            // value-type parameters have ABI-dependent layouts and are
            // rejected up front.
            if let Some(pc) = p.ty.resolved {
                let pclass = md.class(pc);
                if pclass.is_value_type && pclass.gc_info.size_for_use > WORD_SIZE {
                    return Err(self.err(
                        md,
                        line,
                        "Non-primitive value-type parameters are not supported in closures",
                    ));
                }
            }
        }
        if !ret.is_void() {
            resolve_typeref(md, &mut ret)?;
        }

        // The method class: { vtable, env, code_offset } like every closure.
        let class_id = md.next_class_id();
        let flat = mangle::closure_flat_name(n);
        let mut class = Class::new(class_id, flat);
        class.special = SpecialClass::MethodClass;
        class.is_compiler_generated = true;
        class.is_initialized = true;
        class.has_vtable = true;
        class.module = md.class(md.method(parent).declaring_class).module.clone();
        class.line = line;
        class.gc_info.content_size = crate::builtins::CLOSURE_CONTENT_SIZE;
        class.gc_info.size_for_use = WORD_SIZE;
        class.gc_info.gc_map = vec![crate::builtins::CLOSURE_ENV_OFFSET];
        let mut base = TypeRef::object("any");
        base.resolved = md.class_by_flat_name("any");
        class.base = Some(base);
        let class_id = md.register_class(class)?;

        let invoke_id = md.next_method_id();
        let mut invoke = Method::new(invoke_id, class_id, MethodKind::Normal, "invoke".to_string());
        invoke.is_anonymous = true;
        invoke.is_compiler_generated = true;
        invoke.parent_method = Some(parent);
        invoke.vtable_index = 0;
        invoke.sig.params = params
            .into_iter()
            .map(|p| skizo_metadata::Param {
                name: p.name,
                ty: p.ty,
                is_captured: false,
            })
            .collect();
        invoke.sig.ret = ret;
        let mut invoke_body = Body::new();
        invoke_body.exprs = exprs;
        invoke_body.ret = invoke.sig.ret.clone();
        invoke.body = Some(invoke_body);
        let invoke_id = md.add_method(invoke);
        md.class_mut(class_id).instance_methods.push(invoke_id);
        md.class_mut(class_id)
            .name_set
            .insert("invoke".to_string(), MemberRef::Method(invoke_id));

        // The closure ctor is machine code from the thunk manager, not C.
        let ctor_id = md.next_method_id();
        let mut ctor = Method::new(ctor_id, class_id, MethodKind::Ctor, "ctor".to_string());
        ctor.special = skizo_metadata::SpecialMethod::ClosureCtor;
        ctor.is_compiler_generated = true;
        ctor.sig.is_static = true;
        ctor.sig.params.push(skizo_metadata::Param {
            name: "env".to_string(),
            ty: TypeRef::intptr(),
            is_captured: false,
        });
        let ctor_id = md.add_method(ctor);
        md.class_mut(class_id).instance_ctors.push(ctor_id);
        md.class_mut(class_id)
            .name_set
            .insert("ctor".to_string(), MemberRef::Method(ctor_id));

        self.transform_method(md, invoke_id)?;

        let ExprKind::Body(body) = &mut expr.kind else {
            unreachable!()
        };
        body.method = Some(invoke_id);
        body.closure_class = Some(class_id);

        Ok(self.class_ty_by_id(md, class_id))
    }

    // ------------------------------------------------------------------
    // Closure-env construction (post-pass)
    // ------------------------------------------------------------------

    /// Creates one env class per method whose storage was captured.
    /// Processing in id order guarantees a parent's env class exists
    /// before a nested closure links to it through `_upper`.
    pub fn build_closure_envs(&mut self, md: &mut Metadata) -> Result<(), CompileError> {
        let mut methods: Vec<MethodId> = self.needs_env.iter().copied().collect();
        methods.sort();

        for (i, mid) in methods.into_iter().enumerate() {
            let class_id = md.next_class_id();
            let flat = mangle::closure_env_flat_name(i as u32);
            let mut class = Class::new(class_id, flat);
            class.special = SpecialClass::ClosureEnv;
            class.is_compiler_generated = true;
            class.is_initialized = true;
            class.module = md.class(md.method(mid).declaring_class).module.clone();
            let class_id = md.register_class(class)?;

            let mut offset = OBJECT_HEADER_SIZE;
            let mut gc_map = Vec::new();

            let mut add_env_field =
                |md: &mut Metadata, name: String, ty: TypeRef, offset: &mut u32, gc_map: &mut Vec<u32>| {
                    let size = crate::resolver::size_for_use_of(md, &ty);
                    let align = size.clamp(1, WORD_SIZE);
                    *offset = offset.next_multiple_of(align);
                    let fid = md.next_field_id();
                    md.add_field(Field {
                        id: fid,
                        declaring_class: class_id,
                        access: Access::Private,
                        is_static: false,
                        name: name.clone(),
                        ty: ty.clone(),
                        offset: *offset,
                        attrs: Vec::new(),
                    });
                    md.class_mut(class_id).instance_fields.push(fid);
                    md.class_mut(class_id)
                        .name_set
                        .insert(name, MemberRef::Field(fid));
                    if is_reference_typeref(md, &ty) {
                        gc_map.push(*offset);
                    } else if let Some(inner_id) = ty.resolved {
                        for &o in &md.class(inner_id).gc_info.gc_map.clone() {
                            gc_map.push(*offset + o);
                        }
                    }
                    *offset += size;
                };

            // Captured params first (copied in at method entry), then
            // captured locals, then the self/chain slots.
            let param_infos: Vec<(String, TypeRef)> = md
                .method(mid)
                .sig
                .params
                .iter()
                .filter(|p| p.is_captured)
                .map(|p| (p.name.clone(), p.ty.clone()))
                .collect();
            for (name, ty) in param_infos {
                add_env_field(md, name, ty, &mut offset, &mut gc_map);
            }
            let local_infos: Vec<(String, TypeRef)> = md
                .method(mid)
                .local_list
                .iter()
                .filter(|l| l.is_captured)
                .map(|l| (l.name.clone(), l.ty.clone()))
                .collect();
            for (name, ty) in local_infos {
                add_env_field(md, name, ty, &mut offset, &mut gc_map);
            }

            if self.self_captured_roots.contains(&mid) {
                let this_ty = self.class_ty_by_id(md, md.method(mid).declaring_class);
                add_env_field(md, "_self".to_string(), this_ty, &mut offset, &mut gc_map);
            }
            let needs_upper = md.method(mid).is_anonymous
                && md
                    .method(mid)
                    .parent_method
                    .map(|p| self.needs_env.contains(&p))
                    .unwrap_or(false);
            if needs_upper {
                // The parent env's class may not be assigned yet; the slot
                // is an opaque reference either way.
                add_env_field(
                    md,
                    "_upper".to_string(),
                    self.class_ty(md, "any"),
                    &mut offset,
                    &mut gc_map,
                );
            }

            gc_map.sort_unstable();
            let class = md.class_mut(class_id);
            class.gc_info.content_size = offset.next_multiple_of(WORD_SIZE);
            class.gc_info.size_for_use = WORD_SIZE;
            class.gc_info.gc_map = gc_map;

            md.method_mut(mid).closure_env_class = Some(class_id);
        }
        Ok(())
    }

    /// Capture discovery happens during the linear walk, so statements
    /// textually before the capturing closure may have resolved a variable
    /// as plain storage. Once the captured flags are final, rewrite those
    /// accesses to go through the env object.
    pub fn fixup_captured_accesses(&self, md: &mut Metadata) {
        let method_ids: Vec<MethodId> = md.method_ids().collect();
        for mid in method_ids {
            let Some(mut body) = md.method_mut(mid).body.take() else {
                continue;
            };
            {
                let method = md.method(mid);
                for expr in &mut body.exprs {
                    rewrite_captured(method, expr);
                }
            }
            md.method_mut(mid).body = Some(body);
        }
    }

    // ------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------

    fn insert_conversion(
        &mut self,
        md: &mut Metadata,
        expr: &mut Expr,
        target: &TypeRef,
    ) -> Result<(), CompileError> {
        self.insert_conversion_raw(md, expr, target)
    }

    fn insert_conversion_raw(
        &mut self,
        md: &mut Metadata,
        expr: &mut Expr,
        target: &TypeRef,
    ) -> Result<(), CompileError> {
        let from = expr.inferred.clone();
        if self.types_equal(md, &from, target) {
            return Ok(());
        }
        if matches!(expr.kind, ExprKind::NullLit) && is_reference_typeref(md, target) {
            expr.inferred = target.clone();
            return Ok(());
        }
        if matches!(expr.kind, ExprKind::ArrayCreation { .. })
            && from.is_void()
            && target.array_level > 0
        {
            expr.inferred = target.clone();
            return Ok(());
        }

        match self.cast_info(md, &from, target)? {
            Some(info)
                if matches!(
                    info,
                    CastInfo::Upcast
                        | CastInfo::ValueToFailable
                        | CastInfo::ErrorToFailable
                        | CastInfo::Box
                ) =>
            {
                let line = expr.line;
                let inner = std::mem::replace(expr, Expr::new(ExprKind::NullLit, line));
                *expr = Expr::new(
                    ExprKind::Cast {
                        target: target.clone(),
                        expr: Box::new(inner),
                        info: Some(info),
                    },
                    line,
                );
                expr.inferred = target.clone();
                Ok(())
            }
            Some(_) => Err(self.err(
                md,
                expr.line,
                format!(
                    "Cannot implicitly convert '{}' to '{}'; an explicit cast is required",
                    from, target
                ),
            )),
            None => Err(self.err(
                md,
                expr.line,
                format!("Type mismatch: expected '{}', found '{}'", target, from),
            )),
        }
    }

    /// Classifies a conversion between two resolved typerefs. None means
    /// the types are unrelated.
    fn cast_info(
        &mut self,
        md: &mut Metadata,
        from: &TypeRef,
        to: &TypeRef,
    ) -> Result<Option<CastInfo>, CompileError> {
        // Failable construction.
        if to.kind == skizo_ast::TypeRefKind::Failable {
            let inner = to.inner().unwrap_or_else(TypeRef::void);
            if self.types_equal(md, from, &inner) {
                return Ok(Some(CastInfo::ValueToFailable));
            }
            if from.prim == PrimType::Object
                && from.array_level == 0
                && from.resolved == md.class_by_flat_name("Error")
            {
                return Ok(Some(CastInfo::ErrorToFailable));
            }
        }

        let from_ref = is_reference_typeref(md, from);
        let to_ref = is_reference_typeref(md, to);

        if from_ref && to_ref {
            let (Some(mut from_id), Some(mut to_id)) = (from.resolved, to.resolved) else {
                return Ok(None);
            };
            from_id = unalias(md, from_id);
            to_id = unalias(md, to_id);
            if from_id == to_id {
                return Ok(Some(CastInfo::Upcast));
            }
            if md.is_subclass_of(from_id, to_id) {
                return Ok(Some(CastInfo::Upcast));
            }
            if md.is_subclass_of(to_id, from_id) {
                return Ok(Some(CastInfo::Downcast));
            }
            // Closure literal to a compatible method class.
            let from_class = md.class(from_id);
            let to_class = md.class(to_id);
            if from_class.special == SpecialClass::MethodClass
                && to_class.special == SpecialClass::MethodClass
            {
                if let (Some(MemberRef::Method(a)), Some(MemberRef::Method(b))) =
                    (from_class.member("invoke"), to_class.member("invoke"))
                {
                    if md.method(a).sig.matches(&md.method(b).sig) {
                        return Ok(Some(CastInfo::Upcast));
                    }
                }
            }
            return Ok(None);
        }

        // Boxing: value into an interface/root slot.
        if !from_ref && to_ref && from.array_level == 0 && from.kind == skizo_ast::TypeRefKind::Normal
        {
            let to_id = to.resolved.map(|id| unalias(md, id));
            let to_ok = to_id
                .map(|id| {
                    let c = md.class(id);
                    c.is_hierarchy_root || c.special == SpecialClass::Interface
                })
                .unwrap_or(false);
            if to_ok && from.resolved.is_some() {
                let mut normalized = from.clone();
                normalized.resolved = Some(unalias(md, from.resolved.expect("checked")));
                get_or_create_boxed(md, &normalized)?;
                return Ok(Some(CastInfo::Box));
            }
        }

        // Unboxing back out of a root/interface slot.
        if from_ref && !to_ref && to.array_level == 0 && to.kind == skizo_ast::TypeRefKind::Normal {
            let from_ok = from
                .resolved
                .map(|id| {
                    let c = md.class(unalias(md, id));
                    c.is_hierarchy_root || c.special == SpecialClass::Interface
                })
                .unwrap_or(false);
            if from_ok {
                return Ok(Some(CastInfo::Unbox));
            }
        }

        Ok(None)
    }

    fn types_equal(&self, md: &Metadata, a: &TypeRef, b: &TypeRef) -> bool {
        if a.same_type(b) {
            return true;
        }
        // Aliases compare equal to their targets for assignment purposes.
        if let (Some(a_id), Some(b_id)) = (a.resolved, b.resolved) {
            if a.array_level == b.array_level && a.kind == b.kind {
                return unalias(md, a_id) == unalias(md, b_id);
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Typeref helpers
    // ------------------------------------------------------------------

    fn prim_ty(&self, md: &Metadata, name: &str) -> TypeRef {
        let mut ty = match name {
            "int" => TypeRef::int(),
            "float" => TypeRef::float(),
            "bool" => TypeRef::bool_(),
            "char" => TypeRef::char_(),
            "intptr" => TypeRef::intptr(),
            _ => TypeRef::object(name),
        };
        ty.resolved = md.class_by_flat_name(name);
        ty
    }

    fn class_ty(&self, md: &Metadata, name: &str) -> TypeRef {
        let mut ty = TypeRef::object(name);
        ty.resolved = md.class_by_flat_name(name);
        ty
    }

    fn class_ty_by_id(&self, md: &Metadata, id: ClassId) -> TypeRef {
        let mut ty = TypeRef::object(md.class(id).flat_name.clone());
        ty.resolved = Some(id);
        ty
    }
}

fn rewrite_captured(method: &Method, expr: &mut Expr) {
    if let ExprKind::Ident(ident) = &mut expr.kind {
        match ident.resolved {
            Some(ResolvedIdent::Local(l)) if method.local(l).is_captured => {
                ident.resolved = Some(ResolvedIdent::CapturedLocal(0, l));
            }
            Some(ResolvedIdent::Param(i))
                if method
                    .sig
                    .params
                    .get(i as usize)
                    .map(|p| p.is_captured)
                    .unwrap_or(false) =>
            {
                ident.resolved = Some(ResolvedIdent::CapturedParam(0, i));
            }
            _ => {}
        }
    }
    for_each_child(expr, |child| rewrite_captured(method, child));
}

/// Applies `f` to every direct child expression.
pub fn for_each_child(expr: &mut Expr, mut f: impl FnMut(&mut Expr)) {
    match &mut expr.kind {
        ExprKind::Body(b) => {
            for e in &mut b.exprs {
                f(e);
            }
        }
        ExprKind::Call(c) => {
            for e in &mut c.exprs {
                f(e);
            }
        }
        ExprKind::Return(e)
        | ExprKind::Abort(e)
        | ExprKind::Assert(e)
        | ExprKind::Ref(e)
        | ExprKind::ArrayCreation { length: e }
        | ExprKind::Cast { expr: e, .. }
        | ExprKind::Is { expr: e, .. } => f(e),
        ExprKind::ArrayInit { exprs, .. } => {
            for e in exprs {
                f(e);
            }
        }
        ExprKind::IdentityComparison { left, right } | ExprKind::Assignment { left, right } => {
            f(left);
            f(right);
        }
        ExprKind::InlinedCondition {
            cond,
            then_body,
            else_body,
            ..
        } => {
            f(cond);
            f(then_body);
            if let Some(e) = else_body {
                f(e);
            }
        }
        _ => {}
    }
}
