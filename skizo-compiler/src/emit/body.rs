//! Function body emission: variable segments, prologues (null checks,
//! closure-env allocation, stack frames, watch registration), statement
//! and expression lowering, and the generated special bodies (enums,
//! events, foreign stubs).

use super::{
    c_name_of_method, cctor_impl_name, is_primitive_class, is_primitive_operator, sanitize_field,
    Emitter,
};
use crate::{mangle, CompileError};
use skizo_ast::{CallKind, CastInfo, Expr, ExprKind, ResolvedIdent};
use skizo_metadata::{
    ClassId, MemberRef, Metadata, MethodId, MethodKind, PrimType, SpecialClass, SpecialMethod,
    TypeRefKind,
};

/// Per-function emission context.
struct Ctx {
    mid: MethodId,
    /// Set when the method owns a closure env (`l_env` in the prologue).
    env_class: Option<ClassId>,
    is_anon: bool,
    pops_frame: bool,
    unregs_locals: bool,
}

pub fn emit_function_bodies(e: &mut Emitter) -> Result<(), CompileError> {
    e.out().emit_line("/* function bodies */");
    let mids: Vec<MethodId> = e.md().method_ids().collect();
    for mid in mids {
        if !e.method_is_emitted_as_c(mid) {
            continue;
        }
        let special = e.md().method(mid).special;
        let class_special = e.md().class(e.md().method(mid).declaring_class).special;
        let is_enum = !e
            .md()
            .class(e.md().method(mid).declaring_class)
            .enum_items
            .is_empty();

        match special {
            SpecialMethod::Fire => emit_fire_body(e, mid)?,
            SpecialMethod::AddHandler => emit_addhandler_body(e, mid)?,
            SpecialMethod::ForeignSync => emit_foreign_client_stub(e, mid)?,
            SpecialMethod::EnumFromInt => emit_enum_from_int(e, mid)?,
            SpecialMethod::DisallowedECall => emit_disallowed_ecall(e, mid)?,
            SpecialMethod::Native if class_special == SpecialClass::Failable => {
                emit_failable_member(e, mid)?
            }
            SpecialMethod::Native if class_special == SpecialClass::EventClass => {
                emit_event_ctor(e, mid)?
            }
            SpecialMethod::Native if is_enum => emit_enum_member(e, mid)?,
            _ => emit_user_body(e, mid)?,
        }
        e.out().blank_line();
    }

    // Enum static-ctor impls plus wrappers around user static ctors.
    let ids: Vec<ClassId> = e.md().class_ids().collect();
    for id in ids {
        emit_cctor_impl(e, id)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch helpers (VCH, interface, closure invoke)
// ---------------------------------------------------------------------------

fn fnptr_type(e: &Emitter, mid: MethodId, self_type: &str) -> String {
    let method = e.md().method(mid);
    let mut types = vec![self_type.to_string()];
    for p in &method.sig.params {
        types.push(e.ctype(&p.ty));
    }
    let ret = e.ctype(&method.sig.ret);
    format!("{} (*)({})", ret, types.join(", "))
}

fn forwarded_args(e: &Emitter, mid: MethodId) -> String {
    let method = e.md().method(mid);
    let mut args = vec!["self".to_string()];
    for p in &method.sig.params {
        args.push(format!("p_{}", sanitize_field(&p.name)));
    }
    args.join(", ")
}

/// A virtual call helper: null-checks `self` and dispatches through the
/// vtable at the method's fixed slot.
pub fn emit_vch(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid);
    let class = e.md().class(method.declaring_class);
    let self_type = e.ctype_of_class(method.declaring_class);
    let name = mangle::c_vch_name(&class.flat_name, &method.name);
    let mut params = vec![format!("{} self", self_type)];
    for p in &method.sig.params {
        params.push(format!("{} p_{}", e.ctype(&p.ty), sanitize_field(&p.name)));
    }
    let ret = e.ctype(&method.sig.ret);
    let slot = method.vtable_index + 1;
    let cast = fnptr_type(e, mid, &self_type);
    let call = format!(
        "(({})self->_soX_vtbl[{}])({})",
        cast,
        slot,
        forwarded_args(e, mid)
    );
    let body = if method.sig.ret.is_void() {
        format!("{{ _soX_TN {}; }}", call)
    } else {
        format!("{{ _soX_TN return {}; }}", call)
    };
    e.out()
        .emit_line(&format!("static {} {}({}) {}", ret, name, params.join(", "), body));
    Ok(())
}

/// Interface dispatch: `_soX_findmethod(self, token)` cast to the proper
/// function pointer type.
pub fn emit_interface_call_helper(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid);
    let class = e.md().class(method.declaring_class);
    let self_type = e.ctype_of_class(method.declaring_class);
    let name = format!(
        "_soX_icall_{}_{}",
        sanitize_field(&class.flat_name),
        sanitize_field(&method.name)
    );
    let mut params = vec![format!("{} self", self_type)];
    for p in &method.sig.params {
        params.push(format!("{} p_{}", e.ctype(&p.ty), sanitize_field(&p.name)));
    }
    let ret = e.ctype(&method.sig.ret);
    let cast = fnptr_type(e, mid, &self_type);
    let token = e.method_token(mid);
    let call = format!(
        "(({})_soX_findmethod((void*)self, {}))({})",
        cast,
        token,
        forwarded_args(e, mid)
    );
    let body = if method.sig.ret.is_void() {
        format!("{{ _soX_TN {}; }}", call)
    } else {
        format!("{{ _soX_TN return {}; }}", call)
    };
    e.out()
        .emit_line(&format!("static {} {}({}) {}", ret, name, params.join(", "), body));
    Ok(())
}

/// Closure dispatch through the shared layout: invoke sits at slot 1.
pub fn emit_invoke_helper(e: &mut Emitter, class_id: ClassId) -> Result<(), CompileError> {
    let class = e.md().class(class_id);
    let Some(MemberRef::Method(invoke)) = class.member("invoke") else {
        return Ok(());
    };
    let method = e.md().method(invoke);
    let name = format!("_soX_inv_{}", sanitize_field(&class.flat_name));
    let mut params = vec!["_soX_Closure* self".to_string()];
    for p in &method.sig.params {
        params.push(format!("{} p_{}", e.ctype(&p.ty), sanitize_field(&p.name)));
    }
    let ret = e.ctype(&method.sig.ret);
    let cast = fnptr_type(e, invoke, "void*");
    let call = format!("(({})self->_soX_vtbl[1])({})", cast, forwarded_args(e, invoke));
    let body = if method.sig.ret.is_void() {
        format!("{{ _soX_TN {}; }}", call)
    } else {
        format!("{{ _soX_TN return {}; }}", call)
    };
    e.out()
        .emit_line(&format!("static {} {}({}) {}", ret, name, params.join(", "), body));
    Ok(())
}

// ---------------------------------------------------------------------------
// User bodies
// ---------------------------------------------------------------------------

fn emit_user_body(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid).clone();
    let class_id = method.declaring_class;
    let class_flat = e.md().class(class_id).flat_name.clone();
    let is_instance_ctor = method.kind == MethodKind::Ctor && !method.name.is_empty();
    let options = e.options().clone();

    let sig = e.function_signature(mid);
    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();

    // --- variable segment ---
    if is_instance_ctor {
        let line = format!("{} self;", e.ctype_of_class(class_id));
        e.out().emit_line(&line);
    }
    if let Some(env_class) = method.closure_env_class {
        let line = format!("{} l_env;", e.ctype_of_class(env_class));
        e.out().emit_line(&line);
    }
    let mut value_locals = Vec::new();
    for local in &method.local_list {
        if local.is_captured {
            continue;
        }
        let cty = e.ctype(&local.ty);
        let name = format!("l_{}", sanitize_field(&local.name));
        let is_value_struct = local
            .ty
            .resolved
            .map(|id| e.md().class(id).is_value_type && local.ty.prim == PrimType::Object)
            .unwrap_or(false)
            && local.ty.array_level == 0;
        if is_value_struct {
            let line = format!("{} {};", cty, name);
            e.out().emit_line(&line);
            value_locals.push((name, cty));
        } else {
            let line = format!("{} {} = 0;", cty, name);
            e.out().emit_line(&line);
        }
    }
    let watch_count = if options.soft_debugging_enabled && method.has_break_exprs {
        let count = method.sig.params.len() + method.local_list.len();
        if count > 0 {
            e.out()
                .emit_line(&format!("void* l_watch[{}];", count * 2));
        }
        count
    } else {
        0
    };

    // --- prologue ---
    for (name, _) in &value_locals {
        e.out()
            .emit_line(&format!("_soX_zero((void*)&{}, sizeof({}));", name, name));
    }
    let has_self = !method.sig.is_static && method.kind == MethodKind::Normal
        || method.kind == MethodKind::Dtor && !method.sig.is_static;
    // Value-type receivers arrive by value; there is nothing to null-check.
    if has_self && options.explicit_null_check && !e.md().class(class_id).is_value_type {
        e.out().emit_line("_soX_TN");
    }
    if is_instance_ctor {
        let vt = mangle::c_vtable_name(&class_flat);
        let size = e.md().class(class_id).gc_info.content_size;
        if e.md().class(class_id).is_value_type {
            e.out()
                .emit_line("_soX_zero((void*)&self, sizeof(self));");
        } else {
            let line = format!(
                "self = ({})_soX_gc_alloc(_soX_domain, {}, {});",
                e.ctype_of_class(class_id),
                size,
                vt
            );
            e.out().emit_line(&line);
            // Event fields spring to life with their owner.
            let fields = e.md().class(class_id).instance_fields.clone();
            for fid in fields {
                let field = e.md().field(fid).clone();
                if let Some(fcid) = field.ty.resolved {
                    if e.md().class(fcid).special == SpecialClass::EventClass {
                        let ev_flat = e.md().class(fcid).flat_name.clone();
                        e.out().emit_line(&format!(
                            "self->{} = {}();",
                            sanitize_field(&field.name),
                            mangle::c_method_name(&ev_flat, "create")
                        ));
                    }
                }
            }
        }
    }
    if let Some(env_class) = method.closure_env_class {
        let line = format!(
            "l_env = ({})_soX_gc_alloc_env(_soX_domain, {});",
            e.ctype_of_class(env_class),
            e.class_word(env_class)
        );
        e.out().emit_line(&line);
        for p in &method.sig.params {
            if p.is_captured {
                e.out().emit_line(&format!(
                    "l_env->{} = p_{};",
                    sanitize_field(&p.name),
                    sanitize_field(&p.name)
                ));
            }
        }
        if e.md().class(env_class).member("_self").is_some() {
            e.out().emit_line("l_env->_self = self;");
        }
        if e.md().class(env_class).member("_upper").is_some() {
            e.out()
                .emit_line("l_env->_upper = (void*)((_soX_Closure*)self)->env;");
        }
    }

    let frames = (options.stack_trace_enabled || options.profiling_enabled) && !method.is_unsafe;
    if frames {
        let token = e.method_token(mid);
        if options.profiling_enabled {
            e.out()
                .emit_line(&format!("_soX_pushframe_prf(_soX_domain, {});", token));
        } else {
            e.out()
                .emit_line(&format!("_soX_pushframe(_soX_domain, {});", token));
        }
    }

    if watch_count > 0 {
        let mut idx = 0;
        for p in &method.sig.params {
            let slot = e.strlit_slot(&p.name);
            e.out().emit_line(&format!(
                "l_watch[{}] = _soX_strlits[{}]; l_watch[{}] = (void*)&p_{};",
                idx * 2,
                slot,
                idx * 2 + 1,
                sanitize_field(&p.name)
            ));
            idx += 1;
        }
        for local in &method.local_list {
            if local.is_captured {
                continue;
            }
            let slot = e.strlit_slot(&local.name);
            e.out().emit_line(&format!(
                "l_watch[{}] = _soX_strlits[{}]; l_watch[{}] = (void*)&l_{};",
                idx * 2,
                slot,
                idx * 2 + 1,
                sanitize_field(&local.name)
            ));
            idx += 1;
        }
        e.out().emit_line(&format!(
            "_soX_reglocals(_soX_domain, l_watch, {});",
            idx
        ));
    }

    // --- statements ---
    let ctx = Ctx {
        mid,
        env_class: method.closure_env_class,
        is_anon: method.is_anonymous,
        pops_frame: frames,
        unregs_locals: watch_count > 0,
    };
    if let Some(body) = &method.body {
        for expr in &body.exprs {
            emit_stmt(e, &ctx, expr)?;
        }
    }

    // --- epilogue (void paths) ---
    let falls_through = !matches!(
        method.body.as_ref().and_then(|b| b.exprs.last()).map(|e| &e.kind),
        Some(ExprKind::Return(_))
    );
    if falls_through {
        emit_frame_pops(e, &ctx);
        if is_instance_ctor {
            e.out().emit_line("return self;");
        }
    }

    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

fn emit_frame_pops(e: &mut Emitter, ctx: &Ctx) {
    if ctx.unregs_locals {
        e.out().emit_line("_soX_unreglocals(_soX_domain);");
    }
    if ctx.pops_frame {
        if e.options().profiling_enabled {
            let token = e.method_token(ctx.mid);
            e.out()
                .emit_line(&format!("_soX_popframe_prf(_soX_domain, {});", token));
        } else {
            e.out().emit_line("_soX_popframe(_soX_domain);");
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

fn emit_stmt(e: &mut Emitter, ctx: &Ctx, expr: &Expr) -> Result<(), CompileError> {
    match &expr.kind {
        ExprKind::Return(inner) => {
            let value = emit_expr(e, ctx, inner)?;
            emit_frame_pops(e, ctx);
            e.out().emit_line(&format!("return {};", value));
        }
        ExprKind::Assignment { left, right } => {
            let lval = emit_expr(e, ctx, left)?;
            let rval = emit_expr(e, ctx, right)?;
            e.out().emit_line(&format!("{} = {};", lval, rval));
        }
        ExprKind::Abort(inner) => {
            let value = emit_expr(e, ctx, inner)?;
            e.out().emit_line(&format!("_soX_abort_e((void*){});", value));
        }
        ExprKind::Assert(inner) => {
            let value = emit_expr(e, ctx, inner)?;
            e.out()
                .emit_line(&format!("if(!({})) _soX_abort0(10);", value));
        }
        ExprKind::Break => {
            if e.options().soft_debugging_enabled {
                e.out().emit_line("_soX_break(_soX_domain);");
            }
        }
        ExprKind::CCode(code) => {
            e.out().emit_line(code.trim());
        }
        ExprKind::InlinedCondition {
            cond,
            then_body,
            else_body,
            is_loop,
        } => {
            if *is_loop {
                // The predicate body re-evaluates every iteration; splice
                // its statements in front of the exit check.
                e.out().emit_line("for(;;) {");
                e.out().indent();
                let ExprKind::Body(pred) = &cond.kind else {
                    return Err(CompileError::Verify(
                        "loop predicate lost its body".to_string(),
                    ));
                };
                let Some((last, prefix)) = pred.exprs.split_last() else {
                    return Err(CompileError::Verify("empty loop predicate".to_string()));
                };
                for stmt in prefix {
                    emit_stmt(e, ctx, stmt)?;
                }
                let ExprKind::Return(cond_value) = &last.kind else {
                    return Err(CompileError::Verify(
                        "loop predicate must end in a return".to_string(),
                    ));
                };
                let cond_c = emit_expr(e, ctx, cond_value)?;
                e.out().emit_line(&format!("if(!({})) break;", cond_c));
                if let ExprKind::Body(body) = &then_body.kind {
                    for stmt in &body.exprs {
                        emit_stmt(e, ctx, stmt)?;
                    }
                }
                e.out().dedent();
                e.out().emit_line("}");
            } else {
                let cond_c = emit_expr(e, ctx, cond)?;
                e.out().emit_line(&format!("if({}) {{", cond_c));
                e.out().indent();
                if let ExprKind::Body(body) = &then_body.kind {
                    for stmt in &body.exprs {
                        emit_stmt(e, ctx, stmt)?;
                    }
                }
                e.out().dedent();
                if let Some(else_expr) = else_body {
                    e.out().emit_line("} else {");
                    e.out().indent();
                    if let ExprKind::Body(body) = &else_expr.kind {
                        for stmt in &body.exprs {
                            emit_stmt(e, ctx, stmt)?;
                        }
                    }
                    e.out().dedent();
                }
                e.out().emit_line("}");
            }
        }
        _ => {
            let value = emit_expr(e, ctx, expr)?;
            e.out().emit_line(&format!("{};", value));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn env_chain(e: &Emitter, ctx: &Ctx, hops: u16) -> Result<String, CompileError> {
    if hops == 0 {
        return Ok("l_env".to_string());
    }
    // Hop 1 reads the closure's env pointer; each further hop follows the
    // `_upper` link. Every hop is cast to the owner's env struct.
    let md = e.md();
    let mut owner = ctx.mid;
    for _ in 0..hops {
        owner = md
            .method(owner)
            .parent_method
            .ok_or_else(|| CompileError::Verify("capture chain escapes its root".to_string()))?;
    }
    let env_class = md
        .method(owner)
        .closure_env_class
        .ok_or_else(|| CompileError::Verify("captured owner has no env class".to_string()))?;

    let mut expr = "((_soX_Closure*)self)->env".to_string();
    // Intermediate hops walk envs of the methods between us and the owner.
    let mut cursor = md.method(ctx.mid).parent_method;
    for hop in 1..hops {
        let mid = cursor.ok_or_else(|| {
            CompileError::Verify("capture chain shorter than hop count".to_string())
        })?;
        let hop_env = md.method(mid).closure_env_class.ok_or_else(|| {
            CompileError::Verify("intermediate closure lost its env".to_string())
        })?;
        expr = format!(
            "(({}){})->_upper",
            e.ctype_of_class(hop_env),
            expr
        );
        cursor = md.method(mid).parent_method;
        let _ = hop;
    }
    Ok(format!("(({}){})", e.ctype_of_class(env_class), expr))
}

fn self_expr(e: &Emitter, ctx: &Ctx) -> Result<String, CompileError> {
    if !ctx.is_anon {
        return Ok("self".to_string());
    }
    // Inside a closure the logical `this` is the root method's captured
    // self, reached through the chain.
    let md = e.md();
    let mut hops = 0u16;
    let mut cursor = ctx.mid;
    while let Some(parent) = md.method(cursor).parent_method {
        hops += 1;
        cursor = parent;
    }
    let chain = env_chain(e, ctx, hops)?;
    Ok(format!("{}->_self", chain))
}

fn emit_expr(e: &mut Emitter, ctx: &Ctx, expr: &Expr) -> Result<String, CompileError> {
    Ok(match &expr.kind {
        ExprKind::IntLit(v) => format!("{}", v),
        ExprKind::FloatLit(v) => {
            if v.fract() == 0.0 && v.abs() < 1e15 {
                format!("{:.1}f", v)
            } else {
                format!("{}f", v)
            }
        }
        ExprKind::BoolLit(v) => if *v { "_so_TRUE" } else { "_so_FALSE" }.to_string(),
        ExprKind::CharLit(c) => format!("{}", *c as u32),
        ExprKind::NullLit => "0".to_string(),
        ExprKind::StringLit(s) => {
            let slot = e.strlit_slot(s);
            format!("((_so_string*)_soX_strlits[{}])", slot)
        }
        ExprKind::This => self_expr(e, ctx)?,
        ExprKind::Ident(ident) => emit_ident(e, ctx, expr, ident)?,
        ExprKind::Call(_) => emit_call(e, ctx, expr)?,
        ExprKind::Cast { target, expr: inner, info } => {
            let value = emit_expr(e, ctx, inner)?;
            let target_c = e.ctype(target);
            match info.unwrap_or(CastInfo::Upcast) {
                CastInfo::Upcast => {
                    if target.resolved.map(|id| e.md().class(id).is_value_type).unwrap_or(false)
                        && target.array_level == 0
                    {
                        // Alias-level value identity; no representation change.
                        value
                    } else {
                        format!("(({})({}))", target_c, value)
                    }
                }
                CastInfo::Downcast => {
                    let word = e.class_word(target.resolved.ok_or_else(|| {
                        CompileError::Verify("unresolved downcast target".to_string())
                    })?);
                    format!("(({})_soX_downcast((void*)({}), {}))", target_c, value, word)
                }
                CastInfo::ValueToFailable => {
                    let flat = resolved_flat(e.md(), target)?;
                    format!("{}({})", mangle::c_method_name(&flat, "fromValue"), value)
                }
                CastInfo::ErrorToFailable => {
                    let flat = resolved_flat(e.md(), target)?;
                    format!("{}({})", mangle::c_method_name(&flat, "fromError"), value)
                }
                CastInfo::Box => {
                    let inner_ty = &inner.inferred;
                    let boxed = e
                        .md()
                        .boxed_cache
                        .get(inner_ty)
                        .copied()
                        .ok_or_else(|| {
                            CompileError::Verify(format!(
                                "no boxed class generated for '{}'",
                                inner_ty
                            ))
                        })?;
                    let flat = e.md().class(boxed).flat_name.clone();
                    format!(
                        "(({}){}({}))",
                        target_c,
                        mangle::c_method_name(&flat, "create"),
                        value
                    )
                }
                CastInfo::Unbox => {
                    let flat = resolved_flat(e.md(), target)?;
                    format!("_soX_unboxh_{}((void*)({}))", sanitize_field(&flat), value)
                }
            }
        }
        ExprKind::Sizeof { target } => {
            let id = target
                .resolved
                .ok_or_else(|| CompileError::Verify("unresolved sizeof target".to_string()))?;
            format!("{}", e.md().class(id).gc_info.content_size)
        }
        ExprKind::ArrayCreation { length } => {
            let id = expr.inferred.resolved.ok_or_else(|| {
                CompileError::Verify(
                    "array creation whose element type never became known".to_string(),
                )
            })?;
            let len = emit_expr(e, ctx, length)?;
            format!(
                "(({})_soX_newarray(_soX_domain, {}, {}))",
                e.ctype_of_class(id),
                len,
                e.class_word(id)
            )
        }
        ExprKind::ArrayInit { exprs, helper_id } => {
            let id = helper_id
                .ok_or_else(|| CompileError::Verify("array init without helper id".to_string()))?;
            let mut args = Vec::new();
            for item in exprs {
                args.push(emit_expr(e, ctx, item)?);
            }
            format!("_soX_arrinit_{}({})", id, args.join(", "))
        }
        ExprKind::IdentityComparison { left, right } => {
            let a = emit_expr(e, ctx, left)?;
            let b = emit_expr(e, ctx, right)?;
            let value_class = left
                .inferred
                .resolved
                .filter(|&id| e.md().class(id).is_value_type && left.inferred.array_level == 0);
            match value_class {
                Some(id) => format!(
                    "_soX_ideq_{}({}, {})",
                    sanitize_field(&e.md().class(id).flat_name),
                    a,
                    b
                ),
                None => format!("((((void*)({})) == ((void*)({}))) ? _so_TRUE : _so_FALSE)", a, b),
            }
        }
        ExprKind::Is { expr: inner, target } => {
            let value = emit_expr(e, ctx, inner)?;
            let word = e.class_word(
                target
                    .resolved
                    .ok_or_else(|| CompileError::Verify("unresolved 'is' target".to_string()))?,
            );
            format!("_soX_is((void*)({}), {})", value, word)
        }
        ExprKind::Ref(inner) => {
            let value = emit_expr(e, ctx, inner)?;
            format!("((void*)&{})", value)
        }
        ExprKind::Body(body) => {
            // Closure literal: the thunk-generated ctor builds the object.
            let class_id = body
                .closure_class
                .ok_or_else(|| CompileError::Verify("untransformed closure literal".to_string()))?;
            let flat = e.md().class(class_id).flat_name.clone();
            let env_arg = if ctx.env_class.is_some() {
                "(void*)l_env".to_string()
            } else if ctx.is_anon {
                "((_soX_Closure*)self)->env".to_string()
            } else {
                "0".to_string()
            };
            format!(
                "(({}){}({}))",
                e.ctype_of_class(class_id),
                mangle::c_method_name(&flat, "ctor"),
                env_arg
            )
        }
        other => {
            return Err(CompileError::Verify(format!(
                "expression not lowerable in value position: {:?}",
                std::mem::discriminant(other)
            )))
        }
    })
}

fn resolved_flat(md: &Metadata, ty: &skizo_metadata::TypeRef) -> Result<String, CompileError> {
    ty.resolved
        .map(|id| md.class(id).flat_name.clone())
        .ok_or_else(|| CompileError::Verify(format!("unresolved typeref '{}' at emit time", ty)))
}

fn emit_ident(
    e: &mut Emitter,
    ctx: &Ctx,
    _expr: &Expr,
    ident: &skizo_ast::IdentExpr,
) -> Result<String, CompileError> {
    let resolved = ident
        .resolved
        .ok_or_else(|| CompileError::Verify(format!("unresolved ident '{}'", ident.name)))?;
    Ok(match resolved {
        ResolvedIdent::Local(local) => {
            let method = e.md().method(ctx.mid);
            format!("l_{}", sanitize_field(&method.local(local).name))
        }
        ResolvedIdent::Param(index) => {
            let method = e.md().method(ctx.mid);
            format!(
                "p_{}",
                sanitize_field(&method.sig.params[index as usize].name)
            )
        }
        ResolvedIdent::Field(fid) => {
            let field = e.md().field(fid);
            if field.is_static {
                mangle::c_static_field_name(
                    &e.md().class(field.declaring_class).flat_name,
                    &field.name,
                )
            } else {
                // Value-type methods receive `self` by value; a value-type
                // `this` can never be captured, so the chain case is
                // reference-only.
                let own_class = e.md().method(ctx.mid).declaring_class;
                if !ctx.is_anon && e.md().class(own_class).is_value_type {
                    format!("self.{}", sanitize_field(&field.name))
                } else {
                    format!("{}->{}", self_expr(e, ctx)?, sanitize_field(&field.name))
                }
            }
        }
        ResolvedIdent::Const(cid) => {
            let konst = e.md().const_(cid);
            mangle::c_static_field_name(
                &e.md().class(konst.declaring_class).flat_name,
                &konst.name,
            )
        }
        ResolvedIdent::CapturedLocal(hops, local) => {
            let mut owner = ctx.mid;
            for _ in 0..hops {
                owner = e.md().method(owner).parent_method.ok_or_else(|| {
                    CompileError::Verify("capture hop past the root method".to_string())
                })?;
            }
            let name = e.md().method(owner).local(local).name.clone();
            format!("{}->{}", env_chain(e, ctx, hops)?, sanitize_field(&name))
        }
        ResolvedIdent::CapturedParam(hops, index) => {
            let mut owner = ctx.mid;
            for _ in 0..hops {
                owner = e.md().method(owner).parent_method.ok_or_else(|| {
                    CompileError::Verify("capture hop past the root method".to_string())
                })?;
            }
            let name = e.md().method(owner).sig.params[index as usize].name.clone();
            format!("{}->{}", env_chain(e, ctx, hops)?, sanitize_field(&name))
        }
        ResolvedIdent::CapturedSelf(hops) => {
            format!("{}->_self", env_chain(e, ctx, hops)?)
        }
        ResolvedIdent::CapturedField(hops, fid) => {
            let field = e.md().field(fid);
            let fname = sanitize_field(&field.name);
            format!("{}->_self->{}", env_chain(e, ctx, hops)?, fname)
        }
        ResolvedIdent::Class(_) | ResolvedIdent::Method(_) => {
            return Err(CompileError::Verify(format!(
                "'{}' is not a value",
                ident.name
            )))
        }
    })
}

fn emit_call(e: &mut Emitter, ctx: &Ctx, expr: &Expr) -> Result<String, CompileError> {
    let ExprKind::Call(call) = &expr.kind else {
        unreachable!()
    };
    match call.kind {
        CallKind::ConstAccess(cid) => {
            let konst = e.md().const_(cid);
            Ok(mangle::c_static_field_name(
                &e.md().class(konst.declaring_class).flat_name,
                &konst.name,
            ))
        }
        CallKind::MethodCall(mid) => emit_method_call(e, ctx, expr, mid),
        CallKind::Unresolved => Err(CompileError::Verify(
            "unresolved call survived transformation".to_string(),
        )),
    }
}

fn emit_method_call(
    e: &mut Emitter,
    ctx: &Ctx,
    expr: &Expr,
    mid: MethodId,
) -> Result<String, CompileError> {
    let ExprKind::Call(call) = &expr.kind else {
        unreachable!()
    };
    let method = e.md().method(mid).clone();
    let mclass_id = method.declaring_class;
    let mclass_flat = e.md().class(mclass_id).flat_name.clone();
    let mclass_special = e.md().class(mclass_id).special;

    let args_start = call.args_start as usize;
    let mut args = Vec::new();
    for arg in &call.exprs[args_start..] {
        args.push(emit_expr(e, ctx, arg)?);
    }

    let receiver = if method.sig.is_static {
        None
    } else if call.implicit_this {
        Some(self_expr(e, ctx)?)
    } else {
        Some(emit_expr(e, ctx, &call.exprs[0])?)
    };

    // Primitive operators map straight to C operators.
    if is_primitive_operator(e.md(), mid) {
        let a = receiver.ok_or_else(|| CompileError::Verify("operator without lhs".into()))?;
        return Ok(lower_primitive_op(&mclass_flat, &method.name, &a, &args));
    }

    // Array accessors lower to generated helpers.
    if mclass_special == SpecialClass::Array {
        let helper_flat = sanitize_field(&mclass_flat);
        return Ok(match method.name.as_str() {
            "length" => format!(
                "_soX_arrlen((void*)({}))",
                receiver.ok_or_else(|| CompileError::Verify("length without receiver".into()))?
            ),
            "get" => format!(
                "_soX_arrget_{}({}, {})",
                helper_flat,
                receiver.ok_or_else(|| CompileError::Verify("get without receiver".into()))?,
                args[0]
            ),
            "set" => format!(
                "_soX_arrset_{}({}, {}, {})",
                helper_flat,
                receiver.ok_or_else(|| CompileError::Verify("set without receiver".into()))?,
                args[0],
                args[1]
            ),
            "createByLength" => format!(
                "(({})_soX_newarray(_soX_domain, {}, {}))",
                e.ctype_of_class(mclass_id),
                args[0],
                e.class_word(mclass_id)
            ),
            other => {
                return Err(CompileError::Verify(format!(
                    "unknown array member '{}'",
                    other
                )))
            }
        });
    }

    let direct_name = mangle::c_method_name(&mclass_flat, &c_name_of_method(&method));

    // Statics, ctors and dtors call straight through.
    if method.sig.is_static || method.kind != MethodKind::Normal {
        let mut prefix = String::new();
        if e.md().class(mclass_id).has_static_ctor_check && method.kind != MethodKind::Dtor {
            prefix = format!("(_soX_checktype({}), ", e.class_word(mclass_id));
        }
        let call_c = format!("{}({})", direct_name, args.join(", "));
        return Ok(if prefix.is_empty() {
            call_c
        } else {
            format!("{}{})", prefix, call_c)
        });
    }

    let receiver = receiver.ok_or_else(|| {
        CompileError::Verify(format!("instance call to '{}' without receiver", method.name))
    })?;

    // Flagged simple getters inline as a field access.
    if let Some(fid) = method.inlinable_field {
        let field = e.md().field(fid);
        return Ok(format!(
            "((({})({}))->{})",
            e.ctype_of_class(mclass_id),
            receiver,
            sanitize_field(&field.name)
        ));
    }

    // Structs cannot be cast in C; value receivers pass through as-is.
    let value_receiver = e.md().class(mclass_id).is_value_type
        && !is_primitive_class(e.md().class(mclass_id));
    let recv_c = if value_receiver {
        receiver.clone()
    } else {
        format!("(({})({}))", e.ctype_of_class(mclass_id), receiver)
    };
    let mut full_args = vec![recv_c];
    full_args.extend(args);

    Ok(match mclass_special {
        SpecialClass::Interface => format!(
            "_soX_icall_{}_{}({})",
            sanitize_field(&mclass_flat),
            sanitize_field(&method.name),
            full_args.join(", ")
        ),
        SpecialClass::MethodClass => {
            let mut inv_args = vec![format!("(_soX_Closure*)({})", receiver)];
            inv_args.extend(full_args[1..].iter().cloned());
            format!(
                "_soX_inv_{}({})",
                sanitize_field(&mclass_flat),
                inv_args.join(", ")
            )
        }
        _ if method.is_truly_virtual => {
            // Dispatch through the VCH of the ultimate base.
            let mut base = mid;
            while let Some(up) = e.md().method(base).base_method {
                base = up;
            }
            let base_class = e.md().class(e.md().method(base).declaring_class);
            let mut vch_args = vec![format!(
                "(({})({}))",
                e.ctype_of_class(e.md().method(base).declaring_class),
                receiver
            )];
            vch_args.extend(full_args[1..].iter().cloned());
            format!(
                "{}({})",
                mangle::c_vch_name(&base_class.flat_name, &e.md().method(base).name),
                vch_args.join(", ")
            )
        }
        _ => format!("{}({})", direct_name, full_args.join(", ")),
    })
}

fn lower_primitive_op(class_flat: &str, op: &str, a: &str, args: &[String]) -> String {
    let b = args.first().map(|s| s.as_str()).unwrap_or("");
    match (class_flat, op) {
        ("int", "/") => format!("_so_int_op_divide({}, {})", a, b),
        (_, "+") => format!("(({}) + ({}))", a, b),
        (_, "-") => format!("(({}) - ({}))", a, b),
        (_, "*") => format!("(({}) * ({}))", a, b),
        (_, "/") => format!("(({}) / ({}))", a, b),
        (_, "%") => format!("(({}) % ({}))", a, b),
        (_, "<") => format!("((({}) < ({})) ? _so_TRUE : _so_FALSE)", a, b),
        (_, ">") => format!("((({}) > ({})) ? _so_TRUE : _so_FALSE)", a, b),
        (_, "==") => format!("((({}) == ({})) ? _so_TRUE : _so_FALSE)", a, b),
        (_, "and") => format!("((({}) && ({})) ? _so_TRUE : _so_FALSE)", a, b),
        (_, "or") => format!("((({}) || ({})) ? _so_TRUE : _so_FALSE)", a, b),
        (_, "not") => format!("((!({})) ? _so_TRUE : _so_FALSE)", a),
        _ => format!("0 /* unknown operator {} */", op),
    }
}

// ---------------------------------------------------------------------------
// Generated special bodies
// ---------------------------------------------------------------------------

/// The generated fire body iterates a snapshot of the handler array so
/// handlers may mutate the list during dispatch.
fn emit_fire_body(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let sig = e.function_signature(mid);
    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();
    e.out().emit_line("_soX_ArrayHeader* l_snapshot;");
    e.out().emit_line("int l_i;");
    e.out().emit_line("int l_len;");
    e.out().emit_line("_soX_Closure* l_h;");
    e.out().emit_line("_soX_TN");
    e.out()
        .emit_line("l_snapshot = (_soX_ArrayHeader*)self->m_handlers;");
    e.out().emit_line("if(!l_snapshot) return;");
    e.out().emit_line("l_len = l_snapshot->length;");
    e.out().emit_line("for(l_i = 0; l_i < l_len; l_i++) {");
    e.out().indent();
    e.out().emit_line(
        "l_h = ((_soX_Closure**)((char*)l_snapshot + 8))[l_i];",
    );
    e.out()
        .emit_line("if(l_h) ((void (*)(void*))l_h->_soX_vtbl[1])((void*)l_h);");
    e.out().dedent();
    e.out().emit_line("}");
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

fn emit_addhandler_body(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let sig = e.function_signature(mid);
    let param = e
        .md()
        .method(mid)
        .sig
        .params
        .first()
        .map(|p| format!("p_{}", sanitize_field(&p.name)))
        .unwrap_or_else(|| "0".to_string());
    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();
    e.out().emit_line("_soX_TN");
    e.out().emit_line(&format!(
        "_soX_addhandler((void*)self, (void*){});",
        param
    ));
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

fn emit_event_ctor(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid);
    if method.kind != MethodKind::Ctor {
        // Other event-class natives are fire/addHandler, handled above.
        return Ok(());
    }
    let class_id = method.declaring_class;
    let flat = e.md().class(class_id).flat_name.clone();
    let sig = e.function_signature(mid);
    let size = e.md().class(class_id).gc_info.content_size;
    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();
    let line = format!(
        "return ({})_soX_gc_alloc(_soX_domain, {}, {});",
        e.ctype_of_class(class_id),
        size,
        mangle::c_vtable_name(&flat)
    );
    e.out().emit_line(&line);
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

fn emit_disallowed_ecall(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let sig = e.function_signature(mid);
    let method = e.md().method(mid);
    let ret = method.sig.ret.clone();
    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();
    // Trusted and untrusted domains share compiled code shapes; the abort
    // happens at runtime.
    if ret.is_void() {
        e.out().emit_line("_soX_abort0(6);");
    } else {
        let cty = e.ctype(&ret);
        e.out().emit_line(&format!("{} l_r;", cty));
        e.out()
            .emit_line("_soX_zero((void*)&l_r, sizeof(l_r));");
        e.out().emit_line("_soX_abort0(6);");
        e.out().emit_line("return l_r;");
    }
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

fn emit_enum_from_int(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid);
    let class_id = method.declaring_class;
    let class = e.md().class(class_id);
    let flat = class.flat_name.clone();
    let items = class.enum_items.clone();
    let sig = e.function_signature(mid);
    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();
    e.out().emit_line(&format!(
        "if(p_value < 0 || p_value >= {}) _soX_abort0(0);",
        items.len()
    ));
    e.out().emit_line("switch(p_value) {");
    e.out().indent();
    for (i, item) in items.iter().enumerate() {
        e.out().emit_line(&format!(
            "case {}: return {};",
            i,
            mangle::c_static_field_name(&flat, &format!("s_{}", item))
        ));
    }
    e.out().dedent();
    e.out().emit_line("}");
    e.out().emit_line("return 0;");
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

/// Enum accessors, createItem and toString.
fn emit_enum_member(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid).clone();
    let class_id = method.declaring_class;
    let class = e.md().class(class_id);
    let flat = class.flat_name.clone();
    let items = class.enum_items.clone();
    let sig = e.function_signature(mid);

    if method.kind == MethodKind::Ctor {
        // createItem
        let size = e.md().class(class_id).gc_info.content_size;
        e.out().emit_line(&format!("{} {{", sig));
        e.out().indent();
        let cty = e.ctype_of_class(class_id);
        let line = format!(
            "{} self = ({})_soX_gc_alloc(_soX_domain, {}, {});",
            cty,
            cty,
            size,
            mangle::c_vtable_name(&flat)
        );
        e.out().emit_line(&line);
        e.out().emit_line("self->m_value = p_value;");
        e.out().emit_line("return self;");
        e.out().dedent();
        e.out().emit_line("}");
        return Ok(());
    }

    if method.name == "toString" {
        e.out().emit_line(&format!("{} {{", sig));
        e.out().indent();
        e.out().emit_line("_soX_TN");
        e.out().emit_line("switch(self->m_value) {");
        e.out().indent();
        for (i, item) in items.iter().enumerate() {
            let slot = e.strlit_slot(item);
            e.out().emit_line(&format!(
                "case {}: return (_so_string*)_soX_strlits[{}];",
                i, slot
            ));
        }
        e.out().dedent();
        e.out().emit_line("}");
        e.out().emit_line("return 0;");
        e.out().dedent();
        e.out().emit_line("}");
        return Ok(());
    }

    // Item accessor.
    if items.contains(&method.name) {
        e.out().emit_line(&format!("{} {{", sig));
        e.out().indent();
        e.out().emit_line(&format!(
            "return {};",
            mangle::c_static_field_name(&flat, &format!("s_{}", method.name))
        ));
        e.out().dedent();
        e.out().emit_line("}");
    }
    Ok(())
}

fn emit_failable_member(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid).clone();
    let class_id = method.declaring_class;
    let cty = e.ctype_of_class(class_id);
    let sig = e.function_signature(mid);
    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();
    match method.name.as_str() {
        "fromValue" => {
            e.out().emit_line(&format!("{} l_f;", cty));
            e.out()
                .emit_line("_soX_zero((void*)&l_f, sizeof(l_f));");
            e.out().emit_line("l_f.m_value = p_value;");
            e.out().emit_line("return l_f;");
        }
        "fromError" => {
            e.out().emit_line(&format!("{} l_f;", cty));
            e.out()
                .emit_line("_soX_zero((void*)&l_f, sizeof(l_f));");
            e.out().emit_line("l_f.m_error = p_error;");
            e.out().emit_line("l_f.m_hasError = _so_TRUE;");
            e.out().emit_line("return l_f;");
        }
        "value" => {
            // Aborts with the contained error when there is one.
            e.out()
                .emit_line("if(self.m_hasError) _soX_abort_e((void*)self.m_error);");
            e.out().emit_line("return self.m_value;");
        }
        "error" => {
            e.out().emit_line("return self.m_error;");
        }
        "hasError" => {
            e.out().emit_line("return self.m_hasError;");
        }
        other => {
            return Err(CompileError::Verify(format!(
                "unknown failable member '{}'",
                other
            )))
        }
    }
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

/// Remote client stub: packs arguments into a stack-local word array and
/// blocks on the synchronous send.
fn emit_foreign_client_stub(e: &mut Emitter, mid: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(mid).clone();
    let wrapped_mid = method
        .base_method
        .ok_or_else(|| CompileError::Verify("foreign stub without target method".to_string()))?;
    let sig = e.function_signature(mid);
    let ret = method.sig.ret.clone();

    e.out().emit_line(&format!("{} {{", sig));
    e.out().indent();
    let argc = method.sig.params.len().max(1);
    e.out().emit_line(&format!("void* l_args[{}];", argc));
    if !ret.is_void() {
        let line = format!("{} l_ret;", e.ctype(&ret));
        e.out().emit_line(&line);
        e.out()
            .emit_line("_soX_zero((void*)&l_ret, sizeof(l_ret));");
    }
    e.out().emit_line("_soX_TN");
    for (i, p) in method.sig.params.iter().enumerate() {
        let pname = format!("p_{}", sanitize_field(&p.name));
        let pack = match p.ty.prim {
            PrimType::Float if p.ty.array_level == 0 && p.ty.kind == TypeRefKind::Normal => {
                format!("*(float*)&l_args[{}] = {};", i, pname)
            }
            PrimType::Int | PrimType::Bool | PrimType::Char
                if p.ty.array_level == 0 && p.ty.kind == TypeRefKind::Normal =>
            {
                format!("l_args[{}] = (void*)(int)({});", i, pname)
            }
            _ => format!("l_args[{}] = (void*)({});", i, pname),
        };
        e.out().emit_line(&pack);
    }
    let ret_arg = if ret.is_void() {
        "0".to_string()
    } else {
        "(void*)&l_ret".to_string()
    };
    let send = format!(
        "_soX_msgsnd_sync(self->m_hDomain, (void*)self->m_name, {}, l_args, {});",
        e.method_token(wrapped_mid),
        ret_arg
    );
    e.out().emit_line(&send);
    if !ret.is_void() {
        e.out().emit_line("return l_ret;");
    }
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

/// Static-ctor impls run through `_soX_cctor` so aborts are trapped per
/// class: enum item construction and the user's nameless static ctor.
fn emit_cctor_impl(e: &mut Emitter, id: ClassId) -> Result<(), CompileError> {
    let class = e.md().class(id);
    let has_user = class.static_ctor.is_some();
    let items = class.enum_items.clone();
    if !has_user && items.is_empty() {
        return Ok(());
    }
    let flat = class.flat_name.clone();
    let user_ctor = class.static_ctor;

    e.out()
        .emit_line(&format!("void {}(void) {{", cctor_impl_name(&flat)));
    e.out().indent();
    for (i, item) in items.iter().enumerate() {
        e.out().emit_line(&format!(
            "{} = {}({});",
            mangle::c_static_field_name(&flat, &format!("s_{}", item)),
            mangle::c_method_name(&flat, "createItem"),
            i
        ));
    }
    if let Some(ctor) = user_ctor {
        if e.method_is_emitted_as_c(ctor) {
            let m = e.md().method(ctor);
            e.out().emit_line(&format!(
                "{}();",
                mangle::c_method_name(&flat, &c_name_of_method(m))
            ));
        }
    }
    e.out().dedent();
    e.out().emit_line("}");
    e.out().blank_line();
    Ok(())
}

