//! The transformer: after resolution it walks every method body, binds
//! identifiers, infers types, lifts captures into closure-env classes,
//! inlines branch forms, assigns vtable slots, marks inlinable getters and
//! computes GC maps. Metadata is read-only once this pass finishes.

mod infer;
mod layout;
mod verify;
mod vtable;

pub use infer::TransformState;

use crate::{CompileError, CompileOptions};
use skizo_metadata::{CallConv, Metadata, MethodId, SpecialMethod};

pub fn transform_all(md: &mut Metadata, options: &CompileOptions) -> Result<(), CompileError> {
    layout::compute_layouts(md)?;
    vtable::assign_vtable_indices(md)?;

    resolve_ecall_attributes(md, options)?;

    let mut state = TransformState::new(options.clone());
    let method_ids: Vec<MethodId> = md.method_ids().collect();
    for mid in method_ids {
        if md.method(mid).body.is_some() && md.method(mid).parent_method.is_none() {
            state.transform_method(md, mid)?;
        }
    }
    state.fixup_captured_accesses(md);
    state.build_closure_envs(md)?;

    mark_inlinable_getters(md, options);
    vtable::demote_never_overridden(md);
    verify::verify_all(md)?;

    log::debug!(
        "transform finished: {} classes, {} methods, arena {:?}",
        md.class_count(),
        md.method_count(),
        md.arena_stats()
    );
    Ok(())
}

/// `[module=...]` and `[callConv=...]` populate the ECall descriptor. In
/// untrusted domains, ECalls compile to stubs that abort at call time.
fn resolve_ecall_attributes(
    md: &mut Metadata,
    options: &CompileOptions,
) -> Result<(), CompileError> {
    let method_ids: Vec<MethodId> = md.method_ids().collect();
    for mid in method_ids {
        let method = md.method(mid);
        if method.special != SpecialMethod::Native || method.attrs_resolved {
            continue;
        }
        let module = method.attr_value("module");
        let call_conv = method.attr_value("callConv");
        let name = method.name.clone();

        let method = md.method_mut(mid);
        if let Some(module) = module {
            if options.is_trusted {
                method.ecall.module = Some(module);
                method.ecall.entry_point = Some(name);
            } else {
                method.special = SpecialMethod::DisallowedECall;
            }
        }
        if let Some(conv) = call_conv {
            method.ecall.call_conv = match conv.as_str() {
                "stdcall" => CallConv::Stdcall,
                "cdecl" => CallConv::Cdecl,
                other => {
                    return Err(CompileError::Verify(format!(
                        "Unknown calling convention '{}'",
                        other
                    )))
                }
            };
        }
        method.attrs_resolved = true;
    }
    Ok(())
}

/// A non-virtual instance method whose whole body is `return field;` gets
/// tagged with the field so the emitter can inline the access. Explicit
/// null checking keeps the call so the check still runs.
fn mark_inlinable_getters(md: &mut Metadata, options: &CompileOptions) {
    if options.explicit_null_check {
        return;
    }
    use skizo_ast::{ExprKind, ResolvedIdent};

    let method_ids: Vec<MethodId> = md.method_ids().collect();
    for mid in method_ids {
        let method = md.method(mid);
        if method.is_truly_virtual
            || method.is_unsafe
            || method.sig.is_static
            || method.kind != skizo_metadata::MethodKind::Normal
            || method.special != SpecialMethod::None
        {
            continue;
        }
        let Some(body) = &method.body else { continue };
        if body.exprs.len() != 1 {
            continue;
        }
        let ExprKind::Return(inner) = &body.exprs[0].kind else {
            continue;
        };
        let ExprKind::Ident(ident) = &inner.kind else {
            continue;
        };
        if let Some(ResolvedIdent::Field(fid)) = ident.resolved {
            if !md.field(fid).is_static {
                md.method_mut(mid).inlinable_field = Some(fid);
            }
        }
    }
}

trait AttrLookup {
    fn attr_value(&self, name: &str) -> Option<String>;
}

impl AttrLookup for skizo_metadata::Method {
    fn attr_value(&self, name: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.clone())
    }
}
