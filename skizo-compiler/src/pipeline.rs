//! The front-to-back compilation pipeline a domain drives: builtins,
//! lowering, resolution, transformation, emission.

use crate::{builder, builtins, emit, resolver, transform, CompileError, CompileOptions};
use skizo_ast::Unit;
use skizo_metadata::Metadata;

/// Everything the domain needs from compilation. Metadata is read-only
/// from here on.
#[derive(Debug)]
pub struct Compilation {
    pub metadata: Metadata,
    pub c_source: String,
    pub string_literals: Vec<String>,
}

pub fn compile_units(
    units: &[Unit],
    options: &CompileOptions,
) -> Result<Compilation, CompileError> {
    let mut md = Metadata::new();
    builtins::register_builtins(&mut md)?;
    builder::build_units(&mut md, units)?;

    // Forced typerefs materialise wrapper classes even when no user code
    // mentions them syntactically.
    for unit in units {
        for forced in &unit.forced_typerefs {
            let mut ty = forced.clone();
            resolver::resolve_typeref(&mut md, &mut ty)?;
        }
    }

    resolver::resolve_all(&mut md)?;
    transform::transform_all(&mut md, options)?;

    let result = emit::Emitter::new(&md, options).emit()?;
    log::info!(
        "compiled {} class(es) into {} byte(s) of C",
        md.class_count(),
        result.c_source.len()
    );

    Ok(Compilation {
        metadata: md,
        c_source: result.c_source,
        string_literals: result.string_literals,
    })
}
