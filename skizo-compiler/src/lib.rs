//! The Skizo compiler front half: lowering parsed units into domain
//! metadata, resolving typerefs, transforming method bodies, and emitting
//! the self-contained C translation unit the backend compiles.

pub mod builder;
pub mod builtins;
pub mod emit;
pub mod mangle;
pub mod pipeline;
pub mod resolver;
pub mod text;
pub mod transform;

use skizo_metadata::MetadataError;
use thiserror::Error;

pub use emit::Emitter;
pub use pipeline::{compile_units, Compilation};
pub use text::TextBuilder;

/// Compile-time flags that shape transformation and emission. Mirrors the
/// domain-creation flags that matter before any user code runs.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub stack_trace_enabled: bool,
    pub profiling_enabled: bool,
    pub soft_debugging_enabled: bool,
    pub explicit_null_check: bool,
    pub safe_callbacks: bool,
    pub inline_branching: bool,
    pub is_trusted: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            stack_trace_enabled: false,
            profiling_enabled: false,
            soft_debugging_enabled: false,
            explicit_null_check: true,
            safe_callbacks: false,
            inline_branching: true,
            is_trusted: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Metadata(#[from] MetadataError),
    #[error("Unresolved type '{0}'{1}")]
    UnresolvedType(String, String),
    #[error("{module}:{line}: {message}")]
    Transform {
        module: String,
        line: u32,
        message: String,
    },
    #[error("Verification failed: {0}")]
    Verify(String),
}

impl CompileError {
    pub fn transform(module: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        CompileError::Transform {
            module: module.into(),
            line,
            message: message.into(),
        }
    }
}
