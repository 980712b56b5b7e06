//! The Skizo runtime: GC heap over a pool allocator, the x86 thunk
//! manager, the domain lifecycle that binds compilation and execution
//! together, and cross-domain remoting.
//!
//! One domain per OS thread; within a domain all user code, the GC and
//! the C backend run single-threaded. The only cross-thread structures
//! are the message queue, the exported-objects table and the process-wide
//! backend mutex.

pub mod activator;
pub mod backend;
pub mod domain;
pub mod ecall;
pub mod gc;
pub mod helpers;
pub mod icalls;
pub mod pool;
pub mod profiling;
pub mod remoting;
pub mod security;
pub mod strings;
pub mod thunks;

use thiserror::Error;

pub use backend::{backend_lock, BackendError, CBackend, StubBackend};
pub use domain::{create_remote_domain, last_error, Domain, DomainCreation, DomainFlags};
pub use gc::{MemoryManager, MIN_GC_THRESHOLD};
pub use pool::PoolAllocator;
pub use remoting::{DomainHandle, RemotingError, DOMAIN_TIMEOUT, MESSAGEQUEUE_TIMEOUT, REMOTE_CALL_TIMEOUT};
pub use strings::view_string_data;
pub use thunks::{ThunkError, ThunkManager};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Compilation failed: {0}")]
    Compile(#[from] skizo_compiler::CompileError),
    #[error("Parse failed: {0}")]
    Parse(#[from] skizo_parser::ParseError),
    #[error("Backend failed: {0}")]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Thunk(#[from] ThunkError),
    #[error("{0}")]
    Remoting(#[from] RemotingError),
    #[error("A domain is already bound to this thread")]
    ThreadAlreadyBound,
    #[error("Missing icall '{0}'")]
    MissingICall(String),
    #[error("Missing ecall '{0}' in module '{1}'")]
    MissingECall(String, String),
    #[error("Entry point '{0}' not found")]
    MissingEntryPoint(String),
    #[error("Import '{0}' not found in any search path")]
    MissingImport(String),
    #[error("Domain aborted: {0}")]
    Aborted(String),
}
