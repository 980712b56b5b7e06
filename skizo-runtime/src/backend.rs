//! The C backend session boundary. The backend itself (TinyCC in the
//! reference deployment) is an external collaborator: the runtime hands
//! it the emitted translation unit, registers runtime symbols, and pulls
//! compiled symbols back out.
//!
//! The backend is not reentrant, so a process-wide mutex brackets every
//! session. It is a process-level singleton with `init()`/`shutdown()`
//! semantics owned by the embedder.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard, OnceLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("C backend compilation failed: {0}")]
    Compile(String),
    #[error("C backend session is closed")]
    Closed,
}

/// One compile-and-link session per domain.
pub trait CBackend: Send {
    /// Makes a host symbol visible to the compiled unit.
    fn add_symbol(&mut self, name: &str, ptr: *const c_void);

    /// Compiles and links the translation unit in-process.
    fn compile(&mut self, c_source: &str) -> Result<(), BackendError>;

    /// Resolves a symbol from the compiled unit (or a registered one).
    fn symbol(&self, name: &str) -> Option<*const c_void>;
}

static BACKEND_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();

/// The process-wide backend lock. Every compile runs under it.
pub fn backend_lock() -> MutexGuard<'static, ()> {
    BACKEND_MUTEX
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// A recording backend for tests and dry runs: it keeps the source and
/// resolves only symbols that were registered by the host.
#[derive(Default)]
pub struct StubBackend {
    symbols: HashMap<String, usize>,
    compiled_source: Option<String>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiled_source(&self) -> Option<&str> {
        self.compiled_source.as_deref()
    }
}

impl CBackend for StubBackend {
    fn add_symbol(&mut self, name: &str, ptr: *const c_void) {
        self.symbols.insert(name.to_string(), ptr as usize);
    }

    fn compile(&mut self, c_source: &str) -> Result<(), BackendError> {
        self.compiled_source = Some(c_source.to_string());
        Ok(())
    }

    fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.symbols.get(name).map(|&p| p as *const c_void)
    }
}

unsafe impl Send for StubBackend {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_backend_records_and_resolves() {
        let mut backend = StubBackend::new();
        backend.add_symbol("_soX_gc_alloc", 0x1234 as *const c_void);
        backend.compile("int main;").unwrap();
        assert_eq!(backend.compiled_source(), Some("int main;"));
        assert_eq!(backend.symbol("_soX_gc_alloc"), Some(0x1234 as *const c_void));
        assert!(backend.symbol("_so_Program_main").is_none());
    }

    #[test]
    fn test_backend_lock_is_reentrant_across_threads() {
        let guard = backend_lock();
        drop(guard);
        let handle = std::thread::spawn(|| {
            let _guard = backend_lock();
        });
        handle.join().unwrap();
    }
}
