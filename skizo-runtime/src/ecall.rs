//! The ECall cache: native modules loaded from dynamic libraries, keyed
//! by module name, with per-entry-point symbol caching. Modules unload at
//! domain teardown.

use std::collections::HashMap;
use std::ffi::CString;

pub struct ECallCache {
    modules: HashMap<String, *mut libc::c_void>,
    symbols: HashMap<(String, String), usize>,
    search_paths: Vec<std::path::PathBuf>,
}

impl ECallCache {
    pub fn new(search_paths: Vec<std::path::PathBuf>) -> Self {
        ECallCache {
            modules: HashMap::new(),
            symbols: HashMap::new(),
            search_paths,
        }
    }

    /// Resolves `entry_point` inside `module`, loading the module on
    /// first use. Returns None when the module or symbol is missing.
    pub fn resolve(&mut self, module: &str, entry_point: &str) -> Option<usize> {
        let key = (module.to_string(), entry_point.to_string());
        if let Some(&ptr) = self.symbols.get(&key) {
            return Some(ptr);
        }

        let handle = match self.modules.get(module) {
            Some(&h) => h,
            None => {
                let handle = self.open_module(module)?;
                self.modules.insert(module.to_string(), handle);
                handle
            }
        };

        let symbol_name = CString::new(entry_point).ok()?;
        let ptr = unsafe { libc::dlsym(handle, symbol_name.as_ptr()) };
        if ptr.is_null() {
            return None;
        }
        self.symbols.insert(key, ptr as usize);
        Some(ptr as usize)
    }

    fn open_module(&self, module: &str) -> Option<*mut libc::c_void> {
        let mut candidates = vec![
            format!("lib{}.so", module),
            format!("{}.so", module),
            module.to_string(),
        ];
        for path in &self.search_paths {
            candidates.push(path.join(format!("lib{}.so", module)).display().to_string());
        }
        for candidate in candidates {
            let c_name = CString::new(candidate).ok()?;
            let handle = unsafe { libc::dlopen(c_name.as_ptr(), libc::RTLD_NOW) };
            if !handle.is_null() {
                return Some(handle);
            }
        }
        None
    }

    pub fn loaded_module_count(&self) -> usize {
        self.modules.len()
    }

    /// Unloads every module; called during domain teardown.
    pub fn unload_all(&mut self) {
        for (_, handle) in self.modules.drain() {
            unsafe {
                libc::dlclose(handle);
            }
        }
        self.symbols.clear();
    }
}

impl Drop for ECallCache {
    fn drop(&mut self) {
        self.unload_all();
    }
}

unsafe impl Send for ECallCache {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_module_is_none() {
        let mut cache = ECallCache::new(vec![]);
        assert!(cache.resolve("definitely_not_a_module_xyz", "entry").is_none());
        assert_eq!(cache.loaded_module_count(), 0);
    }

    #[test]
    fn test_libm_symbol_resolves_and_caches() {
        let mut cache = ECallCache::new(vec![]);
        // libm ships everywhere we build; cosf is a stable export.
        let first = cache.resolve("m", "cosf");
        if let Some(ptr) = first {
            assert_ne!(ptr, 0);
            assert_eq!(cache.resolve("m", "cosf"), Some(ptr));
            assert_eq!(cache.loaded_module_count(), 1);
        }
    }
}
