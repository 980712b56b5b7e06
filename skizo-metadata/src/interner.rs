//! Name interner. Metadata is read-only after the transformer finishes and
//! may be inspected from another domain's thread during remoting
//! handshakes, so the interner is concurrent.

use dashmap::DashMap;
use std::sync::RwLock;

/// Interned string handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sym(pub u32);

#[derive(Debug, Default)]
pub struct Interner {
    map: DashMap<String, Sym>,
    strings: RwLock<Vec<String>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, s: &str) -> Sym {
        if let Some(sym) = self.map.get(s) {
            return *sym;
        }
        let mut strings = self.strings.write().unwrap_or_else(|e| e.into_inner());
        // Double-check under the write lock.
        if let Some(sym) = self.map.get(s) {
            return *sym;
        }
        let sym = Sym(strings.len() as u32);
        strings.push(s.to_string());
        self.map.insert(s.to_string(), sym);
        sym
    }

    pub fn resolve(&self, sym: Sym) -> Option<String> {
        let strings = self.strings.read().unwrap_or_else(|e| e.into_inner());
        strings.get(sym.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.strings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedups() {
        let interner = Interner::new();
        let a = interner.intern("Program");
        let b = interner.intern("Program");
        let c = interner.intern("main");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.resolve(a).as_deref(), Some("Program"));
        assert_eq!(interner.len(), 2);
    }
}
