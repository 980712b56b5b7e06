//! Dependency injection: interface-to-implementation bindings and
//! class singletons, instantiable by nice name through default ctors.

use skizo_metadata::{ClassId, Metadata};
use std::collections::HashMap;

#[derive(Default)]
pub struct Activator {
    /// interface -> concrete implementation
    bindings: HashMap<ClassId, ClassId>,
    /// class -> pinned singleton instance
    singletons: HashMap<ClassId, usize>,
}

impl Activator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dependency(&mut self, interface: ClassId, implementation: ClassId) {
        self.bindings.insert(interface, implementation);
    }

    pub fn get_dependency(&self, interface: ClassId) -> Option<ClassId> {
        self.bindings.get(&interface).copied()
    }

    pub fn set_singleton(&mut self, class: ClassId, instance: usize) {
        self.singletons.insert(class, instance);
    }

    pub fn singleton(&self, class: ClassId) -> Option<usize> {
        self.singletons.get(&class).copied()
    }

    /// The class to instantiate for a nice name: the binding target when
    /// the name is a bound interface, the class itself otherwise.
    pub fn resolve_class(&self, md: &Metadata, nice_name: &str) -> Option<ClassId> {
        let class = md.class_by_nice_name(nice_name)?;
        Some(self.get_dependency(class).unwrap_or(class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_metadata::Class;

    #[test]
    fn test_binding_resolution() {
        let mut md = Metadata::new();
        let iface = md.next_class_id();
        md.register_class(Class::new(iface, "Greeter")).unwrap();
        let imp = md.next_class_id();
        md.register_class(Class::new(imp, "ConsoleGreeter")).unwrap();

        let mut activator = Activator::new();
        assert_eq!(activator.resolve_class(&md, "Greeter"), Some(iface));
        activator.add_dependency(iface, imp);
        assert_eq!(activator.resolve_class(&md, "Greeter"), Some(imp));
        assert_eq!(activator.resolve_class(&md, "Missing"), None);
    }

    #[test]
    fn test_singletons() {
        let mut activator = Activator::new();
        activator.set_singleton(ClassId(3), 0xBEEF);
        assert_eq!(activator.singleton(ClassId(3)), Some(0xBEEF));
        assert_eq!(activator.singleton(ClassId(4)), None);
    }
}
