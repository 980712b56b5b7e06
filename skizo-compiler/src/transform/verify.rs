//! Whole-program verification after transformation.

use crate::CompileError;
use skizo_metadata::{ClassId, Metadata, SpecialClass};

pub fn verify_all(md: &mut Metadata) -> Result<(), CompileError> {
    let ids: Vec<ClassId> = md.class_ids().collect();
    for id in ids {
        verify_abstract_implemented(md, id)?;
        flag_static_ctor(md, id);
    }
    Ok(())
}

/// A concrete class must implement every abstract method it inherits,
/// including interface methods.
fn verify_abstract_implemented(md: &Metadata, id: ClassId) -> Result<(), CompileError> {
    let class = md.class(id);
    if class.is_abstract
        || class.special == SpecialClass::Interface
        || !class.has_vtable
        || class.is_compiler_generated
    {
        return Ok(());
    }
    for &mid in &class.instance_methods {
        let method = md.method(mid);
        if method.is_abstract || md.class(method.declaring_class).special == SpecialClass::Interface
        {
            return Err(CompileError::Verify(format!(
                "Class '{}' does not implement '{}'",
                class.nice_name,
                md.method_full_name(mid)
            )));
        }
    }
    Ok(())
}

/// Classes with a user static ctor need type-init checks at use sites.
fn flag_static_ctor(md: &mut Metadata, id: ClassId) {
    if md.class(id).static_ctor.is_some() {
        md.class_mut(id).has_static_ctor_check = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_units;
    use crate::builtins::register_builtins;
    use crate::transform::vtable;
    use skizo_metadata::Metadata;
    use skizo_parser::Parser;

    fn prepared(source: &str) -> Result<Metadata, CompileError> {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let unit = Parser::new("test", source).unwrap().parse_unit().unwrap();
        build_units(&mut md, &[unit])?;
        crate::resolver::resolve_all(&mut md)?;
        vtable::assign_vtable_indices(&mut md)?;
        verify_all(&mut md)?;
        Ok(md)
    }

    #[test]
    fn test_missing_interface_impl_rejected() {
        let result = prepared("interface I { method run; } class A: I { }");
        assert!(result.is_err());
    }

    #[test]
    fn test_implemented_interface_passes() {
        assert!(prepared("interface I { method run; } class A: I { method run { } }").is_ok());
    }

    #[test]
    fn test_missing_abstract_impl_rejected() {
        let result =
            prepared("abstract class A { abstract method run; } class B: A { }");
        assert!(result.is_err());
    }

    #[test]
    fn test_static_ctor_flagged() {
        let md = prepared("class A { static ctor { } }").unwrap();
        let a = md.class(md.class_by_flat_name("A").unwrap());
        assert!(a.has_static_ctor_check);
    }
}
