//! Vtable slot assignment. The instance-method list of a class is its
//! inherited list with overrides replaced in place and new methods
//! appended, so a method's vtable index always equals its list position
//! and overrides share the index of their base.

use crate::CompileError;
use skizo_metadata::{ClassId, Metadata, MethodId, SpecialClass};
use std::collections::{HashMap, HashSet};

pub fn assign_vtable_indices(md: &mut Metadata) -> Result<(), CompileError> {
    let ids: Vec<ClassId> = md.class_ids().collect();
    let mut done: HashSet<ClassId> = HashSet::new();
    for id in ids {
        merge_class(md, id, &mut done)?;
    }
    Ok(())
}

fn merge_class(
    md: &mut Metadata,
    id: ClassId,
    done: &mut HashSet<ClassId>,
) -> Result<(), CompileError> {
    if done.contains(&id) {
        return Ok(());
    }
    done.insert(id);

    let class = md.class(id);
    if !class.has_vtable {
        // Value types have no vtable; their methods stay non-virtual.
        return Ok(());
    }
    // Generated wrappers fix their own single-slot layouts.
    if matches!(
        class.special,
        SpecialClass::Array | SpecialClass::Boxed | SpecialClass::Foreign
    ) {
        let methods = class.instance_methods.clone();
        for (i, mid) in methods.into_iter().enumerate() {
            md.method_mut(mid).vtable_index = i as i32;
        }
        return Ok(());
    }

    let base_id = md.class(id).base_class();
    let mut merged: Vec<MethodId> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    if let Some(base_id) = base_id {
        merge_class(md, base_id, done)?;
        for (i, &mid) in md.class(base_id).instance_methods.iter().enumerate() {
            merged.push(mid);
            by_name.insert(md.method(mid).name.clone(), i);
        }
    }

    let declared = md.class(id).instance_methods.clone();
    for mid in declared {
        // Skip anything that was already merged in (shells share method ids
        // only via bases, never directly).
        let name = md.method(mid).name.clone();
        match by_name.get(&name) {
            Some(&slot) => {
                let base_mid = merged[slot];
                if base_mid == mid {
                    continue;
                }
                let base_sig = md.method(base_mid).sig.clone();
                if !md.method(mid).sig.matches(&base_sig) {
                    return Err(CompileError::Verify(format!(
                        "Method '{}::{}' overrides '{}' with a different signature",
                        md.class(id).nice_name,
                        name,
                        md.method_full_name(base_mid),
                    )));
                }
                md.method_mut(mid).vtable_index = slot as i32;
                md.method_mut(mid).base_method = Some(base_mid);
                merged[slot] = mid;
            }
            None => {
                let slot = merged.len();
                md.method_mut(mid).vtable_index = slot as i32;
                merged.push(mid);
                by_name.insert(name, slot);
            }
        }
    }

    md.class_mut(id).instance_methods = merged;
    Ok(())
}

/// A virtual method nobody overrides can be called directly; turn its
/// truly-virtual flag off. Overridden methods (and the overrides that can
/// themselves be re-overridden) stay virtual.
pub fn demote_never_overridden(md: &mut Metadata) {
    let mut overridden: HashSet<MethodId> = HashSet::new();
    for mid in md.method_ids() {
        if let Some(base) = md.method(mid).base_method {
            overridden.insert(base);
        }
    }
    let ids: Vec<MethodId> = md.method_ids().collect();
    for mid in ids {
        let method = md.method(mid);
        if method.vtable_index >= 0 {
            let stays_virtual = overridden.contains(&mid)
                || md.class(method.declaring_class).special == SpecialClass::Interface
                || method.is_abstract;
            md.method_mut(mid).is_truly_virtual = stays_virtual;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_units;
    use crate::builtins::register_builtins;
    use skizo_metadata::MemberRef;
    use skizo_parser::Parser;

    fn prepared(source: &str) -> Metadata {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let unit = Parser::new("test", source).unwrap().parse_unit().unwrap();
        build_units(&mut md, &[unit]).unwrap();
        crate::resolver::resolve_all(&mut md).unwrap();
        assign_vtable_indices(&mut md).unwrap();
        demote_never_overridden(&mut md);
        md
    }

    fn method_of(md: &Metadata, class: &str, name: &str) -> MethodId {
        match md.class(md.class_by_flat_name(class).unwrap()).member(name) {
            Some(MemberRef::Method(m)) => m,
            other => panic!("no method {} on {}: {:?}", name, class, other),
        }
    }

    #[test]
    fn test_override_shares_index() {
        let md = prepared(
            "class A { method run:int { return 1; } method only:int { return 2; } }
             class B: A { method run:int { return 3; } }",
        );
        let a_run = method_of(&md, "A", "run");
        let b_run = method_of(&md, "B", "run");
        assert_eq!(md.method(a_run).vtable_index, md.method(b_run).vtable_index);
        assert_eq!(md.method(b_run).base_method, Some(a_run));

        // B's merged list holds the override at the base's slot.
        let b = md.class(md.class_by_flat_name("B").unwrap());
        let slot = md.method(b_run).vtable_index as usize;
        assert_eq!(b.instance_methods[slot], b_run);
        // The inherited, non-overridden method keeps its base entry.
        let a_only = method_of(&md, "A", "only");
        assert!(b.instance_methods.contains(&a_only));
    }

    #[test]
    fn test_index_equals_position() {
        let md = prepared("class A { method m1 { } method m2 { } method m3 { } }");
        let a = md.class(md.class_by_flat_name("A").unwrap());
        for (i, &mid) in a.instance_methods.iter().enumerate() {
            assert_eq!(md.method(mid).vtable_index, i as i32);
        }
    }

    #[test]
    fn test_truly_virtual_demotion() {
        let md = prepared(
            "class A { method over { } method solo { } } class B: A { method over { } }",
        );
        assert!(md.method(method_of(&md, "A", "over")).is_truly_virtual);
        assert!(!md.method(method_of(&md, "A", "solo")).is_truly_virtual);
        // The leaf override itself is never re-overridden.
        assert!(!md.method(method_of(&md, "B", "over")).is_truly_virtual);
    }

    #[test]
    fn test_signature_mismatch_rejected() {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let unit = Parser::new(
            "test",
            "class A { method run:int { return 1; } } class B: A { method run:float { return 1.0; } }",
        )
        .unwrap()
        .parse_unit()
        .unwrap();
        build_units(&mut md, &[unit]).unwrap();
        crate::resolver::resolve_all(&mut md).unwrap();
        assert!(assign_vtable_indices(&mut md).is_err());
    }

    #[test]
    fn test_interface_methods_stay_virtual() {
        let md = prepared(
            "interface I { method run; } class A: I { method run { } }",
        );
        assert!(md.method(method_of(&md, "I", "run")).is_truly_virtual);
    }
}
