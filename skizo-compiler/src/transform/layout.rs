//! Field layout and GC maps. Runs once all field types are resolved: a
//! class's map is the sorted offsets of its reference-typed instance
//! fields plus the recursive expansion of embedded value-type fields.

use crate::resolver::{is_reference_typeref, size_for_use_of};
use crate::CompileError;
use skizo_metadata::{
    ClassId, Metadata, PrimType, SpecialClass, OBJECT_HEADER_SIZE, WORD_SIZE,
};
use std::collections::HashSet;

pub fn compute_layouts(md: &mut Metadata) -> Result<(), CompileError> {
    let ids: Vec<ClassId> = md.class_ids().collect();
    let mut in_progress = HashSet::new();
    for id in ids {
        layout_class(md, id, &mut in_progress)?;
    }
    Ok(())
}

fn needs_layout(md: &Metadata, id: ClassId) -> bool {
    let class = md.class(id);
    match class.special {
        SpecialClass::None | SpecialClass::EventClass | SpecialClass::ClosureEnv => {}
        // Wrappers, blobs and method classes computed their layout at
        // generation time; primitives at registration.
        _ => return false,
    }
    if class.native_size.is_some() {
        return false;
    }
    // Builtins carry hand-assigned layouts.
    class.gc_info.content_size == 0
}

fn layout_class(
    md: &mut Metadata,
    id: ClassId,
    in_progress: &mut HashSet<ClassId>,
) -> Result<(), CompileError> {
    if !needs_layout(md, id) {
        return Ok(());
    }
    if !in_progress.insert(id) {
        return Err(CompileError::Verify(format!(
            "Value type '{}' embeds itself",
            md.class(id).nice_name
        )));
    }

    let is_value = md.class(id).is_value_type;

    // Base-class fields come first; lay the base out before us.
    let mut offset = if is_value {
        0
    } else {
        let mut base_size = OBJECT_HEADER_SIZE;
        if let Some(base_id) = md.class(id).base_class() {
            layout_class(md, base_id, in_progress)?;
            let base = md.class(base_id);
            if base.special == SpecialClass::None && !base.is_hierarchy_root {
                base_size = base.gc_info.content_size.max(OBJECT_HEADER_SIZE);
            }
        }
        base_size
    };

    let mut gc_map: Vec<u32> = if !is_value {
        if let Some(base_id) = md.class(id).base_class() {
            md.class(base_id).gc_info.gc_map.clone()
        } else {
            Vec::new()
        }
    } else {
        Vec::new()
    };

    let field_ids = md.class(id).instance_fields.clone();
    for fid in field_ids {
        let ty = md.field(fid).ty.clone();

        // Embedded value types need their own layout first.
        if ty.prim == PrimType::Object && ty.array_level == 0 {
            if let Some(field_class) = ty.resolved {
                if md.class(field_class).is_value_type {
                    layout_class(md, field_class, in_progress)?;
                }
            }
        }

        let size = size_for_use_of(md, &ty);
        let align = size.clamp(1, WORD_SIZE);
        offset = offset.next_multiple_of(align);
        md.field_mut(fid).offset = offset;

        if is_reference_typeref(md, &ty) {
            gc_map.push(offset);
        } else if let Some(field_class) = ty.resolved {
            let inner = md.class(field_class);
            if inner.is_value_type {
                for &inner_off in &inner.gc_info.gc_map.clone() {
                    gc_map.push(offset + inner_off);
                }
            }
        }

        offset += size;
    }

    let content_size = offset.next_multiple_of(WORD_SIZE);
    gc_map.sort_unstable();
    gc_map.dedup();

    let class = md.class_mut(id);
    class.gc_info.content_size = content_size;
    class.gc_info.size_for_use = if is_value { content_size } else { WORD_SIZE };
    class.gc_info.gc_map = gc_map;

    in_progress.remove(&id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_units;
    use crate::builtins::register_builtins;
    use skizo_parser::Parser;

    fn prepared(source: &str) -> Metadata {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let unit = Parser::new("test", source).unwrap().parse_unit().unwrap();
        build_units(&mut md, &[unit]).unwrap();
        crate::resolver::resolve_all(&mut md).unwrap();
        compute_layouts(&mut md).unwrap();
        md
    }

    #[test]
    fn test_reference_class_layout() {
        let md = prepared("class A { field x:int; field s:string; field c:char; }");
        let a = md.class(md.class_by_flat_name("A").unwrap());
        let offsets: Vec<u32> = a
            .instance_fields
            .iter()
            .map(|&f| md.field(f).offset)
            .collect();
        // header(4), x@4, s@8, c@12
        assert_eq!(offsets, vec![4, 8, 12]);
        assert_eq!(a.gc_info.content_size, 16);
        assert_eq!(a.gc_info.gc_map, vec![8]);
    }

    #[test]
    fn test_value_type_layout_and_embedding() {
        let md = prepared(
            "struct Inner { field s:string; field n:int; } class Outer { field i:Inner; field t:string; }",
        );
        let inner = md.class(md.class_by_flat_name("Inner").unwrap());
        assert_eq!(inner.gc_info.content_size, 8);
        assert_eq!(inner.gc_info.gc_map, vec![0]);
        assert_eq!(inner.gc_info.size_for_use, 8);

        let outer = md.class(md.class_by_flat_name("Outer").unwrap());
        // header(4), i@4 (8 bytes), t@12
        assert_eq!(outer.gc_info.content_size, 16);
        // Inner's string at 4+0, t at 12.
        assert_eq!(outer.gc_info.gc_map, vec![4, 12]);
    }

    #[test]
    fn test_inherited_fields_offset_after_base() {
        let md = prepared("class A { field x:int; } class B: A { field y:int; }");
        let b = md.class(md.class_by_flat_name("B").unwrap());
        let y = md.field(b.instance_fields[0]);
        assert_eq!(y.name, "y");
        assert_eq!(y.offset, 8);
        assert_eq!(b.gc_info.content_size, 12);
    }

    #[test]
    fn test_self_embedding_struct_rejected() {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let unit = Parser::new("test", "struct S { field inner:S; }")
            .unwrap()
            .parse_unit()
            .unwrap();
        build_units(&mut md, &[unit]).unwrap();
        crate::resolver::resolve_all(&mut md).unwrap();
        assert!(compute_layouts(&mut md).is_err());
    }

    #[test]
    fn test_char_alignment() {
        let md = prepared("class A { field c:char; field d:char; field x:int; }");
        let a = md.class(md.class_by_flat_name("A").unwrap());
        let offsets: Vec<u32> = a
            .instance_fields
            .iter()
            .map(|&f| md.field(f).offset)
            .collect();
        // chars are 2-byte aligned, the int realigns to 4.
        assert_eq!(offsets, vec![4, 6, 8]);
    }
}
