//! Flat-name mangling for generated wrapper classes and emitted C symbols.
//!
//! Generated flat names start with a digit so they can never collide with
//! user classes; the `_so_` prefix in emitted C keeps them valid
//! identifiers there.

use skizo_metadata::{Metadata, PrimType, TypeRef, TypeRefKind};

/// Flat name of the class backing a (resolved-inner) typeref.
pub fn flat_name_for(md: &Metadata, ty: &TypeRef) -> String {
    if ty.kind == TypeRefKind::Failable {
        let inner = ty.inner().unwrap_or_else(TypeRef::void);
        return failable_flat_name(&flat_name_for(md, &inner));
    }
    if ty.kind == TypeRefKind::Foreign {
        let inner = ty.inner().unwrap_or_else(TypeRef::void);
        return foreign_flat_name(&flat_name_for(md, &inner));
    }
    if ty.array_level > 0 {
        let inner = ty.inner().unwrap_or_else(TypeRef::void);
        return array_flat_name(&flat_name_for(md, &inner));
    }
    match ty.prim {
        PrimType::Void => "void".to_string(),
        PrimType::Int => "int".to_string(),
        PrimType::Float => "float".to_string(),
        PrimType::Bool => "bool".to_string(),
        PrimType::Char => "char".to_string(),
        PrimType::IntPtr => "intptr".to_string(),
        PrimType::Object => match ty.resolved {
            Some(id) => md.class(id).flat_name.clone(),
            None => ty.class_name.clone().unwrap_or_default(),
        },
    }
}

pub fn array_flat_name(element_flat: &str) -> String {
    format!("0Array_{}", element_flat)
}

pub fn failable_flat_name(inner_flat: &str) -> String {
    format!("0Failable_{}", inner_flat)
}

pub fn boxed_flat_name(inner_flat: &str) -> String {
    format!("0Boxed_{}", inner_flat)
}

pub fn foreign_flat_name(inner_flat: &str) -> String {
    format!("0Foreign_{}", inner_flat)
}

pub fn closure_flat_name(n: u32) -> String {
    format!("0Closure_{}", n)
}

pub fn closure_env_flat_name(n: u32) -> String {
    format!("0ClosureEnv_{}", n)
}

pub fn event_flat_name(owner_flat: &str, event_name: &str) -> String {
    format!("0Event_{}_{}", owner_flat, event_name)
}

/// Emitted C identifier for a class's struct.
pub fn c_struct_name(flat: &str) -> String {
    format!("_so_{}", sanitize(flat))
}

/// Emitted C identifier for a method.
pub fn c_method_name(class_flat: &str, method_name: &str) -> String {
    format!("_so_{}_{}", sanitize(class_flat), sanitize_method(method_name))
}

/// Emitted C identifier for a static field.
pub fn c_static_field_name(class_flat: &str, field_name: &str) -> String {
    format!("_so_{}_{}", sanitize(class_flat), sanitize(field_name))
}

/// Emitted C identifier for a vtable array.
pub fn c_vtable_name(class_flat: &str) -> String {
    format!("_so_vtbl_{}", sanitize(class_flat))
}

/// Emitted C identifier for a virtual call helper.
pub fn c_vch_name(class_flat: &str, method_name: &str) -> String {
    format!(
        "_soX_vch_{}_{}",
        sanitize(class_flat),
        sanitize_method(method_name)
    )
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Operator method names map to readable suffixes.
fn sanitize_method(name: &str) -> String {
    match name {
        "+" => "op_add".to_string(),
        "-" => "op_subtract".to_string(),
        "*" => "op_multiply".to_string(),
        "/" => "op_divide".to_string(),
        "%" => "op_modulo".to_string(),
        "<" => "op_lessThan".to_string(),
        ">" => "op_greaterThan".to_string(),
        "==" => "op_equals".to_string(),
        "|" => "op_or".to_string(),
        "&" => "op_and".to_string(),
        _ => sanitize(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_names() {
        assert_eq!(array_flat_name("int"), "0Array_int");
        assert_eq!(array_flat_name("0Array_int"), "0Array_0Array_int");
        assert_eq!(failable_flat_name("int"), "0Failable_int");
        assert_eq!(boxed_flat_name("Point"), "0Boxed_Point");
    }

    #[test]
    fn test_c_names() {
        assert_eq!(c_struct_name("0Array_int"), "_so_0Array_int");
        assert_eq!(c_method_name("int", "+"), "_so_int_op_add");
        assert_eq!(c_static_field_name("Color", "s_Red"), "_so_Color_s_Red");
        assert_eq!(c_vch_name("A", "get"), "_soX_vch_A_get");
    }

    #[test]
    fn test_flat_name_for_composites() {
        let md = Metadata::new();
        let ty = TypeRef::int().array_of().failable_of();
        assert_eq!(flat_name_for(&md, &ty), "0Failable_0Array_int");
    }
}
