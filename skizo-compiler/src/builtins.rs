//! Registration of built-in classes: `any`, the primitives, `string`,
//! `Error`, `Range`, `Predicate`, `Action`, and the `Console` icall surface.
//! Runs first during domain creation so user code can resolve against them.

use crate::CompileError;
use skizo_ast::Access;
use skizo_metadata::{
    prim_size, Class, ClassId, Field, Metadata, Method, MethodId, MethodKind, Param, PrimType,
    Signature, SpecialClass, SpecialMethod, TypeRef, OBJECT_HEADER_SIZE, WORD_SIZE,
};

/// Shared closure layout: { vtable, env, code_offset }. Every method class
/// instance uses it, and the emitter's `Closure` C struct must match.
pub const CLOSURE_CONTENT_SIZE: u32 = 12;
pub const CLOSURE_ENV_OFFSET: u32 = 4;

pub fn register_builtins(md: &mut Metadata) -> Result<(), CompileError> {
    // The hierarchy root.
    let any_id = {
        let id = md.next_class_id();
        let mut c = Class::new(id, "any");
        c.is_hierarchy_root = true;
        c.is_abstract = true;
        c.has_vtable = true;
        c.gc_info.content_size = OBJECT_HEADER_SIZE;
        c.gc_info.size_for_use = WORD_SIZE;
        md.register_class(c)?
    };

    register_primitive(md, "int", PrimType::Int)?;
    register_primitive(md, "float", PrimType::Float)?;
    register_primitive(md, "bool", PrimType::Bool)?;
    register_primitive(md, "char", PrimType::Char)?;
    register_primitive(md, "intptr", PrimType::IntPtr)?;

    register_string(md, any_id)?;
    register_error(md, any_id)?;
    register_range(md)?;
    register_method_class(md, "Predicate", TypeRef::bool_())?;
    register_method_class(md, "Action", TypeRef::void())?;
    register_console(md)?;

    add_primitive_operators(md)?;

    Ok(())
}

fn register_primitive(md: &mut Metadata, name: &str, prim: PrimType) -> Result<ClassId, CompileError> {
    let id = md.next_class_id();
    let mut c = Class::new(id, name);
    c.is_value_type = true;
    c.is_initialized = true;
    let size = prim_size(prim);
    c.gc_info.content_size = size;
    c.gc_info.size_for_use = size;
    Ok(md.register_class(c)?)
}

fn register_string(md: &mut Metadata, any_id: ClassId) -> Result<(), CompileError> {
    let id = md.next_class_id();
    let mut c = Class::new(id, "string");
    c.has_vtable = true;
    c.is_initialized = true;
    let mut base = TypeRef::object("any");
    base.resolved = Some(any_id);
    c.base = Some(base);
    // Layout: { vtable, int length, utf16 chars... } — dynamically sized,
    // like arrays.
    c.gc_info.content_size = OBJECT_HEADER_SIZE + 4;
    c.gc_info.size_for_use = WORD_SIZE;
    let id = md.register_class(c)?;

    let length = native_method(md, id, "length", &[], TypeRef::int(), false);
    let concat = native_method(
        md,
        id,
        "+",
        &[("other", TypeRef::object("string"))],
        TypeRef::object("string"),
        false,
    );
    let equals = native_method(
        md,
        id,
        "==",
        &[("other", TypeRef::object("string"))],
        TypeRef::bool_(),
        false,
    );
    let to_string = native_method(md, id, "toString", &[], TypeRef::object("string"), false);
    attach_methods(md, id, &[length, concat, equals, to_string]);
    Ok(())
}

fn register_error(md: &mut Metadata, any_id: ClassId) -> Result<(), CompileError> {
    let id = md.next_class_id();
    let mut c = Class::new(id, "Error");
    c.has_vtable = true;
    c.is_initialized = true;
    let mut base = TypeRef::object("any");
    base.resolved = Some(any_id);
    c.base = Some(base);
    c.gc_info.content_size = OBJECT_HEADER_SIZE + WORD_SIZE;
    c.gc_info.size_for_use = WORD_SIZE;
    c.gc_info.gc_map = vec![OBJECT_HEADER_SIZE];
    let id = md.register_class(c)?;

    let field_id = md.next_field_id();
    md.add_field(Field {
        id: field_id,
        declaring_class: id,
        access: Access::Private,
        is_static: false,
        name: "m_message".to_string(),
        ty: TypeRef::object("string"),
        offset: OBJECT_HEADER_SIZE,
        attrs: Vec::new(),
    });
    md.class_mut(id).instance_fields.push(field_id);
    md.class_mut(id)
        .name_set
        .insert("m_message".to_string(), skizo_metadata::MemberRef::Field(field_id));

    let message = native_method(md, id, "message", &[], TypeRef::object("string"), false);
    attach_methods(md, id, &[message]);

    let ctor = native_ctor(
        md,
        id,
        "create",
        &[("message", TypeRef::object("string"))],
    );
    md.class_mut(id).instance_ctors.push(ctor);
    md.class_mut(id)
        .name_set
        .insert("create".to_string(), skizo_metadata::MemberRef::Method(ctor));
    Ok(())
}

fn register_range(md: &mut Metadata) -> Result<(), CompileError> {
    let id = md.next_class_id();
    let mut c = Class::new(id, "Range");
    c.is_value_type = true;
    c.is_initialized = true;
    c.gc_info.content_size = 8;
    c.gc_info.size_for_use = 8;
    let id = md.register_class(c)?;

    for (i, name) in ["m_from", "m_to"].iter().enumerate() {
        let field_id = md.next_field_id();
        md.add_field(Field {
            id: field_id,
            declaring_class: id,
            access: Access::Private,
            is_static: false,
            name: name.to_string(),
            ty: TypeRef::int(),
            offset: (i * 4) as u32,
            attrs: Vec::new(),
        });
        md.class_mut(id).instance_fields.push(field_id);
        md.class_mut(id)
            .name_set
            .insert(name.to_string(), skizo_metadata::MemberRef::Field(field_id));
    }
    Ok(())
}

fn register_method_class(
    md: &mut Metadata,
    name: &str,
    invoke_ret: TypeRef,
) -> Result<ClassId, CompileError> {
    let id = md.next_class_id();
    let mut c = Class::new(id, name);
    c.special = SpecialClass::MethodClass;
    c.has_vtable = true;
    c.is_initialized = true;
    c.gc_info.content_size = CLOSURE_CONTENT_SIZE;
    c.gc_info.size_for_use = WORD_SIZE;
    c.gc_info.gc_map = vec![CLOSURE_ENV_OFFSET];
    let id = md.register_class(c)?;

    let invoke = native_method(md, id, "invoke", &[], invoke_ret, false);
    attach_methods(md, id, &[invoke]);
    Ok(id)
}

fn register_console(md: &mut Metadata) -> Result<(), CompileError> {
    let id = md.next_class_id();
    let mut c = Class::new(id, "Console");
    c.is_static = true;
    c.is_initialized = true;
    let id = md.register_class(c)?;

    let methods = [
        ("printInt", TypeRef::int()),
        ("printFloat", TypeRef::float()),
        ("printBool", TypeRef::bool_()),
        ("printChar", TypeRef::char_()),
        ("printString", TypeRef::object("string")),
    ];
    for (name, ty) in methods {
        let m = native_method(md, id, name, &[("value", ty)], TypeRef::void(), true);
        md.class_mut(id).static_methods.push(m);
        md.class_mut(id)
            .name_set
            .insert(name.to_string(), skizo_metadata::MemberRef::Method(m));
    }

    let read_line = native_method(md, id, "readLine", &[], TypeRef::object("string"), true);
    md.class_mut(id).static_methods.push(read_line);
    md.class_mut(id)
        .name_set
        .insert("readLine".to_string(), skizo_metadata::MemberRef::Method(read_line));
    Ok(())
}

/// Operator methods on primitives map straight to C operators in emitted
/// code; they exist in metadata so call resolution stays uniform.
fn add_primitive_operators(md: &mut Metadata) -> Result<(), CompileError> {
    let int_ty = TypeRef::int();
    let float_ty = TypeRef::float();
    let bool_ty = TypeRef::bool_();
    let char_ty = TypeRef::char_();
    let intptr_ty = TypeRef::intptr();
    let string_ty = TypeRef::object("string");

    let int_id = md.class_by_flat_name("int").ok_or_else(|| {
        CompileError::Verify("primitive classes must be registered first".into())
    })?;
    let float_id = md.class_by_flat_name("float").unwrap_or(int_id);
    let bool_id = md.class_by_flat_name("bool").unwrap_or(int_id);
    let char_id = md.class_by_flat_name("char").unwrap_or(int_id);
    let intptr_id = md.class_by_flat_name("intptr").unwrap_or(int_id);

    for op in ["+", "-", "*", "/", "%"] {
        let m = native_method(md, int_id, op, &[("other", int_ty.clone())], int_ty.clone(), false);
        attach_methods(md, int_id, &[m]);
    }
    for op in ["<", ">", "=="] {
        let m = native_method(md, int_id, op, &[("other", int_ty.clone())], bool_ty.clone(), false);
        attach_methods(md, int_id, &[m]);
    }
    let m = native_method(md, int_id, "toString", &[], string_ty.clone(), false);
    attach_methods(md, int_id, &[m]);

    for op in ["+", "-", "*", "/"] {
        let m = native_method(
            md,
            float_id,
            op,
            &[("other", float_ty.clone())],
            float_ty.clone(),
            false,
        );
        attach_methods(md, float_id, &[m]);
    }
    for op in ["<", ">", "=="] {
        let m = native_method(
            md,
            float_id,
            op,
            &[("other", float_ty.clone())],
            bool_ty.clone(),
            false,
        );
        attach_methods(md, float_id, &[m]);
    }
    let m = native_method(md, float_id, "toString", &[], string_ty.clone(), false);
    attach_methods(md, float_id, &[m]);

    for op in ["==", "and", "or"] {
        let m = native_method(
            md,
            bool_id,
            op,
            &[("other", bool_ty.clone())],
            bool_ty.clone(),
            false,
        );
        attach_methods(md, bool_id, &[m]);
    }
    let m = native_method(md, bool_id, "not", &[], bool_ty.clone(), false);
    attach_methods(md, bool_id, &[m]);
    let m = native_method(md, bool_id, "toString", &[], string_ty.clone(), false);
    attach_methods(md, bool_id, &[m]);

    for op in ["==", "<", ">"] {
        let m = native_method(
            md,
            char_id,
            op,
            &[("other", char_ty.clone())],
            bool_ty.clone(),
            false,
        );
        attach_methods(md, char_id, &[m]);
    }
    let m = native_method(md, char_id, "toString", &[], string_ty, false);
    attach_methods(md, char_id, &[m]);

    let m = native_method(
        md,
        intptr_id,
        "==",
        &[("other", intptr_ty)],
        bool_ty,
        false,
    );
    attach_methods(md, intptr_id, &[m]);

    Ok(())
}

// ---------------------------------------------------------------------------
// Small construction helpers shared with the builder.
// ---------------------------------------------------------------------------

pub(crate) fn native_method(
    md: &mut Metadata,
    class: ClassId,
    name: &str,
    params: &[(&str, TypeRef)],
    ret: TypeRef,
    is_static: bool,
) -> MethodId {
    let id = md.next_method_id();
    let mut m = Method::new(id, class, MethodKind::Normal, name.to_string());
    m.special = SpecialMethod::Native;
    m.is_compiler_generated = true;
    m.sig = Signature {
        params: params
            .iter()
            .map(|(n, t)| Param {
                name: n.to_string(),
                ty: t.clone(),
                is_captured: false,
            })
            .collect(),
        ret,
        is_static,
    };
    md.add_method(m)
}

pub(crate) fn native_ctor(
    md: &mut Metadata,
    class: ClassId,
    name: &str,
    params: &[(&str, TypeRef)],
) -> MethodId {
    let id = md.next_method_id();
    let mut m = Method::new(id, class, MethodKind::Ctor, name.to_string());
    m.special = SpecialMethod::Native;
    m.is_compiler_generated = true;
    m.sig = Signature {
        params: params
            .iter()
            .map(|(n, t)| Param {
                name: n.to_string(),
                ty: t.clone(),
                is_captured: false,
            })
            .collect(),
        ret: TypeRef::void(),
        is_static: true,
    };
    md.add_method(m)
}

pub(crate) fn attach_methods(md: &mut Metadata, class: ClassId, methods: &[MethodId]) {
    for &m in methods {
        let name = md.method(m).name.clone();
        md.class_mut(class).instance_methods.push(m);
        md.class_mut(class)
            .name_set
            .insert(name, skizo_metadata::MemberRef::Method(m));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register() {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();

        for name in ["any", "int", "float", "bool", "char", "intptr", "string", "Error", "Range", "Predicate", "Action", "Console"] {
            assert!(md.class_by_flat_name(name).is_some(), "missing {}", name);
        }

        let int_id = md.class_by_flat_name("int").unwrap();
        let int_class = md.class(int_id);
        assert!(int_class.is_value_type);
        assert_eq!(int_class.gc_info.content_size, 4);
        assert!(int_class.member("+").is_some());
        assert!(int_class.member("toString").is_some());

        let pred = md.class(md.class_by_flat_name("Predicate").unwrap());
        assert_eq!(pred.special, SpecialClass::MethodClass);
        assert_eq!(pred.gc_info.gc_map, vec![CLOSURE_ENV_OFFSET]);
    }

    #[test]
    fn test_error_has_message_in_gc_map() {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let err = md.class(md.class_by_flat_name("Error").unwrap());
        assert_eq!(err.gc_info.gc_map, vec![OBJECT_HEADER_SIZE]);
    }
}
