//! The type resolver. Takes unresolved typerefs produced by the parser and
//! populates them with backing classes, generating array/failable/boxed/
//! foreign wrapper classes on demand (cached per designator).

use crate::builtins::{native_ctor, native_method};
use crate::{mangle, CompileError};
use skizo_ast::Access;
use skizo_diagnostics::closest_match;
use skizo_metadata::{
    Class, ClassId, Field, MemberRef, Metadata, Method, MethodKind, PrimType, SpecialClass,
    SpecialMethod, TypeRef, TypeRefKind, ARRAY_FIRST_ITEM_OFFSET, OBJECT_HEADER_SIZE, WORD_SIZE,
};

/// Resolves a typeref in place, returning the backing class.
pub fn resolve_typeref(md: &mut Metadata, ty: &mut TypeRef) -> Result<ClassId, CompileError> {
    if let Some(id) = ty.resolved {
        return Ok(id);
    }

    // Composite typerefs resolve their inner element/referent first, then
    // generate the wrapper class on demand.
    if ty.is_composite() {
        let mut inner = ty
            .inner()
            .ok_or_else(|| CompileError::UnresolvedType(ty.to_string(), String::new()))?;
        resolve_typeref(md, &mut inner)?;

        let id = if ty.kind == TypeRefKind::Failable {
            get_or_create_failable(md, &inner)?
        } else if ty.kind == TypeRefKind::Foreign {
            get_or_create_foreign(md, &inner)?
        } else {
            get_or_create_array(md, &inner)?
        };
        ty.resolved = Some(id);
        return Ok(id);
    }

    let name = match ty.prim {
        PrimType::Void => {
            return Err(CompileError::UnresolvedType(
                "void".to_string(),
                " (void cannot back a value)".to_string(),
            ))
        }
        PrimType::Int => "int",
        PrimType::Float => "float",
        PrimType::Bool => "bool",
        PrimType::Char => "char",
        PrimType::IntPtr => "intptr",
        PrimType::Object => ty.class_name.as_deref().unwrap_or(""),
    };

    match md.class_by_flat_name(name) {
        Some(id) => {
            ty.resolved = Some(id);
            Ok(id)
        }
        None => {
            let help = match closest_match(name, md.flat_names()) {
                Some(candidate) => format!(" (did you mean '{}'?)", candidate),
                None => String::new(),
            };
            Err(CompileError::UnresolvedType(name.to_string(), help))
        }
    }
}

/// Walks alias redirections down to the real class. Aliases compare equal
/// to their target for assignment but stay distinguishable for reflection.
pub fn unalias(md: &Metadata, mut id: ClassId) -> ClassId {
    loop {
        let class = md.class(id);
        if class.special != SpecialClass::Alias {
            return id;
        }
        match class.wrapped.as_ref().and_then(|t| t.resolved) {
            Some(next) if next != id => id = next,
            _ => return id,
        }
    }
}

/// Resolves every typeref held in metadata: bases, wrapped types, field
/// types, signatures and const types. Newly generated wrapper classes are
/// picked up by the loop until the registry stops growing.
pub fn resolve_all(md: &mut Metadata) -> Result<(), CompileError> {
    let mut index = 0;
    while index < md.class_count() {
        let class_id = ClassId(index as u32);
        index += 1;

        if let Some(mut base) = md.class(class_id).base.clone() {
            if base.resolved.is_none() {
                resolve_typeref(md, &mut base)?;
                md.class_mut(class_id).base = Some(base);
            }
        }
        if let Some(mut wrapped) = md.class(class_id).wrapped.clone() {
            if wrapped.resolved.is_none() {
                resolve_typeref(md, &mut wrapped)?;
                md.class_mut(class_id).wrapped = Some(wrapped);
            }
        }

        let field_ids: Vec<_> = {
            let class = md.class(class_id);
            class
                .instance_fields
                .iter()
                .chain(class.static_fields.iter())
                .copied()
                .collect()
        };
        for fid in field_ids {
            let mut ty = md.field(fid).ty.clone();
            if ty.resolved.is_none() {
                resolve_typeref(md, &mut ty)?;
                md.field_mut(fid).ty = ty;
            }
        }

        let method_ids: Vec<_> = {
            let class = md.class(class_id);
            class
                .instance_methods
                .iter()
                .chain(class.static_methods.iter())
                .chain(class.instance_ctors.iter())
                .chain(class.static_ctor.iter())
                .chain(class.instance_dtor.iter())
                .chain(class.static_dtor.iter())
                .copied()
                .collect()
        };
        for mid in method_ids {
            resolve_signature(md, mid)?;
        }

        let const_ids = md.class(class_id).consts.clone();
        for cid in const_ids {
            let mut ty = md.const_(cid).ty.clone();
            if ty.resolved.is_none() {
                resolve_typeref(md, &mut ty)?;
                md.const_mut(cid).ty = ty;
            }
        }
    }
    Ok(())
}

pub fn resolve_signature(md: &mut Metadata, mid: skizo_ast::MethodId) -> Result<(), CompileError> {
    let param_count = md.method(mid).sig.params.len();
    for i in 0..param_count {
        let mut ty = md.method(mid).sig.params[i].ty.clone();
        if ty.resolved.is_none() {
            resolve_typeref(md, &mut ty)?;
            md.method_mut(mid).sig.params[i].ty = ty;
        }
    }
    let mut ret = md.method(mid).sig.ret.clone();
    if !ret.is_void() && ret.resolved.is_none() {
        resolve_typeref(md, &mut ret)?;
        md.method_mut(mid).sig.ret = ret;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wrapper generation
// ---------------------------------------------------------------------------

/// `[T]`: reference class with a dynamic length; per-element GC treatment
/// comes from the wrapped class, so the class-level GC map stays empty.
pub fn get_or_create_array(md: &mut Metadata, element: &TypeRef) -> Result<ClassId, CompileError> {
    let key = element.clone().array_of();
    if let Some(&id) = md.array_cache.get(&key) {
        return Ok(id);
    }

    let elem_flat = mangle::flat_name_for(md, element);
    let flat = mangle::array_flat_name(&elem_flat);
    let id = md.next_class_id();
    let mut class = Class::new(id, flat);
    class.nice_name = format!("[{}]", element);
    class.special = SpecialClass::Array;
    class.is_compiler_generated = true;
    class.is_initialized = true;
    class.has_vtable = true;
    class.base = resolved_base(md, "any");
    class.wrapped = Some(element.clone());
    class.gc_info.content_size = ARRAY_FIRST_ITEM_OFFSET;
    class.gc_info.size_for_use = WORD_SIZE;
    let id = md.register_class(class)?;

    // The length slot lives in the shared array header; it reads through
    // a method so dispatch stays uniform.
    let length = native_method(md, id, "length", &[], TypeRef::int(), false);
    crate::builtins::attach_methods(md, id, &[length]);

    let get = native_method(md, id, "get", &[("index", TypeRef::int())], element.clone(), false);
    let set = native_method(
        md,
        id,
        "set",
        &[("index", TypeRef::int()), ("value", element.clone())],
        TypeRef::void(),
        false,
    );
    crate::builtins::attach_methods(md, id, &[get, set]);

    let mut self_ty = key.clone();
    self_ty.resolved = Some(id);
    let create = native_method(
        md,
        id,
        "createByLength",
        &[("length", TypeRef::int())],
        self_ty,
        true,
    );
    md.class_mut(id).static_methods.push(create);
    md.class_mut(id)
        .name_set
        .insert("createByLength".to_string(), MemberRef::Method(create));

    md.array_cache.insert(key, id);
    Ok(id)
}

/// `T?`: a value-type struct with a value slot, an error slot and a
/// discriminator. Construction from `T` or `Error` is an implicit cast
/// inserted by the transformer.
pub fn get_or_create_failable(
    md: &mut Metadata,
    inner: &TypeRef,
) -> Result<ClassId, CompileError> {
    let key = inner.clone().failable_of();
    if let Some(&id) = md.failable_cache.get(&key) {
        return Ok(id);
    }

    let inner_flat = mangle::flat_name_for(md, inner);
    let flat = mangle::failable_flat_name(&inner_flat);

    let value_size = size_for_use_of(md, inner);
    let value_slot = value_size.max(1).next_multiple_of(WORD_SIZE);
    let error_offset = value_slot;
    let disc_offset = error_offset + WORD_SIZE;
    let content_size = disc_offset + WORD_SIZE;

    let id = md.next_class_id();
    let mut class = Class::new(id, flat);
    class.nice_name = format!("{}?", inner);
    class.special = SpecialClass::Failable;
    class.is_compiler_generated = true;
    class.is_initialized = true;
    class.is_value_type = true;
    class.wrapped = Some(inner.clone());
    class.gc_info.content_size = content_size;
    class.gc_info.size_for_use = content_size;
    class.gc_info.gc_map = failable_gc_map(md, inner, error_offset);
    let id = md.register_class(class)?;

    let fields = [
        ("m_value", inner.clone(), 0),
        ("m_error", TypeRef::object("Error"), error_offset),
        ("m_hasError", TypeRef::bool_(), disc_offset),
    ];
    for (name, ty, offset) in fields {
        let fid = md.next_field_id();
        md.add_field(Field {
            id: fid,
            declaring_class: id,
            access: Access::Private,
            is_static: false,
            name: name.to_string(),
            ty,
            offset,
            attrs: Vec::new(),
        });
        md.class_mut(id).instance_fields.push(fid);
        md.class_mut(id)
            .name_set
            .insert(name.to_string(), MemberRef::Field(fid));
    }

    let from_value = native_ctor(md, id, "fromValue", &[("value", inner.clone())]);
    let from_error = native_ctor(md, id, "fromError", &[("error", TypeRef::object("Error"))]);
    for (name, ctor) in [("fromValue", from_value), ("fromError", from_error)] {
        md.class_mut(id).instance_ctors.push(ctor);
        md.class_mut(id)
            .name_set
            .insert(name.to_string(), MemberRef::Method(ctor));
    }

    // `value` aborts with the contained error when the failable holds one.
    let value = native_method(md, id, "value", &[], inner.clone(), false);
    let error = native_method(md, id, "error", &[], TypeRef::object("Error"), false);
    let has_error = native_method(md, id, "hasError", &[], TypeRef::bool_(), false);
    crate::builtins::attach_methods(md, id, &[value, error, has_error]);

    md.failable_cache.insert(key, id);
    Ok(id)
}

fn failable_gc_map(md: &Metadata, inner: &TypeRef, error_offset: u32) -> Vec<u32> {
    let mut map = Vec::new();
    if is_reference_typeref(md, inner) {
        map.push(0);
    } else if let Some(inner_id) = inner.resolved {
        for &off in &md.class(inner_id).gc_info.gc_map {
            map.push(off);
        }
    }
    map.push(error_offset);
    map
}

/// Boxed wrapper around a value-type, so it can flow through interface
/// slots. Forwarding methods are boxed-method specials: the thunk manager
/// emits their machine code, not the C backend.
pub fn get_or_create_boxed(md: &mut Metadata, inner: &TypeRef) -> Result<ClassId, CompileError> {
    if let Some(&id) = md.boxed_cache.get(inner) {
        return Ok(id);
    }
    let inner_id = inner
        .resolved
        .ok_or_else(|| CompileError::UnresolvedType(inner.to_string(), String::new()))?;
    let inner_class = md.class(inner_id);
    if !inner_class.is_value_type {
        return Err(CompileError::Verify(format!(
            "Cannot box reference type '{}'",
            inner_class.nice_name
        )));
    }
    let inner_flat = inner_class.flat_name.clone();
    let inner_nice = inner_class.nice_name.clone();
    let inner_content = inner_class.gc_info.content_size;
    let inner_map = inner_class.gc_info.gc_map.clone();
    let wrapped_methods = inner_class.instance_methods.clone();

    let id = md.next_class_id();
    let mut class = Class::new(id, mangle::boxed_flat_name(&inner_flat));
    // A boxed wrapper keeps the nice name of the value-type it wraps.
    class.nice_name = inner_nice;
    class.special = SpecialClass::Boxed;
    class.is_compiler_generated = true;
    class.is_initialized = true;
    class.has_vtable = true;
    class.base = resolved_base(md, "any");
    class.wrapped = Some(inner.clone());
    class.gc_info.content_size = OBJECT_HEADER_SIZE + inner_content;
    class.gc_info.size_for_use = WORD_SIZE;
    class.gc_info.gc_map = inner_map.iter().map(|o| o + OBJECT_HEADER_SIZE).collect();
    let id = md.register_class(class)?;

    let fid = md.next_field_id();
    md.add_field(Field {
        id: fid,
        declaring_class: id,
        access: Access::Private,
        is_static: false,
        name: "m_value".to_string(),
        ty: inner.clone(),
        offset: OBJECT_HEADER_SIZE,
        attrs: Vec::new(),
    });
    md.class_mut(id).instance_fields.push(fid);
    md.class_mut(id)
        .name_set
        .insert("m_value".to_string(), MemberRef::Field(fid));

    let ctor = native_ctor(md, id, "create", &[("value", inner.clone())]);
    md.method_mut(ctor).special = SpecialMethod::BoxedCtor;
    md.class_mut(id).instance_ctors.push(ctor);
    md.class_mut(id)
        .name_set
        .insert("create".to_string(), MemberRef::Method(ctor));

    for wrapped_mid in wrapped_methods {
        let src = md.method(wrapped_mid).clone();
        let fwd_id = md.next_method_id();
        let mut fwd = Method::new(fwd_id, id, MethodKind::Normal, src.name.clone());
        fwd.special = SpecialMethod::BoxedMethod;
        fwd.is_compiler_generated = true;
        fwd.sig = src.sig.clone();
        fwd.base_method = Some(wrapped_mid);
        let fwd_id = md.add_method(fwd);
        md.class_mut(id).instance_methods.push(fwd_id);
        md.class_mut(id)
            .name_set
            .insert(src.name, MemberRef::Method(fwd_id));
    }

    md.boxed_cache.insert(inner.clone(), id);
    Ok(id)
}

/// `T*`: a proxy whose methods are remote-call client stubs. A hidden
/// domain handle and the exported name identify the remote object.
pub fn get_or_create_foreign(md: &mut Metadata, inner: &TypeRef) -> Result<ClassId, CompileError> {
    let key = inner.clone().foreign_of();
    if let Some(&id) = md.foreign_cache.get(&key) {
        return Ok(id);
    }
    let inner_id = inner
        .resolved
        .ok_or_else(|| CompileError::UnresolvedType(inner.to_string(), String::new()))?;
    let inner_flat = md.class(inner_id).flat_name.clone();
    let wrapped_methods = md.class(inner_id).instance_methods.clone();

    let id = md.next_class_id();
    let mut class = Class::new(id, mangle::foreign_flat_name(&inner_flat));
    class.nice_name = format!("{}*", md.class(inner_id).nice_name);
    class.special = SpecialClass::Foreign;
    class.is_compiler_generated = true;
    class.is_initialized = true;
    class.has_vtable = true;
    class.base = resolved_base(md, "any");
    class.wrapped = Some(inner.clone());
    class.gc_info.content_size = OBJECT_HEADER_SIZE + 2 * WORD_SIZE;
    class.gc_info.size_for_use = WORD_SIZE;
    // m_name is the only GC-managed slot; the domain handle is opaque.
    class.gc_info.gc_map = vec![OBJECT_HEADER_SIZE + WORD_SIZE];
    let id = md.register_class(class)?;

    let fields = [
        ("m_hDomain", TypeRef::intptr(), OBJECT_HEADER_SIZE),
        (
            "m_name",
            TypeRef::object("string"),
            OBJECT_HEADER_SIZE + WORD_SIZE,
        ),
    ];
    for (name, ty, offset) in fields {
        let fid = md.next_field_id();
        md.add_field(Field {
            id: fid,
            declaring_class: id,
            access: Access::Private,
            is_static: false,
            name: name.to_string(),
            ty,
            offset,
            attrs: Vec::new(),
        });
        md.class_mut(id).instance_fields.push(fid);
        md.class_mut(id)
            .name_set
            .insert(name.to_string(), MemberRef::Field(fid));
    }

    for wrapped_mid in wrapped_methods {
        let src = md.method(wrapped_mid).clone();
        let stub_id = md.next_method_id();
        let mut stub = Method::new(stub_id, id, MethodKind::Normal, src.name.clone());
        stub.special = SpecialMethod::ForeignSync;
        stub.is_compiler_generated = true;
        stub.sig = src.sig.clone();
        stub.base_method = Some(wrapped_mid);
        let stub_id = md.add_method(stub);
        md.class_mut(id).instance_methods.push(stub_id);
        md.class_mut(id)
            .name_set
            .insert(src.name, MemberRef::Method(stub_id));
    }

    md.foreign_cache.insert(key, id);
    Ok(id)
}

// ---------------------------------------------------------------------------

fn resolved_base(md: &Metadata, name: &str) -> Option<TypeRef> {
    let mut base = TypeRef::object(name);
    base.resolved = md.class_by_flat_name(name);
    Some(base)
}

pub fn is_reference_typeref(md: &Metadata, ty: &TypeRef) -> bool {
    if ty.array_level > 0 || ty.kind == TypeRefKind::Foreign {
        return true;
    }
    if ty.kind == TypeRefKind::Failable {
        return false;
    }
    match ty.prim {
        PrimType::Object => match ty.resolved {
            Some(id) => md.class(id).is_reference_type(),
            None => true,
        },
        _ => false,
    }
}

pub fn size_for_use_of(md: &Metadata, ty: &TypeRef) -> u32 {
    if is_reference_typeref(md, ty) {
        return WORD_SIZE;
    }
    match ty.prim {
        PrimType::Object => match ty.resolved {
            Some(id) => md.class(id).gc_info.size_for_use,
            None => WORD_SIZE,
        },
        prim => skizo_metadata::prim_size(prim),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::register_builtins;

    fn fresh() -> Metadata {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        md
    }

    #[test]
    fn test_resolve_primitive() {
        let mut md = fresh();
        let mut ty = TypeRef::int();
        let id = resolve_typeref(&mut md, &mut ty).unwrap();
        assert_eq!(md.class(id).flat_name, "int");
        assert_eq!(ty.resolved, Some(id));
    }

    #[test]
    fn test_unknown_class_suggestion() {
        let mut md = fresh();
        let mut ty = TypeRef::object("Predicat");
        let err = resolve_typeref(&mut md, &mut ty).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Predicate"), "no suggestion in: {}", message);
    }

    #[test]
    fn test_array_generated_once() {
        let mut md = fresh();
        let mut a = TypeRef::int().array_of();
        let mut b = TypeRef::int().array_of();
        let id_a = resolve_typeref(&mut md, &mut a).unwrap();
        let id_b = resolve_typeref(&mut md, &mut b).unwrap();
        assert_eq!(id_a, id_b);

        let class = md.class(id_a);
        assert_eq!(class.flat_name, "0Array_int");
        assert_eq!(class.special, SpecialClass::Array);
        assert!(class.member("length").is_some());
        assert!(class.member("get").is_some());
        assert!(class.member("set").is_some());
        assert!(class.member("createByLength").is_some());
    }

    #[test]
    fn test_nested_array() {
        let mut md = fresh();
        let mut ty = TypeRef::int().array_of().array_of();
        let id = resolve_typeref(&mut md, &mut ty).unwrap();
        assert_eq!(md.class(id).flat_name, "0Array_0Array_int");
        // The inner array class was generated too.
        assert!(md.class_by_flat_name("0Array_int").is_some());
    }

    #[test]
    fn test_failable_layout() {
        let mut md = fresh();
        let mut ty = TypeRef::int().failable_of();
        let id = resolve_typeref(&mut md, &mut ty).unwrap();
        let class = md.class(id);
        assert_eq!(class.flat_name, "0Failable_int");
        assert!(class.is_value_type);
        // value(4) + error(4) + discriminator(4)
        assert_eq!(class.gc_info.content_size, 12);
        // Only the error slot is a reference.
        assert_eq!(class.gc_info.gc_map, vec![4]);
    }

    #[test]
    fn test_failable_of_reference() {
        let mut md = fresh();
        let mut ty = TypeRef::object("string").failable_of();
        let id = resolve_typeref(&mut md, &mut ty).unwrap();
        let class = md.class(id);
        // Both the value and the error slots hold references.
        assert_eq!(class.gc_info.gc_map, vec![0, 4]);
    }

    #[test]
    fn test_boxed_wrapper() {
        let mut md = fresh();
        let mut inner = TypeRef::object("Range");
        resolve_typeref(&mut md, &mut inner).unwrap();
        let id = get_or_create_boxed(&mut md, &inner).unwrap();
        let class = md.class(id);
        assert_eq!(class.flat_name, "0Boxed_Range");
        assert_eq!(class.nice_name, "Range");
        assert_eq!(class.special, SpecialClass::Boxed);
        // header + 8 bytes of Range
        assert_eq!(class.gc_info.content_size, 12);
    }

    #[test]
    fn test_boxing_reference_type_fails() {
        let mut md = fresh();
        let mut inner = TypeRef::object("string");
        resolve_typeref(&mut md, &mut inner).unwrap();
        assert!(get_or_create_boxed(&mut md, &inner).is_err());
    }

    #[test]
    fn test_foreign_proxy_methods() {
        let mut md = fresh();
        // Error has an instance method `message`.
        let mut ty = TypeRef::object("Error").foreign_of();
        let id = resolve_typeref(&mut md, &mut ty).unwrap();
        let class = md.class(id);
        assert_eq!(class.special, SpecialClass::Foreign);
        let stub = match class.member("message") {
            Some(MemberRef::Method(m)) => m,
            other => panic!("expected method, got {:?}", other),
        };
        assert_eq!(md.method(stub).special, SpecialMethod::ForeignSync);
    }

    #[test]
    fn test_unalias() {
        let mut md = fresh();
        let id = md.next_class_id();
        let mut alias = Class::new(id, "Money");
        alias.special = SpecialClass::Alias;
        let mut target = TypeRef::int();
        target.resolved = md.class_by_flat_name("int");
        alias.wrapped = Some(target);
        let id = md.register_class(alias).unwrap();

        assert_eq!(unalias(&md, id), md.class_by_flat_name("int").unwrap());
    }
}
