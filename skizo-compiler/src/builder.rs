//! Lowers parsed units into domain metadata. After this pass every
//! declared class, member and body AST lives in the registry; inheritance
//! lists, vtables, offsets and GC maps are still unassigned (transformer).

use crate::builtins::{native_ctor, native_method};
use crate::{mangle, CompileError};
use skizo_ast::{
    Access, ClassDecl, ClassDeclKind, ConstValue, MethodDeclKind, Unit,
};
use skizo_metadata::{
    Attribute, Class, ClassId, Const, Field, MemberRef, Metadata, MetadataError, Method,
    MethodId, MethodKind, Param, Signature, SpecialClass, SpecialMethod, TypeRef,
};

pub fn build_units(md: &mut Metadata, units: &[Unit]) -> Result<(), CompileError> {
    // Register every non-extension class first so members can refer to any
    // declared type regardless of order.
    for unit in units {
        for decl in &unit.decls {
            if decl.kind != ClassDeclKind::Extension {
                register_class_shell(md, unit, decl)?;
            }
        }
    }

    for unit in units {
        for decl in &unit.decls {
            let target = match decl.kind {
                ClassDeclKind::Extension => {
                    let id = md.class_by_flat_name(&decl.name).ok_or_else(|| {
                        MetadataError::UnknownClass(decl.name.clone())
                    })?;
                    md.extensions.push(id);
                    id
                }
                ClassDeclKind::Alias => continue,
                _ => md
                    .class_by_flat_name(&decl.name)
                    .ok_or_else(|| MetadataError::UnknownClass(decl.name.clone()))?,
            };
            build_members(md, unit, decl, target, decl.kind == ClassDeclKind::Extension)?;
        }
    }

    Ok(())
}

fn register_class_shell(
    md: &mut Metadata,
    unit: &Unit,
    decl: &ClassDecl,
) -> Result<ClassId, CompileError> {
    let id = md.next_class_id();
    let mut class = Class::new(id, decl.name.clone());
    class.module = unit.module.clone();
    class.line = decl.line;
    class.is_static = decl.is_static;
    class.is_abstract = decl.is_abstract;
    class.attrs = decl
        .attrs
        .iter()
        .map(|a| Attribute {
            name: a.name.clone(),
            value: a.value.clone(),
        })
        .collect();

    match decl.kind {
        ClassDeclKind::Class => {
            class.base = Some(
                decl.base
                    .clone()
                    .unwrap_or_else(|| TypeRef::object("any")),
            );
            class.has_vtable = true;
        }
        ClassDeclKind::Struct => {
            class.is_value_type = true;
            class.base = decl.base.clone();
        }
        ClassDeclKind::Interface => {
            class.special = SpecialClass::Interface;
            class.is_abstract = true;
            class.has_vtable = true;
            class.base = decl.base.clone();
        }
        ClassDeclKind::Enum => {
            class.has_vtable = true;
            class.base = Some(TypeRef::object("any"));
            class.enum_items = decl.enum_items.clone();
            class.is_compiler_generated = false;
        }
        ClassDeclKind::Alias => {
            class.special = SpecialClass::Alias;
            class.wrapped = decl.base.clone();
        }
        ClassDeclKind::Extension => unreachable!("extensions are not shells"),
    }

    // [nativeSize=N] makes the class an opaque binary blob.
    if let Some(value) = class.attr("nativeSize") {
        let size: u32 = value.parse().map_err(|_| {
            CompileError::transform(&unit.module, decl.line, "Invalid nativeSize value")
        })?;
        class.special = SpecialClass::BinaryBlob;
        class.is_value_type = true;
        class.has_vtable = false;
        class.native_size = Some(size);
        class.gc_info.content_size = size;
        class.gc_info.size_for_use = size;
    }
    if class.attr("ptrWrapper").is_some() {
        class.is_ptr_wrapper = true;
    }

    let id = md.register_class(class)?;
    if decl.kind == ClassDeclKind::Alias {
        md.alias_classes.push(id);
    }
    Ok(id)
}

fn build_members(
    md: &mut Metadata,
    unit: &Unit,
    decl: &ClassDecl,
    class_id: ClassId,
    from_extension: bool,
) -> Result<(), CompileError> {
    let class_name = md.class(class_id).flat_name.clone();

    for field in &decl.fields {
        check_unique(md, class_id, &class_name, &field.name)?;
        let id = md.next_field_id();
        md.add_field(Field {
            id,
            declaring_class: class_id,
            access: field.access,
            is_static: field.is_static,
            name: field.name.clone(),
            ty: field.ty.clone(),
            offset: 0,
            attrs: field
                .attrs
                .iter()
                .map(|a| Attribute {
                    name: a.name.clone(),
                    value: a.value.clone(),
                })
                .collect(),
        });
        let class = md.class_mut(class_id);
        if field.is_static {
            class.static_fields.push(id);
        } else {
            class.instance_fields.push(id);
        }
        class.name_set.insert(field.name.clone(), MemberRef::Field(id));
    }

    for konst in &decl.consts {
        check_unique(md, class_id, &class_name, &konst.name)?;
        let id = md.next_const_id();
        md.add_const(Const {
            id,
            declaring_class: class_id,
            access: konst.access,
            name: konst.name.clone(),
            ty: konst.ty.clone(),
            value: konst.value.clone(),
        });
        let class = md.class_mut(class_id);
        class.consts.push(id);
        class.name_set.insert(konst.name.clone(), MemberRef::Const(id));
    }

    for event in &decl.events {
        build_event(md, unit, class_id, &class_name, event)?;
    }

    for m in &decl.methods {
        build_method(md, unit, class_id, &class_name, m, from_extension)?;
    }

    if decl.kind == ClassDeclKind::Enum {
        build_enum_members(md, class_id)?;
    }

    // Default ctor: reference classes without any declared ctor get a
    // zero-initialising `create`.
    if decl.kind == ClassDeclKind::Class
        && !decl.is_static
        && !decl.is_abstract
        && md.class(class_id).instance_ctors.is_empty()
    {
        let ctor_id = md.next_method_id();
        let mut ctor = Method::new(ctor_id, class_id, MethodKind::Ctor, "create".to_string());
        ctor.is_compiler_generated = true;
        ctor.sig.is_static = true;
        ctor.body = Some(skizo_ast::Body::new());
        let ctor_id = md.add_method(ctor);
        let class = md.class_mut(class_id);
        class.instance_ctors.push(ctor_id);
        class
            .name_set
            .insert("create".to_string(), MemberRef::Method(ctor_id));
    }

    Ok(())
}

fn build_method(
    md: &mut Metadata,
    unit: &Unit,
    class_id: ClassId,
    class_name: &str,
    decl: &skizo_ast::MethodDecl,
    from_extension: bool,
) -> Result<MethodId, CompileError> {
    let kind = match decl.kind {
        MethodDeclKind::Normal => MethodKind::Normal,
        MethodDeclKind::Ctor => MethodKind::Ctor,
        MethodDeclKind::Dtor => MethodKind::Dtor,
    };

    if kind == MethodKind::Normal {
        check_unique(md, class_id, class_name, &decl.name)?;
    }

    let id = md.next_method_id();
    let mut method = Method::new(id, class_id, kind, decl.name.clone());
    method.access = decl.access;
    method.is_abstract = decl.is_abstract;
    method.is_unsafe = decl.is_unsafe;
    if decl.is_native {
        method.special = SpecialMethod::Native;
    }
    if from_extension {
        method.declaring_ext_class = Some(class_id);
    }
    method.sig = Signature {
        params: decl
            .params
            .iter()
            .map(|p| Param {
                name: p.name.clone(),
                ty: p.ty.clone(),
                is_captured: false,
            })
            .collect(),
        ret: decl.ret.clone(),
        // Ctors are invoked without an instance.
        is_static: decl.is_static || kind == MethodKind::Ctor,
    };
    method.attrs = decl
        .attrs
        .iter()
        .map(|a| Attribute {
            name: a.name.clone(),
            value: a.value.clone(),
        })
        .collect();
    method.body = decl.body.clone();

    let id = md.add_method(method);
    let class = md.class_mut(class_id);
    match kind {
        MethodKind::Normal => {
            if decl.is_static {
                class.static_methods.push(id);
            } else {
                class.instance_methods.push(id);
            }
            class.name_set.insert(decl.name.clone(), MemberRef::Method(id));
        }
        MethodKind::Ctor => {
            if decl.is_static {
                if class.static_ctor.is_some() {
                    return Err(CompileError::transform(
                        &unit.module,
                        decl.line,
                        format!("Class '{}' already has a static ctor", class_name),
                    ));
                }
                class.static_ctor = Some(id);
            } else {
                class.instance_ctors.push(id);
                class.name_set.insert(decl.name.clone(), MemberRef::Method(id));
            }
        }
        MethodKind::Dtor => {
            if decl.is_static {
                if class.static_dtor.is_some() {
                    return Err(CompileError::transform(
                        &unit.module,
                        decl.line,
                        format!("Class '{}' already has a static dtor", class_name),
                    ));
                }
                class.static_dtor = Some(id);
            } else {
                if class.instance_dtor.is_some() {
                    return Err(CompileError::transform(
                        &unit.module,
                        decl.line,
                        format!("Class '{}' already has a dtor", class_name),
                    ));
                }
                class.instance_dtor = Some(id);
            }
        }
    }
    Ok(id)
}

/// `event changed: Action;` generates a hidden event class holding the
/// handler array plus `fire`/`addHandler` specials, and a field of that
/// class on the owner.
fn build_event(
    md: &mut Metadata,
    unit: &Unit,
    owner: ClassId,
    owner_name: &str,
    event: &skizo_ast::EventDecl,
) -> Result<(), CompileError> {
    check_unique(md, owner, owner_name, &event.name)?;

    let flat = mangle::event_flat_name(owner_name, &event.name);
    let id = md.next_class_id();
    let mut class = Class::new(id, flat.clone());
    class.module = unit.module.clone();
    class.line = event.line;
    class.special = SpecialClass::EventClass;
    class.is_compiler_generated = true;
    class.has_vtable = true;
    class.base = Some(TypeRef::object("any"));
    class.wrapped = Some(event.handler.clone());
    let event_class = md.register_class(class)?;

    // m_handlers: [Handler]
    let handlers_field = md.next_field_id();
    md.add_field(Field {
        id: handlers_field,
        declaring_class: event_class,
        access: Access::Private,
        is_static: false,
        name: "m_handlers".to_string(),
        ty: event.handler.clone().array_of(),
        offset: 0,
        attrs: Vec::new(),
    });
    md.class_mut(event_class).instance_fields.push(handlers_field);
    md.class_mut(event_class)
        .name_set
        .insert("m_handlers".to_string(), MemberRef::Field(handlers_field));

    let fire = native_method(md, event_class, "fire", &[], TypeRef::void(), false);
    md.method_mut(fire).special = SpecialMethod::Fire;
    let add_handler = native_method(
        md,
        event_class,
        "addHandler",
        &[("handler", event.handler.clone())],
        TypeRef::void(),
        false,
    );
    md.method_mut(add_handler).special = SpecialMethod::AddHandler;
    crate::builtins::attach_methods(md, event_class, &[fire, add_handler]);

    let ctor = native_ctor(md, event_class, "create", &[]);
    md.class_mut(event_class).instance_ctors.push(ctor);
    md.class_mut(event_class)
        .name_set
        .insert("create".to_string(), MemberRef::Method(ctor));

    // The owner's event field.
    let field_id = md.next_field_id();
    md.add_field(Field {
        id: field_id,
        declaring_class: owner,
        access: event.access,
        is_static: false,
        name: event.name.clone(),
        ty: TypeRef::object(flat),
        offset: 0,
        attrs: Vec::new(),
    });
    md.class_mut(owner).instance_fields.push(field_id);
    md.class_mut(owner)
        .name_set
        .insert(event.name.clone(), MemberRef::Field(field_id));

    Ok(())
}

/// Enum lowering: `enum Color { Red; Green; Blue }` becomes a reference
/// class with one static singleton field and accessor per item, a
/// value-carrying instance field, `toString`, and a range-checked
/// `fromInt`. The bodies are synthesized by the emitter.
fn build_enum_members(md: &mut Metadata, class_id: ClassId) -> Result<(), CompileError> {
    let items = md.class(class_id).enum_items.clone();
    let self_ty = {
        let mut t = TypeRef::object(md.class(class_id).flat_name.clone());
        t.resolved = Some(class_id);
        t
    };

    // Instance value slot.
    let value_field = md.next_field_id();
    md.add_field(Field {
        id: value_field,
        declaring_class: class_id,
        access: Access::Private,
        is_static: false,
        name: "m_value".to_string(),
        ty: TypeRef::int(),
        offset: 0,
        attrs: Vec::new(),
    });
    md.class_mut(class_id).instance_fields.push(value_field);
    md.class_mut(class_id)
        .name_set
        .insert("m_value".to_string(), MemberRef::Field(value_field));

    for item in &items {
        // Hidden singleton storage...
        let storage_name = format!("s_{}", item);
        let storage = md.next_field_id();
        md.add_field(Field {
            id: storage,
            declaring_class: class_id,
            access: Access::Private,
            is_static: true,
            name: storage_name.clone(),
            ty: self_ty.clone(),
            offset: 0,
            attrs: Vec::new(),
        });
        md.class_mut(class_id).static_fields.push(storage);
        md.class_mut(class_id)
            .name_set
            .insert(storage_name, MemberRef::Field(storage));

        // ...exposed through a static accessor named after the item.
        let accessor = native_method(md, class_id, item, &[], self_ty.clone(), true);
        md.class_mut(class_id).static_methods.push(accessor);
        md.class_mut(class_id)
            .name_set
            .insert(item.clone(), MemberRef::Method(accessor));
    }

    let to_string = native_method(
        md,
        class_id,
        "toString",
        &[],
        TypeRef::object("string"),
        false,
    );
    crate::builtins::attach_methods(md, class_id, &[to_string]);

    let from_int = native_method(
        md,
        class_id,
        "fromInt",
        &[("value", TypeRef::int())],
        self_ty.clone(),
        true,
    );
    md.method_mut(from_int).special = SpecialMethod::EnumFromInt;
    md.class_mut(class_id).static_methods.push(from_int);
    md.class_mut(class_id)
        .name_set
        .insert("fromInt".to_string(), MemberRef::Method(from_int));

    // Internal allocator used by the generated static ctor.
    let ctor = native_ctor(md, class_id, "createItem", &[("value", TypeRef::int())]);
    md.class_mut(class_id).instance_ctors.push(ctor);
    md.class_mut(class_id)
        .name_set
        .insert("createItem".to_string(), MemberRef::Method(ctor));

    Ok(())
}

fn check_unique(
    md: &Metadata,
    class_id: ClassId,
    class_name: &str,
    member: &str,
) -> Result<(), CompileError> {
    if md.class(class_id).name_set.contains_key(member) {
        return Err(CompileError::Metadata(MetadataError::DuplicateMember(
            class_name.to_string(),
            member.to_string(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::register_builtins;
    use skizo_parser::Parser;

    fn build(source: &str) -> Metadata {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let unit = Parser::new("test", source).unwrap().parse_unit().unwrap();
        build_units(&mut md, &[unit]).unwrap();
        md
    }

    #[test]
    fn test_simple_class() {
        let md = build("class A { field x:int; method get:int { return x; } }");
        let a = md.class(md.class_by_flat_name("A").unwrap());
        assert_eq!(a.instance_fields.len(), 1);
        assert_eq!(a.instance_methods.len(), 1);
        // Default ctor was generated.
        assert_eq!(a.instance_ctors.len(), 1);
        assert_eq!(md.method(a.instance_ctors[0]).name, "create");
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut md = Metadata::new();
        register_builtins(&mut md).unwrap();
        let unit = Parser::new("test", "class A { field x:int; field x:int; }")
            .unwrap()
            .parse_unit()
            .unwrap();
        assert!(build_units(&mut md, &[unit]).is_err());
    }

    #[test]
    fn test_enum_lowering() {
        let md = build("enum Color { Red; Green; Blue }");
        let color = md.class(md.class_by_flat_name("Color").unwrap());
        assert_eq!(color.enum_items.len(), 3);
        assert_eq!(color.static_fields.len(), 3);
        // Red accessor + fromInt are static methods.
        assert!(color.member("Red").is_some());
        assert!(color.member("fromInt").is_some());
        assert!(color.member("toString").is_some());
        let from_int = match color.member("fromInt").unwrap() {
            MemberRef::Method(m) => m,
            _ => panic!(),
        };
        assert_eq!(md.method(from_int).special, SpecialMethod::EnumFromInt);
    }

    #[test]
    fn test_event_generates_class() {
        let md = build("class A { event changed: Action; }");
        let ev = md.class_by_flat_name("0Event_A_changed").unwrap();
        let ev_class = md.class(ev);
        assert_eq!(ev_class.special, SpecialClass::EventClass);
        assert!(ev_class.member("fire").is_some());
        assert!(ev_class.member("addHandler").is_some());

        let a = md.class(md.class_by_flat_name("A").unwrap());
        assert!(a.member("changed").is_some());
    }

    #[test]
    fn test_binary_blob() {
        let md = build("[nativeSize=8] struct Pair { }");
        let pair = md.class(md.class_by_flat_name("Pair").unwrap());
        assert_eq!(pair.special, SpecialClass::BinaryBlob);
        assert_eq!(pair.native_size, Some(8));
        assert_eq!(pair.gc_info.content_size, 8);
        assert!(pair.is_value_type);
    }

    #[test]
    fn test_static_ctor_and_dtor() {
        let md = build("class A { static ctor { } static dtor { } dtor { } }");
        let a = md.class(md.class_by_flat_name("A").unwrap());
        assert!(a.static_ctor.is_some());
        assert!(a.static_dtor.is_some());
        assert!(a.instance_dtor.is_some());
    }

    #[test]
    fn test_alias_registration() {
        let md = build("alias Money = int;");
        let alias = md.class(md.class_by_flat_name("Money").unwrap());
        assert_eq!(alias.special, SpecialClass::Alias);
        assert_eq!(alias.wrapped, Some(TypeRef::int()));
    }

    #[test]
    fn test_extension_merges_members() {
        let md = build("class A { } extend A { method extra:int { return 5; } }");
        let a = md.class(md.class_by_flat_name("A").unwrap());
        assert!(a.member("extra").is_some());
    }
}
