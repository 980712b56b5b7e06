//! Generated helper functions: array accessors with range checks,
//! array-init helpers, value-type identity comparison, unbox helpers, and
//! the remoting server stubs.

use super::{is_primitive_class, sanitize_field, Emitter};
use crate::{mangle, CompileError};
use skizo_metadata::{
    ClassId, MethodId, PrimType, SpecialClass, SpecialMethod, TypeRef, TypeRefKind,
    ARRAY_FIRST_ITEM_OFFSET,
};

pub fn emit_generated_helpers(e: &mut Emitter) -> Result<(), CompileError> {
    e.out().emit_line("/* generated helpers */");

    // Array get/set with null and range checks.
    let ids: Vec<ClassId> = e.md().class_ids().collect();
    for &id in &ids {
        let class = e.md().class(id);
        if class.special != SpecialClass::Array {
            continue;
        }
        let Some(element) = class.wrapped.clone() else {
            continue;
        };
        let flat = sanitize_field(&class.flat_name);
        let self_c = e.ctype_of_class(id);
        let elem_c = e.ctype(&element);

        e.out().emit_line(&format!(
            "static {elem} _soX_arrget_{flat}({self_c} a, int i) {{ if(!a) _soX_abort0(2); if(i < 0 || i >= ((_soX_ArrayHeader*)a)->length) _soX_abort0(0); return (({elem}*)((char*)a + {off}))[i]; }}",
            elem = elem_c,
            flat = flat,
            self_c = self_c,
            off = ARRAY_FIRST_ITEM_OFFSET
        ));
        e.out().emit_line(&format!(
            "static void _soX_arrset_{flat}({self_c} a, int i, {elem} v) {{ if(!a) _soX_abort0(2); if(i < 0 || i >= ((_soX_ArrayHeader*)a)->length) _soX_abort0(0); (({elem}*)((char*)a + {off}))[i] = v; }}",
            elem = elem_c,
            flat = flat,
            self_c = self_c,
            off = ARRAY_FIRST_ITEM_OFFSET
        ));
    }
    e.out().blank_line();

    // One helper per array-init site.
    let mut inits: Vec<(u32, (ClassId, usize))> = e
        .array_inits()
        .iter()
        .map(|(&k, &v)| (k, v))
        .collect();
    inits.sort_by_key(|(k, _)| *k);
    for (helper_id, (class_id, count)) in inits {
        let class = e.md().class(class_id);
        let Some(element) = class.wrapped.clone() else {
            continue;
        };
        let self_c = e.ctype_of_class(class_id);
        let elem_c = e.ctype(&element);
        let params: Vec<String> = (0..count).map(|i| format!("{} e{}", elem_c, i)).collect();
        let word = e.class_word(class_id);
        e.out().emit_line(&format!(
            "static {self_c} _soX_arrinit_{id}({params}) {{",
            self_c = self_c,
            id = helper_id,
            params = params.join(", ")
        ));
        e.out().indent();
        e.out().emit_line(&format!(
            "{} l_a = ({})_soX_newarray(_soX_domain, {}, {});",
            self_c, self_c, count, word
        ));
        for i in 0..count {
            e.out().emit_line(&format!(
                "(({}*)((char*)l_a + {}))[{}] = e{};",
                elem_c, ARRAY_FIRST_ITEM_OFFSET, i, i
            ));
        }
        e.out().emit_line("return l_a;");
        e.out().dedent();
        e.out().emit_line("}");
    }
    e.out().blank_line();

    // Bitwise identity comparison for value types.
    for &id in &ids {
        let class = e.md().class(id);
        if !class.is_value_type
            || is_primitive_class(class)
            || class.special == SpecialClass::Alias
        {
            continue;
        }
        let cty = e.ctype_of_class(id);
        e.out().emit_line(&format!(
            "static _so_bool _soX_ideq_{flat}({cty} a, {cty} b) {{ return _soX_biteq((void*)&a, (void*)&b, sizeof({cty})); }}",
            flat = sanitize_field(&class.flat_name),
            cty = cty
        ));
    }
    e.out().blank_line();

    // Unbox helpers, one per boxed class, named after the unboxed target.
    for &id in &ids {
        let class = e.md().class(id);
        if class.special != SpecialClass::Boxed {
            continue;
        }
        let Some(inner) = class.wrapped.clone() else {
            continue;
        };
        let Some(inner_id) = inner.resolved else {
            continue;
        };
        let inner_flat = sanitize_field(&e.md().class(inner_id).flat_name);
        let inner_c = e.ctype(&inner);
        let word = e.class_word(id);
        e.out().emit_line(&format!(
            "static {inner_c} _soX_unboxh_{flat}(void* obj) {{ {inner_c} l_r; _soX_unbox((void*)&l_r, sizeof(l_r), obj, {word}); return l_r; }}",
            inner_c = inner_c,
            flat = inner_flat,
            word = word
        ));
    }
    e.out().blank_line();
    Ok(())
}

/// Server stubs: one per instance method of every foreign proxy's wrapped
/// class. The remoting listener resolves them by symbol name.
pub fn emit_server_stubs(e: &mut Emitter) -> Result<(), CompileError> {
    e.out().emit_line("/* remoting server stubs */");
    let ids: Vec<ClassId> = e.md().class_ids().collect();
    for id in ids {
        let class = e.md().class(id);
        if class.special != SpecialClass::Foreign {
            continue;
        }
        let stub_methods: Vec<MethodId> = class.instance_methods.clone();
        for stub in stub_methods {
            let method = e.md().method(stub);
            if method.special != SpecialMethod::ForeignSync {
                continue;
            }
            let Some(target) = method.base_method else {
                continue;
            };
            emit_server_stub(e, target)?;
        }
    }
    e.out().blank_line();
    Ok(())
}

pub fn server_stub_name(wrapped_flat: &str, method_name: &str) -> String {
    format!(
        "_soX_srvstub_{}_{}",
        sanitize_field(wrapped_flat),
        sanitize_field(method_name)
    )
}

fn emit_server_stub(e: &mut Emitter, target: MethodId) -> Result<(), CompileError> {
    let method = e.md().method(target).clone();
    let class = e.md().class(method.declaring_class);
    let class_flat = class.flat_name.clone();
    let self_c = e.ctype_of_class(method.declaring_class);
    let name = server_stub_name(&class_flat, &method.name);
    let ret = method.sig.ret.clone();
    let ret_c = e.ctype(&ret);

    let mut fn_types = vec![self_c.clone()];
    for p in &method.sig.params {
        fn_types.push(e.ctype(&p.ty));
    }
    let fn_cast = format!("{} (*)({})", ret_c, fn_types.join(", "));

    e.out().emit_line(&format!(
        "void {}(void* self, void* msg, void* retbuf) {{",
        name
    ));
    e.out().indent();
    let argc = method.sig.params.len().max(1);
    e.out().emit_line(&format!("void* l_args[{}];", argc));
    e.out()
        .emit_line(&format!("{};", declare_fnptr(&fn_cast, "l_fn")));
    e.out().emit_line("_soX_unpack(l_args, msg);");
    e.out().emit_line(&format!(
        "l_fn = ({})_soX_findmethod2(self, \"{}\");",
        fn_cast, method.name
    ));

    let mut call_args = vec![format!("(({})self)", self_c)];
    for (i, p) in method.sig.params.iter().enumerate() {
        call_args.push(unpack_arg(e, &p.ty, i));
    }
    let call = format!("l_fn({})", call_args.join(", "));
    if ret.is_void() {
        e.out().emit_line(&format!("{};", call));
    } else {
        e.out()
            .emit_line(&format!("*({}*)retbuf = {};", ret_c, call));
    }
    e.out().dedent();
    e.out().emit_line("}");
    Ok(())
}

// C function-pointer declarations put the name inside the type.
fn declare_fnptr(cast: &str, name: &str) -> String {
    cast.replacen("(*)", &format!("(*{})", name), 1)
}

fn unpack_arg(e: &Emitter, ty: &TypeRef, index: usize) -> String {
    if ty.array_level == 0 && ty.kind == TypeRefKind::Normal {
        match ty.prim {
            PrimType::Int => return format!("(int)l_args[{}]", index),
            PrimType::Bool => return format!("(_so_bool)(int)l_args[{}]", index),
            PrimType::Char => return format!("(_so_char)(int)l_args[{}]", index),
            PrimType::Float => return format!("(*(float*)&l_args[{}])", index),
            _ => {}
        }
    }
    format!("(({})l_args[{}])", e.ctype(ty), index)
}
