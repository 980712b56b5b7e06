//! The C emitter. Produces one self-contained translation unit per domain
//! in a strict section order: preamble, struct headers, constants, static
//! fields, function headers, vtables, generated helpers, function bodies,
//! remoting stubs, prolog and epilog.
//!
//! Emitted code references runtime metadata through three host-filled
//! tables: `_soX_classes` (class words, indexed by class id),
//! `_soX_methods` (method tokens) and `_soX_strlits` (interned string
//! literals), plus the `_soX_domain` handle.

mod body;
mod helpers;

use crate::text::TextBuilder;
use crate::{mangle, CompileError, CompileOptions};
use skizo_ast::ExprKind;
use skizo_metadata::{
    Class, ClassId, Metadata, MethodId, MethodKind, PrimType, SpecialClass, SpecialMethod,
    TypeRef, TypeRefKind,
};
use std::collections::HashMap;

/// What the emitter hands back to the domain besides the C text.
#[derive(Debug)]
pub struct EmitResult {
    pub c_source: String,
    /// Literal texts in `_soX_strlits` slot order; the domain interns them
    /// and patches the table before the prolog runs.
    pub string_literals: Vec<String>,
}

pub struct Emitter<'a> {
    md: &'a Metadata,
    options: &'a CompileOptions,
    tb: TextBuilder,
    string_literals: Vec<String>,
    literal_slots: HashMap<String, usize>,
    /// Array-init helpers discovered while walking bodies:
    /// helper id -> (array class, element count).
    array_inits: HashMap<u32, (ClassId, usize)>,
}

impl<'a> Emitter<'a> {
    pub fn new(md: &'a Metadata, options: &'a CompileOptions) -> Self {
        Emitter {
            md,
            options,
            tb: TextBuilder::new(),
            string_literals: Vec::new(),
            literal_slots: HashMap::new(),
            array_inits: HashMap::new(),
        }
    }

    pub fn emit(mut self) -> Result<EmitResult, CompileError> {
        self.collect_array_inits();

        self.emit_preamble();
        self.emit_struct_headers()?;
        self.emit_consts();
        self.emit_static_fields();
        self.emit_function_headers()?;
        self.emit_vtables();
        helpers::emit_generated_helpers(&mut self)?;
        body::emit_function_bodies(&mut self)?;
        helpers::emit_server_stubs(&mut self)?;
        self.emit_prolog();
        self.emit_epilog();

        Ok(EmitResult {
            c_source: self.tb.into_string(),
            string_literals: self.string_literals,
        })
    }

    // ------------------------------------------------------------------
    // Shared lookups
    // ------------------------------------------------------------------

    pub(crate) fn strlit_slot(&mut self, text: &str) -> usize {
        if let Some(&slot) = self.literal_slots.get(text) {
            return slot;
        }
        let slot = self.string_literals.len();
        self.string_literals.push(text.to_string());
        self.literal_slots.insert(text.to_string(), slot);
        slot
    }

    /// The C type of a typeref as used for locals, params and fields.
    pub(crate) fn ctype(&self, ty: &TypeRef) -> String {
        if ty.is_void() {
            return "void".to_string();
        }
        if let Some(id) = ty.resolved {
            return self.ctype_of_class(id);
        }
        match ty.prim {
            PrimType::Int => "int".to_string(),
            PrimType::Float => "float".to_string(),
            PrimType::Bool => "_so_bool".to_string(),
            PrimType::Char => "_so_char".to_string(),
            PrimType::IntPtr => "void*".to_string(),
            _ => "void*".to_string(),
        }
    }

    pub(crate) fn ctype_of_class(&self, id: ClassId) -> String {
        let class = self.md.class(id);
        // Aliases are transparent at the representation level.
        if class.special == SpecialClass::Alias {
            if let Some(wrapped) = &class.wrapped {
                return self.ctype(wrapped);
            }
        }
        match class.flat_name.as_str() {
            "int" => return "int".to_string(),
            "float" => return "float".to_string(),
            "bool" => return "_so_bool".to_string(),
            "char" => return "_so_char".to_string(),
            "intptr" => return "void*".to_string(),
            _ => {}
        }
        let name = mangle::c_struct_name(&class.flat_name);
        if class.is_value_type {
            name
        } else {
            format!("{}*", name)
        }
    }

    pub(crate) fn class_word(&self, id: ClassId) -> String {
        format!("_soX_classes[{}]", id.0)
    }

    pub(crate) fn method_token(&self, id: MethodId) -> String {
        format!("_soX_methods[{}]", id.0)
    }

    pub(crate) fn md(&self) -> &'a Metadata {
        self.md
    }

    pub(crate) fn options(&self) -> &'a CompileOptions {
        self.options
    }

    pub(crate) fn out(&mut self) -> &mut TextBuilder {
        &mut self.tb
    }

    // ------------------------------------------------------------------
    // Section 1: preamble
    // ------------------------------------------------------------------

    fn emit_preamble(&mut self) {
        let class_count = self.md.class_count().max(1);
        let method_count = self.md.method_count().max(1);
        let literal_count = self.count_string_literals().max(1);
        let tb = &mut self.tb;
        tb.emit_line("/* generated by the skizo emitter; do not edit */");
        tb.blank_line();
        tb.emit_line("typedef int _so_bool;");
        tb.emit_line("#define _so_TRUE 1");
        tb.emit_line("#define _so_FALSE 0");
        tb.emit_line("typedef unsigned short _so_char;");
        tb.blank_line();
        tb.emit_line("typedef struct _soX_ArrayHeader { void** _soX_vtbl; int length; } _soX_ArrayHeader;");
        tb.emit_line("typedef struct _soX_Closure { void** _soX_vtbl; void* env; void* code_offset; } _soX_Closure;");
        tb.blank_line();
        tb.emit_line("/* host-filled tables */");
        tb.emit_line(&format!("void* _soX_classes[{}];", class_count));
        tb.emit_line(&format!("void* _soX_methods[{}];", method_count));
        tb.emit_line(&format!("void* _soX_strlits[{}];", literal_count));
        tb.emit_line("void* _soX_domain;");
        tb.blank_line();
        tb.emit_line("/* runtime helpers */");
        for decl in [
            "extern void* _soX_gc_alloc(void* mm, int sz, void** vtable);",
            "extern void* _soX_gc_alloc_env(void* mm, void* objClass);",
            "extern void _soX_gc_roots(void* mm, void** rootRefs, int count);",
            "extern void _soX_static_vt(void* mm, void* obj, void* objClass);",
            "extern void* _soX_findmethod(void* obj, void* method);",
            "extern void* _soX_findmethod2(void* obj, const char* name);",
            "extern void* _soX_downcast(void* obj, void* targetClass);",
            "extern _so_bool _soX_is(void* obj, void* targetClass);",
            "extern void _soX_unbox(void* dest, int sz, void* obj, void* boxedClass);",
            "extern void _soX_abort0(int errCode);",
            "extern void _soX_abort_e(void* errObj);",
            "extern void* _soX_newarray(void* mm, int length, void* arrayClass);",
            "extern void _soX_zero(void* p, int sz);",
            "extern _so_bool _soX_biteq(void* a, void* b, int sz);",
            "extern void _soX_cctor(void* mm, void* objClass, void (*fn)(void));",
            "extern void _soX_checktype(void* objClass);",
            "extern void _soX_addhandler(void* event, void* handler);",
            "extern void _soX_msgsnd_sync(void* hDomain, void* objName, void* method, void** args, void* retBuf);",
            "extern void _soX_unpack(void** args, void* msg);",
            "extern void _soX_regvtable(void* mm, void* objClass, void** vtable);",
            "extern int _so_int_op_divide(int a, int b);",
        ] {
            tb.emit_line(decl);
        }
        if self.options.stack_trace_enabled || self.options.profiling_enabled {
            self.tb
                .emit_line("extern void _soX_pushframe(void* mm, void* method);");
            self.tb.emit_line("extern void _soX_popframe(void* mm);");
        }
        if self.options.profiling_enabled {
            self.tb
                .emit_line("extern void _soX_pushframe_prf(void* mm, void* method);");
            self.tb
                .emit_line("extern void _soX_popframe_prf(void* mm, void* method);");
        }
        if self.options.soft_debugging_enabled {
            self.tb.emit_line("extern void _soX_break(void* mm);");
            self.tb
                .emit_line("extern void _soX_reglocals(void* mm, void** locals, int count);");
            self.tb.emit_line("extern void _soX_unreglocals(void* mm);");
        }
        self.tb.blank_line();
        if self.options.explicit_null_check {
            self.tb
                .emit_line("#define _soX_TN if(!self) _soX_abort0(2);");
        } else {
            self.tb.emit_line("#define _soX_TN");
        }
        self.tb.blank_line();
        self.tb.emit_line(
            "static int _soX_arrlen(void* a) { if(!a) _soX_abort0(2); return ((_soX_ArrayHeader*)a)->length; }",
        );
        self.tb.blank_line();
    }

    /// Literal slots are assigned while emitting bodies; the preamble only
    /// needs an upper bound, so count them up front.
    fn count_string_literals(&self) -> usize {
        let mut count = 0;
        for mid in self.md.method_ids() {
            if let Some(body) = &self.md.method(mid).body {
                for expr in &body.exprs {
                    count += count_strlits(expr);
                }
            }
        }
        // Enum toString tables intern one literal per item.
        for class in self.md.classes() {
            count += class.enum_items.len();
        }
        count + 8
    }

    fn collect_array_inits(&mut self) {
        let mut found = HashMap::new();
        for mid in self.md.method_ids() {
            if let Some(body) = &self.md.method(mid).body {
                for expr in &body.exprs {
                    collect_array_inits_in(self.md, expr, &mut found);
                }
            }
        }
        self.array_inits = found;
    }

    // ------------------------------------------------------------------
    // Section 2: struct headers
    // ------------------------------------------------------------------

    fn emit_struct_headers(&mut self) -> Result<(), CompileError> {
        self.tb.emit_line("/* struct headers */");

        // Forward typedefs for everything first so declaration order never
        // matters for pointers.
        let ids: Vec<ClassId> = self.md.class_ids().collect();
        for &id in &ids {
            let class = self.md.class(id);
            if is_primitive_class(class) {
                continue;
            }
            let name = mangle::c_struct_name(&class.flat_name);
            match class.special {
                SpecialClass::Array => {
                    self.tb
                        .emit_line(&format!("typedef _soX_ArrayHeader {};", name));
                }
                SpecialClass::MethodClass => {
                    self.tb.emit_line(&format!("typedef _soX_Closure {};", name));
                }
                SpecialClass::Alias => {
                    let target = class
                        .wrapped
                        .as_ref()
                        .map(|t| self.ctype(t))
                        .unwrap_or_else(|| "void*".to_string());
                    self.tb.emit_line(&format!("typedef {} {};", target, name));
                }
                _ => {
                    self.tb
                        .emit_line(&format!("typedef struct {} {};", name, name));
                }
            }
        }
        self.tb.blank_line();

        // Full bodies: value-types first (in embedding order), then
        // reference types.
        let mut emitted: std::collections::HashSet<ClassId> = Default::default();
        for &id in &ids {
            if self.md.class(id).is_value_type {
                self.emit_struct_body_recursive(id, &mut emitted);
            }
        }
        for &id in &ids {
            if !self.md.class(id).is_value_type {
                self.emit_struct_body_recursive(id, &mut emitted);
            }
        }
        self.tb.blank_line();
        Ok(())
    }

    fn emit_struct_body_recursive(
        &mut self,
        id: ClassId,
        emitted: &mut std::collections::HashSet<ClassId>,
    ) {
        if emitted.contains(&id) {
            return;
        }
        let class = self.md.class(id);
        if is_primitive_class(class)
            || matches!(
                class.special,
                SpecialClass::Array | SpecialClass::MethodClass | SpecialClass::Alias
            )
        {
            emitted.insert(id);
            return;
        }

        // Embedded value types first.
        let field_ids = class.instance_fields.clone();
        for &fid in &field_ids {
            let ty = &self.md.field(fid).ty;
            if ty.array_level == 0 && ty.kind == TypeRefKind::Normal {
                if let Some(inner) = ty.resolved {
                    if self.md.class(inner).is_value_type && inner != id {
                        self.emit_struct_body_recursive(inner, emitted);
                    }
                }
            }
        }
        emitted.insert(id);

        let class = self.md.class(id);
        let name = mangle::c_struct_name(&class.flat_name);

        if class.special == SpecialClass::BinaryBlob {
            let size = class.native_size.unwrap_or(1).max(1);
            self.tb
                .emit_line(&format!("struct {} {{ char _soX_data[{}]; }};", name, size));
            return;
        }
        if class.flat_name == "string" {
            self.tb.emit_line(&format!(
                "struct {} {{ void** _soX_vtbl; int length; }};",
                name
            ));
            return;
        }
        if class.is_hierarchy_root || class.special == SpecialClass::Interface {
            // Only pointers to these ever exist; an empty shell keeps the
            // typedef usable.
            self.tb
                .emit_line(&format!("struct {} {{ void** _soX_vtbl; }};", name));
            return;
        }

        let mut line = format!("struct {} {{ ", name);
        if !class.is_value_type {
            line.push_str("void** _soX_vtbl; ");
        }
        // Inherited fields precede declared ones; walk the chain outward.
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(cid) = cursor {
            let c = self.md.class(cid);
            if c.special == SpecialClass::None
                || c.special == SpecialClass::EventClass
                || c.special == SpecialClass::ClosureEnv
                || c.special == SpecialClass::Failable
                || c.special == SpecialClass::Boxed
                || c.special == SpecialClass::Foreign
            {
                chain.push(cid);
            }
            cursor = c.base_class();
        }
        for cid in chain.iter().rev() {
            for &fid in &self.md.class(*cid).instance_fields {
                let field = self.md.field(fid);
                line.push_str(&format!(
                    "{} {}; ",
                    self.ctype(&field.ty),
                    sanitize_field(&field.name)
                ));
            }
        }
        if class.is_value_type && class.instance_fields.is_empty() {
            line.push_str("char _soX_empty; ");
        }
        line.push_str("};");
        self.tb.emit_line(&line);
    }

    // ------------------------------------------------------------------
    // Section 2b: constants and static fields
    // ------------------------------------------------------------------

    fn emit_consts(&mut self) {
        self.tb.emit_line("/* constants */");
        let class_ids: Vec<ClassId> = self.md.class_ids().collect();
        for id in class_ids {
            for &cid in &self.md.class(id).consts.clone() {
                let konst = self.md.const_(cid);
                let name = mangle::c_static_field_name(
                    &self.md.class(id).flat_name,
                    &konst.name,
                );
                let value = match &konst.value {
                    skizo_ast::ConstValue::Int(v) => format!("{}", v),
                    skizo_ast::ConstValue::Float(v) => format!("{}f", format_float(*v)),
                    skizo_ast::ConstValue::Bool(v) => {
                        if *v { "_so_TRUE".into() } else { "_so_FALSE".into() }
                    }
                    skizo_ast::ConstValue::Char(c) => format!("{}", *c as u32),
                    skizo_ast::ConstValue::String(s) => {
                        let slot = self.strlit_slot(s);
                        format!("(_soX_strlits[{}])", slot)
                    }
                };
                self.tb.emit_line(&format!("#define {} {}", name, value));
            }
        }
        self.tb.blank_line();
    }

    fn emit_static_fields(&mut self) {
        self.tb.emit_line("/* static fields */");
        for class in self.md.classes() {
            for &fid in &class.static_fields {
                let field = self.md.field(fid);
                let cname = mangle::c_static_field_name(&class.flat_name, &field.name);
                let is_value_struct = field
                    .ty
                    .resolved
                    .map(|id| {
                        self.md.class(id).is_value_type && field.ty.prim == PrimType::Object
                    })
                    .unwrap_or(false)
                    && field.ty.array_level == 0
                    && field.ty.kind == TypeRefKind::Normal;
                if is_value_struct {
                    // Zero-initialised at runtime via _soX_static_vt.
                    self.tb
                        .emit_line(&format!("{} {};", self.ctype(&field.ty), cname));
                } else {
                    self.tb
                        .emit_line(&format!("{} {} = 0;", self.ctype(&field.ty), cname));
                }
            }
        }
        self.tb.blank_line();
    }

    // ------------------------------------------------------------------
    // Section 3: function headers
    // ------------------------------------------------------------------

    pub(crate) fn function_signature(&self, mid: MethodId) -> String {
        let method = self.md.method(mid);
        let class = self.md.class(method.declaring_class);
        let cname = mangle::c_method_name(&class.flat_name, &c_name_of_method(method));

        let mut params = Vec::new();
        match method.kind {
            MethodKind::Ctor => {}
            _ => {
                if !method.sig.is_static {
                    params.push(format!("{} self", self.ctype_of_class(method.declaring_class)));
                }
            }
        }
        for p in &method.sig.params {
            params.push(format!("{} p_{}", self.ctype(&p.ty), sanitize_field(&p.name)));
        }
        let params = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };

        let ret = match method.kind {
            // The nameless static ctor initialises, it does not allocate.
            MethodKind::Ctor if method.name.is_empty() => "void".to_string(),
            MethodKind::Ctor => self.ctype_of_class(method.declaring_class),
            MethodKind::Dtor => "void".to_string(),
            MethodKind::Normal => self.ctype(&method.sig.ret),
        };
        format!("{} {}({})", ret, cname, params)
    }

    fn emit_function_headers(&mut self) -> Result<(), CompileError> {
        self.tb.emit_line("/* function headers */");
        let mids: Vec<MethodId> = self.md.method_ids().collect();
        for mid in mids {
            if !self.method_is_emitted_as_c(mid) {
                // Thunk-manager specials and icalls resolve as externs.
                if self.method_is_extern(mid) {
                    let sig = self.function_signature(mid);
                    self.tb.emit_line(&format!("extern {};", sig));
                }
                continue;
            }
            let sig = self.function_signature(mid);
            self.tb.emit_line(&format!("{};", sig));
        }
        self.tb.blank_line();

        // Virtual call helpers for every slot's ultimate base, interface
        // dispatch helpers, and closure invoke helpers.
        let mids: Vec<MethodId> = self.md.method_ids().collect();
        for mid in mids {
            let method = self.md.method(mid);
            if method.vtable_index < 0 {
                continue;
            }
            let mclass = self.md.class(method.declaring_class);
            if mclass.special == SpecialClass::Interface {
                body::emit_interface_call_helper(self, mid)?;
            } else if method.is_truly_virtual && method.base_method.is_none() {
                body::emit_vch(self, mid)?;
            }
        }
        let ids: Vec<ClassId> = self.md.class_ids().collect();
        for id in ids {
            if self.md.class(id).special == SpecialClass::MethodClass {
                body::emit_invoke_helper(self, id)?;
            }
        }
        self.tb.blank_line();
        Ok(())
    }

    /// Methods the emitter compiles to C bodies.
    pub(crate) fn method_is_emitted_as_c(&self, mid: MethodId) -> bool {
        let method = self.md.method(mid);
        let class = self.md.class(method.declaring_class);

        if method.is_abstract {
            return false;
        }
        match method.special {
            SpecialMethod::None => method.body.is_some(),
            SpecialMethod::Fire | SpecialMethod::AddHandler => true,
            SpecialMethod::ForeignSync => true,
            SpecialMethod::EnumFromInt => true,
            SpecialMethod::DisallowedECall => true,
            SpecialMethod::Native => {
                // Generated members of wrapper classes get synthesized
                // bodies; true natives resolve at link time.
                match class.special {
                    SpecialClass::Failable => true,
                    SpecialClass::EventClass => true, // the generated ctor
                    SpecialClass::Array => false,     // inlined at call sites
                    _ => !class.enum_items.is_empty() && method.is_compiler_generated,
                }
            }
            // Closure ctors, boxed methods and boxed ctors come from the
            // thunk manager.
            SpecialMethod::ClosureCtor
            | SpecialMethod::BoxedMethod
            | SpecialMethod::BoxedCtor
            | SpecialMethod::ForeignAsync => false,
        }
    }

    /// Methods declared extern: icalls, ecalls and thunk-generated stubs.
    fn method_is_extern(&self, mid: MethodId) -> bool {
        let method = self.md.method(mid);
        let class = self.md.class(method.declaring_class);
        match method.special {
            SpecialMethod::Native => {
                // Primitive operators are lowered inline; array accessors
                // have dedicated helpers.
                if is_primitive_operator(self.md, mid) {
                    return false;
                }
                // Method-class invokes dispatch through the closure layout;
                // no standalone symbol exists for them.
                !matches!(
                    class.special,
                    SpecialClass::Array
                        | SpecialClass::Failable
                        | SpecialClass::MethodClass
                        | SpecialClass::EventClass
                ) && class.enum_items.is_empty()
            }
            SpecialMethod::BoxedMethod
            | SpecialMethod::BoxedCtor
            | SpecialMethod::ClosureCtor => true,
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Section 4: vtables
    // ------------------------------------------------------------------

    fn emit_vtables(&mut self) {
        self.tb.emit_line("/* vtables */");
        let ids: Vec<ClassId> = self.md.class_ids().collect();
        for id in ids {
            let class = self.md.class(id);
            if !class.has_vtable
                || class.special == SpecialClass::Interface
                || class.is_hierarchy_root
            {
                continue;
            }
            // Closure vtables are built by the thunk machinery at runtime.
            if class.special == SpecialClass::MethodClass {
                continue;
            }
            let methods = class.instance_methods.clone();
            let mut slots = vec!["0".to_string()];
            for &mid in &methods {
                let m = self.md.method(mid);
                if m.is_abstract {
                    slots.push("0".to_string());
                    continue;
                }
                if self.method_is_emitted_as_c(mid) || self.method_is_extern(mid) {
                    let mclass = self.md.class(m.declaring_class);
                    slots.push(format!(
                        "(void*)&{}",
                        mangle::c_method_name(&mclass.flat_name, &c_name_of_method(m))
                    ));
                } else {
                    slots.push("0".to_string());
                }
            }
            self.tb.emit_line(&format!(
                "void* {}[{}] = {{ {} }};",
                mangle::c_vtable_name(&class.flat_name),
                slots.len(),
                slots.join(", ")
            ));
        }
        self.tb.blank_line();
    }

    // ------------------------------------------------------------------
    // Sections 11/12: prolog and epilog
    // ------------------------------------------------------------------

    fn emit_prolog(&mut self) {
        self.tb.emit_line("/* prolog */");
        self.tb.emit_line("void _soX_prolog(void* domain) {");
        self.tb.indent();
        self.tb.emit_line("_soX_domain = domain;");

        // Register vtables (slot 0 becomes the class word).
        let ids: Vec<ClassId> = self.md.class_ids().collect();
        for &id in &ids {
            let class = self.md.class(id);
            if !class.has_vtable
                || class.special == SpecialClass::Interface
                || class.is_hierarchy_root
                || class.special == SpecialClass::MethodClass
            {
                continue;
            }
            let vt = mangle::c_vtable_name(&class.flat_name);
            self.tb
                .emit_line(&format!("{}[0] = {};", vt, self.class_word(id)));
            self.tb.emit_line(&format!(
                "_soX_regvtable(domain, {}, {});",
                self.class_word(id),
                vt
            ));
        }

        // Stage 0: static-field roots and static value-type zeroing.
        let mut root_fields = Vec::new();
        for &id in &ids {
            let class = self.md.class(id);
            for &fid in &class.static_fields {
                let field = self.md.field(fid);
                let cname = mangle::c_static_field_name(&class.flat_name, &field.name);
                if crate::resolver::is_reference_typeref(self.md, &field.ty) {
                    root_fields.push(cname);
                } else if field.ty.prim == PrimType::Object
                    && field.ty.array_level == 0
                    && field.ty.kind == TypeRefKind::Normal
                {
                    if let Some(vid) = field.ty.resolved {
                        if self.md.class(vid).is_value_type {
                            self.tb.emit_line(&format!(
                                "_soX_static_vt(domain, (void*)&{}, {});",
                                cname,
                                self.class_word(vid)
                            ));
                        }
                    }
                }
            }
        }
        if !root_fields.is_empty() {
            let list = root_fields
                .iter()
                .map(|n| format!("(void*)&{}", n))
                .collect::<Vec<_>>()
                .join(", ");
            self.tb.emit_line(&format!(
                "{{ static void* l_roots[{}] = {{ {} }}; _soX_gc_roots(domain, l_roots, {}); }}",
                root_fields.len(),
                list,
                root_fields.len()
            ));
        }

        // Stage 1: user static ctors (and enum item construction), each
        // trapped per class through _soX_cctor.
        for &id in &ids {
            let class = self.md.class(id);
            let has_cctor = class.static_ctor.is_some() || !class.enum_items.is_empty();
            if has_cctor {
                self.tb.emit_line(&format!(
                    "_soX_cctor(domain, {}, &{});",
                    self.class_word(id),
                    cctor_impl_name(&class.flat_name)
                ));
            }
        }

        self.tb.dedent();
        self.tb.emit_line("}");
        self.tb.blank_line();
    }

    fn emit_epilog(&mut self) {
        self.tb.emit_line("/* epilog */");
        self.tb.emit_line("void _soX_epilog(void) {");
        self.tb.indent();
        let ids: Vec<ClassId> = self.md.class_ids().collect();
        for id in ids {
            if let Some(dtor) = self.md.class(id).static_dtor {
                if self.method_is_emitted_as_c(dtor) {
                    let class = self.md.class(id);
                    let m = self.md.method(dtor);
                    self.tb.emit_line(&format!(
                        "{}();",
                        mangle::c_method_name(&class.flat_name, &c_name_of_method(m))
                    ));
                }
            }
        }
        self.tb.dedent();
        self.tb.emit_line("}");
    }

    pub(crate) fn array_inits(&self) -> &HashMap<u32, (ClassId, usize)> {
        &self.array_inits
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn is_primitive_class(class: &Class) -> bool {
    matches!(
        class.flat_name.as_str(),
        "int" | "float" | "bool" | "char" | "intptr"
    )
}

pub(crate) fn is_primitive_operator(md: &Metadata, mid: MethodId) -> bool {
    let method = md.method(mid);
    let class = md.class(method.declaring_class);
    is_primitive_class(class)
        && matches!(
            method.name.as_str(),
            "+" | "-" | "*" | "/" | "%" | "<" | ">" | "==" | "and" | "or" | "not"
        )
}

/// Ctors/dtors need distinct C suffixes from plain methods.
pub(crate) fn c_name_of_method(method: &skizo_metadata::Method) -> String {
    match method.kind {
        MethodKind::Dtor => {
            if method.sig.is_static {
                "cdtor_impl".to_string()
            } else {
                "dtor".to_string()
            }
        }
        MethodKind::Ctor if method.name.is_empty() => "cctor_user".to_string(),
        _ => method.name.clone(),
    }
}

pub(crate) fn cctor_impl_name(flat: &str) -> String {
    format!("_so_{}_cctor_impl", flat.replace(|c: char| !c.is_ascii_alphanumeric(), "_"))
}

pub(crate) fn sanitize_field(name: &str) -> String {
    name.replace(|c: char| !c.is_ascii_alphanumeric(), "_")
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

fn count_strlits(expr: &skizo_ast::Expr) -> usize {
    let mut count = match &expr.kind {
        ExprKind::StringLit(_) => 1,
        _ => 0,
    };
    visit_children(expr, &mut |child| count += count_strlits(child));
    count
}

fn collect_array_inits_in(
    md: &Metadata,
    expr: &skizo_ast::Expr,
    found: &mut HashMap<u32, (ClassId, usize)>,
) {
    if let ExprKind::ArrayInit { exprs, helper_id } = &expr.kind {
        if let (Some(id), Some(class)) = (helper_id, expr.inferred.resolved) {
            found.insert(*id, (class, exprs.len()));
        }
    }
    visit_children(expr, &mut |child| collect_array_inits_in(md, child, found));
}

/// Immutable sibling of the transformer's child walker.
pub(crate) fn visit_children(expr: &skizo_ast::Expr, f: &mut dyn FnMut(&skizo_ast::Expr)) {
    use ExprKind::*;
    match &expr.kind {
        Body(b) => b.exprs.iter().for_each(|e| f(e)),
        Call(c) => c.exprs.iter().for_each(|e| f(e)),
        Return(e) | Abort(e) | Assert(e) | Ref(e) => f(e),
        ArrayCreation { length } => f(length),
        Cast { expr: e, .. } | Is { expr: e, .. } => f(e),
        ArrayInit { exprs, .. } => exprs.iter().for_each(|e| f(e)),
        IdentityComparison { left, right } | Assignment { left, right } => {
            f(left);
            f(right);
        }
        InlinedCondition {
            cond,
            then_body,
            else_body,
            ..
        } => {
            f(cond);
            f(then_body);
            if let Some(e) = else_body {
                f(e);
            }
        }
        _ => {}
    }
}
