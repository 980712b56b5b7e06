//! The extern "C" helper surface emitted code links against. Every
//! helper resolves the domain bound to the current thread; domains are
//! thread-bound, so no synchronisation is needed here.

use crate::backend::CBackend;
use crate::domain::{current_domain, Domain};
use crate::gc::{GcHooks, MemoryManager};
use crate::remoting::{send_sync_shared, DomainHandleShared};
use crate::strings;
use skizo_diagnostics::abort::{AbortCode, DomainAbort};
use skizo_metadata::{
    ClassId, MemberRef, Metadata, MethodId, SpecialClass, TypeRef, TypeRefKind,
    ARRAY_FIRST_ITEM_OFFSET,
};
use std::ffi::c_void;

pub fn typeref_is_reference(md: &Metadata, ty: &TypeRef) -> bool {
    if ty.array_level > 0 || ty.kind == TypeRefKind::Foreign {
        return true;
    }
    if ty.kind == TypeRefKind::Failable {
        return false;
    }
    match ty.prim {
        skizo_metadata::PrimType::Object => ty
            .resolved
            .map(|id| md.class(id).is_reference_type())
            .unwrap_or(true),
        _ => false,
    }
}

fn domain<'a>() -> &'a mut Domain {
    unsafe { current_domain() }.unwrap_or_else(|| {
        std::panic::panic_any(DomainAbort::with_message(
            "runtime helper called without a bound domain",
        ))
    })
}

fn abort_code(code: AbortCode) -> ! {
    crate::domain::set_last_error(&code.to_string());
    std::panic::panic_any(DomainAbort::from_code(code))
}

fn class_from_word(word: usize) -> ClassId {
    ClassId((word - 1) as u32)
}

fn run_gc_hooks<R>(domain: &mut Domain, f: impl FnOnce(&mut MemoryManager, &Metadata, &mut GcHooks) -> R) -> R {
    let dtors = std::mem::take(&mut domain.dtor_ptrs);
    let thunks: *mut crate::thunks::ThunkManager = &mut domain.thunks;
    let mut release = |obj: *mut u8| unsafe { (*thunks).release_closure(obj) };
    let mut hooks = GcHooks {
        dtors: &dtors,
        release_closure: &mut release,
    };
    let result = f(&mut domain.memory, &domain.metadata, &mut hooks);
    domain.dtor_ptrs = dtors;
    result
}

// ---------------------------------------------------------------------------
// Allocation and garbage collection
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _soX_gc_alloc(
    _mm: *mut c_void,
    sz: i32,
    vtable: *mut *mut c_void,
) -> *mut c_void {
    let domain = domain();
    let obj = run_gc_hooks(domain, |memory, md, hooks| {
        memory.allocate(md, sz as usize, vtable as *mut usize, hooks)
    });
    if obj.is_null() {
        let class_id = class_from_word(*(vtable as *const usize));
        if !domain.metadata.class(class_id).is_initialized {
            abort_code(AbortCode::TypeInitialization);
        }
        abort_code(AbortCode::OutOfMemory);
    }
    obj as *mut c_void
}

/// Closure-env allocation: the env class's single-slot vtable is created
/// on demand by the thunk manager.
pub unsafe extern "C" fn _soX_gc_alloc_env(_mm: *mut c_void, obj_class: *mut c_void) -> *mut c_void {
    let domain = domain();
    let class_id = class_from_word(obj_class as usize);
    let size = domain.metadata.class(class_id).gc_info.content_size as usize;
    let vtable = domain.thunks.closure_vtable(class_id, 0);
    let obj = run_gc_hooks(domain, |memory, md, hooks| {
        memory.allocate(md, size, vtable, hooks)
    });
    if obj.is_null() {
        abort_code(AbortCode::OutOfMemory);
    }
    obj as *mut c_void
}

pub unsafe extern "C" fn _soX_gc_roots(_mm: *mut c_void, root_refs: *mut *mut c_void, count: i32) {
    let domain = domain();
    let locations: Vec<*mut *mut u8> = (0..count as usize)
        .map(|i| (root_refs as *mut *mut u8).add(i))
        .collect();
    domain.memory.add_gc_roots(&locations);
}

pub unsafe extern "C" fn _soX_static_vt(_mm: *mut c_void, obj: *mut c_void, obj_class: *mut c_void) {
    let domain = domain();
    let class_id = class_from_word(obj_class as usize);
    let metadata: *const Metadata = &domain.metadata;
    domain
        .memory
        .init_static_value_type_field(&*metadata, obj as *mut u8, class_id);
}

// ---------------------------------------------------------------------------
// Dispatch and type checks
// ---------------------------------------------------------------------------

fn code_ptr_of(domain: &Domain, method: MethodId, obj: *mut u8) -> *const c_void {
    let m = domain.metadata.method(method);
    if m.vtable_index >= 0 && !obj.is_null() {
        let class_id = unsafe { MemoryManager::class_of(obj) };
        if let Some(&vtable) = domain.vtables.get(&class_id) {
            let slot = unsafe { *(vtable as *const usize).add(m.vtable_index as usize + 1) };
            if slot != 0 {
                return slot as *const c_void;
            }
        }
    }
    let class = domain.metadata.class(m.declaring_class);
    let name = skizo_compiler::mangle::c_method_name(&class.flat_name, &m.name);
    domain
        .backend
        .symbol(&name)
        .unwrap_or(std::ptr::null())
}

pub unsafe extern "C" fn _soX_findmethod(obj: *mut c_void, method: *mut c_void) -> *mut c_void {
    if obj.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    let domain = domain();
    let method_id = MethodId((method as usize - 1) as u32);
    let ptr = code_ptr_of(domain, method_id, obj as *mut u8);
    if ptr.is_null() {
        abort_code(AbortCode::MissingSymbol);
    }
    ptr as *mut c_void
}

pub unsafe extern "C" fn _soX_findmethod2(obj: *mut c_void, name: *const libc::c_char) -> *mut c_void {
    if obj.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    let domain = domain();
    let name = std::ffi::CStr::from_ptr(name).to_string_lossy().to_string();
    let mut cursor = Some(MemoryManager::class_of(obj as *mut u8));
    while let Some(class_id) = cursor {
        if let Some(MemberRef::Method(mid)) = domain.metadata.class(class_id).member(&name) {
            let ptr = code_ptr_of(domain, mid, obj as *mut u8);
            if ptr.is_null() {
                abort_code(AbortCode::MissingSymbol);
            }
            return ptr as *mut c_void;
        }
        cursor = domain.metadata.class(class_id).base_class();
    }
    abort_code(AbortCode::MissingSymbol);
}

pub unsafe extern "C" fn _soX_downcast(obj: *mut c_void, target_class: *mut c_void) -> *mut c_void {
    if obj.is_null() {
        // null flows through downcasts unchanged.
        return obj;
    }
    let domain = domain();
    let target = class_from_word(target_class as usize);
    let actual = MemoryManager::class_of(obj as *mut u8);
    if domain.metadata.is_subclass_of(actual, target) {
        return obj;
    }
    // A boxed wrapper downcasts to itself only.
    abort_code(AbortCode::InvalidCast);
}

pub unsafe extern "C" fn _soX_is(obj: *mut c_void, target_class: *mut c_void) -> i32 {
    if obj.is_null() {
        return 0;
    }
    let domain = domain();
    let target = class_from_word(target_class as usize);
    let actual = MemoryManager::class_of(obj as *mut u8);
    domain.metadata.is_subclass_of(actual, target) as i32
}

pub unsafe extern "C" fn _soX_unbox(
    dest: *mut c_void,
    sz: i32,
    obj: *mut c_void,
    boxed_class: *mut c_void,
) {
    if obj.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    let expected = class_from_word(boxed_class as usize);
    let actual = MemoryManager::class_of(obj as *mut u8);
    if actual != expected {
        abort_code(AbortCode::InvalidCast);
    }
    std::ptr::copy_nonoverlapping(
        (obj as *const u8).add(4),
        dest as *mut u8,
        sz as usize,
    );
}

pub unsafe extern "C" fn _soX_checktype(obj_class: *mut c_void) {
    let domain = domain();
    let class_id = class_from_word(obj_class as usize);
    if !domain.metadata.class(class_id).is_initialized {
        abort_code(AbortCode::TypeInitialization);
    }
}

/// Stage-1 static ctor runner: aborts are trapped per class so one broken
/// type poisons only itself.
pub unsafe extern "C" fn _soX_cctor(
    _mm: *mut c_void,
    obj_class: *mut c_void,
    body: unsafe extern "C" fn(),
) {
    let domain = domain();
    let class_id = class_from_word(obj_class as usize);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body()));
    match outcome {
        Ok(()) => {
            domain.metadata.class_mut(class_id).is_initialized = true;
        }
        Err(payload) => {
            let message = crate::domain::abort_message(payload);
            log::error!(
                "static ctor of '{}' aborted: {}",
                domain.metadata.class(class_id).nice_name,
                message
            );
            crate::domain::set_last_error(&message);
        }
    }
}

// ---------------------------------------------------------------------------
// Aborts
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _soX_abort0(err_code: i32) {
    let code = AbortCode::from_i32(err_code).unwrap_or(AbortCode::ValueMismatch);
    abort_code(code);
}

/// Abort with a payload object: a string message or an Error instance
/// (whose first field is the message).
pub unsafe extern "C" fn _soX_abort_e(err_obj: *mut c_void) {
    let message = if err_obj.is_null() {
        "domain aborted".to_string()
    } else {
        let domain = domain();
        let class_id = MemoryManager::class_of(err_obj as *mut u8);
        if domain.metadata.class(class_id).flat_name == "string" {
            strings::read_string(err_obj as *const u8)
        } else {
            // Error layout: { vtable, m_message }
            let message_obj = *((err_obj as *const u8).add(4) as *const *const u8);
            strings::read_string(message_obj)
        }
    };
    crate::domain::set_last_error(&message);
    std::panic::panic_any(DomainAbort::with_message(message));
}

// ---------------------------------------------------------------------------
// Arrays, zeroing, bit equality
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _soX_newarray(
    _mm: *mut c_void,
    length: i32,
    array_class: *mut c_void,
) -> *mut c_void {
    if length < 0 {
        abort_code(AbortCode::RangeCheck);
    }
    let domain = domain();
    let class_id = class_from_word(array_class as usize);
    let item_size = domain
        .metadata
        .class(class_id)
        .wrapped
        .as_ref()
        .and_then(|w| w.resolved)
        .map(|id| domain.metadata.class(id).gc_info.size_for_use)
        .unwrap_or(std::mem::size_of::<usize>() as u32);
    let size = ARRAY_FIRST_ITEM_OFFSET as usize + length as usize * item_size as usize;
    let Some(&vtable) = domain.vtables.get(&class_id) else {
        abort_code(AbortCode::MissingSymbol);
    };
    let obj = run_gc_hooks(domain, |memory, md, hooks| {
        memory.allocate(md, size, vtable as *mut usize, hooks)
    });
    if obj.is_null() {
        abort_code(AbortCode::OutOfMemory);
    }
    *(obj.add(4) as *mut i32) = length;
    obj as *mut c_void
}

pub unsafe extern "C" fn _soX_zero(p: *mut c_void, sz: i32) {
    std::ptr::write_bytes(p as *mut u8, 0, sz as usize);
}

pub unsafe extern "C" fn _soX_biteq(a: *mut c_void, b: *mut c_void, sz: i32) -> i32 {
    let a = std::slice::from_raw_parts(a as *const u8, sz as usize);
    let b = std::slice::from_raw_parts(b as *const u8, sz as usize);
    (a == b) as i32
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Appends a handler by replacing the handler array with a grown copy, so
/// a fire loop iterating the old snapshot stays valid.
pub unsafe extern "C" fn _soX_addhandler(event: *mut c_void, handler: *mut c_void) {
    if event.is_null() {
        abort_code(AbortCode::NullDereference);
    }
    let domain = domain();
    let event_class = MemoryManager::class_of(event as *mut u8);
    let Some(MemberRef::Field(fid)) = domain.metadata.class(event_class).member("m_handlers")
    else {
        abort_code(AbortCode::MissingSymbol);
    };
    let field = domain.metadata.field(fid);
    let offset = field.offset as usize;
    let Some(array_class) = field.ty.resolved else {
        abort_code(AbortCode::MissingSymbol);
    };

    let old_array = *((event as *const u8).add(offset) as *const *mut u8);
    let old_len = if old_array.is_null() {
        0
    } else {
        *(old_array.add(4) as *const i32) as usize
    };

    let new_array = _soX_newarray(
        std::ptr::null_mut(),
        (old_len + 1) as i32,
        ((array_class.0 as usize) + 1) as *mut c_void,
    ) as *mut u8;

    let base = ARRAY_FIRST_ITEM_OFFSET as usize;
    for i in 0..old_len {
        let value = *(old_array.add(base + i * 4) as *const u32);
        *(new_array.add(base + i * 4) as *mut u32) = value;
    }
    *(new_array.add(base + old_len * 4) as *mut usize) = handler as usize;
    *((event as *mut u8).add(offset) as *mut *mut u8) = new_array;
}

// ---------------------------------------------------------------------------
// Remoting
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _soX_msgsnd_sync(
    h_domain: *mut c_void,
    obj_name: *mut c_void,
    method: *mut c_void,
    args: *mut *mut c_void,
    ret_buf: *mut c_void,
) {
    let domain = domain();
    if h_domain.is_null() {
        abort_code(AbortCode::Remoting);
    }
    let shared = &*(h_domain as *const DomainHandleShared);
    let target = strings::read_string(obj_name as *const u8);
    let method_id = MethodId((method as usize - 1) as u32);

    let sig = domain.metadata.method(method_id).sig.clone();
    let mut payload = Vec::new();
    for (i, param) in sig.params.iter().enumerate() {
        let word = *(args.add(i) as *const usize);
        if crate::remoting::serialize_value(&domain.metadata, &param.ty, word, &mut payload)
            .is_err()
        {
            abort_code(AbortCode::Remoting);
        }
    }

    match send_sync_shared(shared, &target, method_id, payload) {
        Ok(response) => {
            if !ret_buf.is_null() && !response.is_empty() {
                let n = response.len().min(16);
                std::ptr::copy_nonoverlapping(response.as_ptr(), ret_buf as *mut u8, n);
            }
        }
        Err(_) => abort_code(AbortCode::Remoting),
    }
}

/// Unpacks a serialized payload into an argument word array. The payload
/// pointer is the raw buffer the dispatcher handed to the server stub.
pub unsafe extern "C" fn _soX_unpack(args: *mut *mut c_void, msg: *mut c_void) {
    let domain = domain();
    // The dispatcher prefixes the buffer with its byte length.
    let total = *(msg as *const u32) as usize;
    let mut cursor = std::slice::from_raw_parts((msg as *const u8).add(4), total);
    let mut index = 0usize;
    while !cursor.is_empty() {
        let value = match crate::remoting::deserialize_value(&mut cursor) {
            Ok(v) => v,
            Err(_) => abort_code(AbortCode::Remoting),
        };
        let word: usize = match value {
            crate::remoting::WireValue::Word(w) => w as usize,
            crate::remoting::WireValue::Float(f) => f.to_bits() as usize,
            crate::remoting::WireValue::Null => 0,
            crate::remoting::WireValue::Str(text) => match domain.create_string(&text) {
                Ok(obj) => obj as usize,
                Err(_) => abort_code(AbortCode::Remoting),
            },
            // Blobs, interfaces and foreign names need class-directed
            // materialisation the embedding performs explicitly.
            _ => abort_code(AbortCode::Remoting),
        };
        *args.add(index) = word as *mut c_void;
        index += 1;
    }
}

// ---------------------------------------------------------------------------
// Vtable registration, frames, debugging
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn _soX_regvtable(_mm: *mut c_void, obj_class: *mut c_void, vtable: *mut *mut c_void) {
    let domain = domain();
    let class_id = class_from_word(obj_class as usize);
    domain.vtables.insert(class_id, vtable as usize);
}

pub unsafe extern "C" fn _soX_pushframe(_mm: *mut c_void, method: *mut c_void) {
    let domain = domain();
    domain.push_frame(MethodId((method as usize - 1) as u32));
}

pub unsafe extern "C" fn _soX_popframe(_mm: *mut c_void) {
    domain().pop_frame();
}

pub unsafe extern "C" fn _soX_pushframe_prf(_mm: *mut c_void, method: *mut c_void) {
    let domain = domain();
    let mid = MethodId((method as usize - 1) as u32);
    domain.push_frame(mid);
    domain.profiler.push(mid);
}

pub unsafe extern "C" fn _soX_popframe_prf(_mm: *mut c_void, method: *mut c_void) {
    let domain = domain();
    let mid = MethodId((method as usize - 1) as u32);
    domain.pop_frame();
    domain.profiler.pop(mid);
}

pub unsafe extern "C" fn _soX_break(_mm: *mut c_void) {
    let domain = domain();
    let watches = domain.debug_data.last().cloned().unwrap_or_default();
    if let Some(callback) = domain.breakpoint_callback.as_mut() {
        callback(&watches);
    }
}

/// Watch registration: `locals` interleaves name string objects with
/// variable addresses.
pub unsafe extern "C" fn _soX_reglocals(_mm: *mut c_void, locals: *mut *mut c_void, count: i32) {
    let domain = domain();
    let mut frame = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let name_obj = *locals.add(i * 2) as *const u8;
        let addr = *locals.add(i * 2 + 1) as usize;
        frame.push((strings::read_string(name_obj), addr));
    }
    domain.debug_data.push(frame);
}

pub unsafe extern "C" fn _soX_unreglocals(_mm: *mut c_void) {
    domain().debug_data.pop();
}

/// Division helper: traps division by zero instead of letting the CPU
/// fault kill the process.
pub unsafe extern "C" fn _so_int_op_divide(a: i32, b: i32) -> i32 {
    if b == 0 {
        abort_code(AbortCode::DivisionByZero);
    }
    a.wrapping_div(b)
}

// ---------------------------------------------------------------------------
// Thunk helpers
// ---------------------------------------------------------------------------

/// Called by a closure-ctor stub: lazily builds the closure class's
/// vtable, allocates the object and stores its env pointer.
pub unsafe extern "C" fn closure_ctor_helper(meta_word: usize, env: *mut u8) -> *mut u8 {
    let domain = domain();
    let ctor_id = MethodId((meta_word - 1) as u32);
    let class_id = domain.metadata.method(ctor_id).declaring_class;
    let class = domain.metadata.class(class_id);
    let Some(MemberRef::Method(invoke)) = class.member("invoke") else {
        abort_code(AbortCode::MissingSymbol);
    };
    let invoke_ptr = {
        let m = domain.metadata.method(invoke);
        let flat = domain.metadata.class(m.declaring_class).flat_name.clone();
        let name = skizo_compiler::mangle::c_method_name(&flat, "invoke");
        domain.backend.symbol(&name).map(|p| p as usize).unwrap_or(0)
    };
    if invoke_ptr == 0 {
        abort_code(AbortCode::MissingSymbol);
    }
    let size = domain.metadata.class(class_id).gc_info.content_size as usize;
    let vtable = domain.thunks.closure_vtable(class_id, invoke_ptr);
    let obj = run_gc_hooks(domain, |memory, md, hooks| {
        memory.allocate(md, size, vtable, hooks)
    });
    if obj.is_null() {
        abort_code(AbortCode::OutOfMemory);
    }
    *(obj.add(4) as *mut usize) = env as usize;
    obj
}

/// Called by a boxed ctor/method entry stub with the method word and the
/// first argument (the payload for ctors, the boxed receiver for
/// methods). Single-granule shapes run here; wider shapes require the
/// x86-32 JIT path.
pub unsafe extern "C" fn boxed_entry_helper(meta_word: usize, first_arg: usize) -> usize {
    let domain = domain();
    let mid = MethodId((meta_word - 1) as u32);
    let method = domain.metadata.method(mid);
    let class_id = method.declaring_class;

    match method.special {
        skizo_metadata::SpecialMethod::BoxedCtor => {
            let size = domain.metadata.class(class_id).gc_info.content_size as usize;
            let Some(&vtable) = domain.vtables.get(&class_id) else {
                abort_code(AbortCode::MissingSymbol);
            };
            let obj = run_gc_hooks(domain, |memory, md, hooks| {
                memory.allocate(md, size, vtable as *mut usize, hooks)
            });
            if obj.is_null() {
                abort_code(AbortCode::OutOfMemory);
            }
            *(obj.add(4) as *mut usize) = first_arg;
            obj as usize
        }
        skizo_metadata::SpecialMethod::BoxedMethod => {
            // Reflection on boxed binary blobs is unsupported by contract.
            let wrapped_special = domain
                .metadata
                .class(class_id)
                .wrapped
                .as_ref()
                .and_then(|w| w.resolved)
                .map(|id| domain.metadata.class(id).special);
            if wrapped_special == Some(SpecialClass::BinaryBlob) {
                abort_code(AbortCode::ValueMismatch);
            }
            let Some(target) = method.base_method else {
                abort_code(AbortCode::MissingSymbol);
            };
            if !domain.metadata.method(target).sig.params.is_empty() {
                abort_code(AbortCode::ValueMismatch);
            }
            let target_ptr = {
                let m = domain.metadata.method(target);
                let flat = domain.metadata.class(m.declaring_class).flat_name.clone();
                let name = skizo_compiler::mangle::c_method_name(&flat, &m.name);
                domain.backend.symbol(&name).map(|p| p as usize).unwrap_or(0)
            };
            if target_ptr == 0 {
                abort_code(AbortCode::MissingSymbol);
            }
            let value_word = *((first_arg as *const u8).add(4) as *const usize);
            let target_fn: unsafe extern "C" fn(usize) -> usize = std::mem::transmute(target_ptr);
            target_fn(value_word)
        }
        _ => abort_code(AbortCode::MissingSymbol),
    }
}

pub fn closure_ctor_helper_ptr() -> usize {
    closure_ctor_helper as usize
}

pub fn boxed_entry_helper_ptr() -> usize {
    boxed_entry_helper as usize
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Registers every `_soX_*` helper with the backend session.
pub fn register_runtime_helpers(backend: &mut dyn CBackend) {
    macro_rules! reg {
        ($name:ident) => {
            backend.add_symbol(stringify!($name), $name as *const c_void);
        };
    }
    reg!(_soX_gc_alloc);
    reg!(_soX_gc_alloc_env);
    reg!(_soX_gc_roots);
    reg!(_soX_static_vt);
    reg!(_soX_findmethod);
    reg!(_soX_findmethod2);
    reg!(_soX_downcast);
    reg!(_soX_is);
    reg!(_soX_unbox);
    reg!(_soX_abort0);
    reg!(_soX_abort_e);
    reg!(_soX_newarray);
    reg!(_soX_zero);
    reg!(_soX_biteq);
    reg!(_soX_cctor);
    reg!(_soX_checktype);
    reg!(_soX_addhandler);
    reg!(_soX_msgsnd_sync);
    reg!(_soX_unpack);
    reg!(_soX_regvtable);
    reg!(_soX_pushframe);
    reg!(_soX_popframe);
    reg!(_soX_pushframe_prf);
    reg!(_soX_popframe_prf);
    reg!(_soX_break);
    reg!(_soX_reglocals);
    reg!(_soX_unreglocals);
    reg!(_so_int_op_divide);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divide_guard() {
        assert_eq!(unsafe { _so_int_op_divide(10, 2) }, 5);
        let result = std::panic::catch_unwind(|| unsafe { _so_int_op_divide(1, 0) });
        assert!(result.is_err());
        assert_eq!(
            crate::domain::last_error().as_deref(),
            Some("DIVISION_BY_ZERO")
        );
    }

    #[test]
    fn test_zero_and_biteq() {
        let mut a = [1u8, 2, 3, 4];
        let b = [0u8; 4];
        unsafe {
            _soX_zero(a.as_mut_ptr() as *mut c_void, 4);
            assert_eq!(a, b);
            assert_eq!(
                _soX_biteq(
                    a.as_mut_ptr() as *mut c_void,
                    b.as_ptr() as *mut c_void,
                    4
                ),
                1
            );
        }
    }

    #[test]
    fn test_registration_covers_emitted_externs() {
        let mut backend = crate::backend::StubBackend::new();
        register_runtime_helpers(&mut backend);
        for name in [
            "_soX_gc_alloc",
            "_soX_findmethod",
            "_soX_abort0",
            "_soX_msgsnd_sync",
            "_soX_reglocals",
            "_so_int_op_divide",
        ] {
            assert!(
                crate::backend::CBackend::symbol(&backend, name).is_some(),
                "missing {}",
                name
            );
        }
    }
}
