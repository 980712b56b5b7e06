//! The domain: an isolated runtime instance bound to one OS thread. It
//! owns the metadata, the GC heap, the thunk manager, the backend session
//! and the remoting endpoints, and drives the whole pipeline from source
//! text to a running entry point.

use crate::activator::Activator;
use crate::backend::{backend_lock, CBackend};
use crate::ecall::ECallCache;
use crate::gc::{GcHooks, MemoryManager};
use crate::profiling::Profiler;
use crate::remoting::{DomainHandleShared, MessageQueue, MESSAGEQUEUE_TIMEOUT};
use crate::security::SecurityManager;
use crate::strings;
use crate::thunks::ThunkManager;
use crate::RuntimeError;
use dashmap::DashMap;
use skizo_compiler::{compile_units, mangle, CompileOptions};
use skizo_diagnostics::abort::DomainAbort;
use skizo_metadata::{
    ClassId, MemberRef, Metadata, MethodId, SpecialClass, SpecialMethod,
};
use skizo_parser::Parser;
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::sync::Arc;

thread_local! {
    static CURRENT_DOMAIN: Cell<*mut Domain> = const { Cell::new(std::ptr::null_mut()) };
    static LAST_ERROR: std::cell::RefCell<Option<String>> = const { std::cell::RefCell::new(None) };
}

/// The message the breakpoint callback receives: one watch per visible
/// local/param, as (name, variable address) pairs.
pub type BreakpointCallback = Box<dyn FnMut(&[(String, usize)]) + Send>;

#[derive(Debug, Clone, Copy)]
pub struct DomainFlags {
    pub stack_trace_enabled: bool,
    pub profiling_enabled: bool,
    pub soft_debugging_enabled: bool,
    pub gc_stats_enabled: bool,
    pub explicit_null_check: bool,
    pub safe_callbacks: bool,
    pub inline_branching: bool,
}

impl Default for DomainFlags {
    fn default() -> Self {
        DomainFlags {
            stack_trace_enabled: false,
            profiling_enabled: false,
            soft_debugging_enabled: false,
            gc_stats_enabled: false,
            explicit_null_check: true,
            safe_callbacks: false,
            inline_branching: true,
        }
    }
}

/// Everything needed to create a domain.
pub struct DomainCreation {
    pub source: String,
    pub module_name: String,
    pub stack_base: usize,
    pub min_gc_threshold: i64,
    pub flags: DomainFlags,
    /// icall name -> native pointer, merged over the built-in set.
    pub icalls: Vec<(String, usize)>,
    pub search_paths: Vec<std::path::PathBuf>,
    pub is_untrusted: bool,
    pub permissions: Vec<String>,
    pub breakpoint_callback: Option<BreakpointCallback>,
    /// Entry point, overridable from the embedding.
    pub main_class: String,
    pub main_method: String,
}

impl DomainCreation {
    pub fn new(source: impl Into<String>) -> Self {
        DomainCreation {
            source: source.into(),
            module_name: "main".to_string(),
            stack_base: 0,
            min_gc_threshold: crate::gc::MIN_GC_THRESHOLD,
            flags: DomainFlags::default(),
            icalls: Vec::new(),
            search_paths: Vec::new(),
            is_untrusted: false,
            permissions: Vec::new(),
            breakpoint_callback: None,
            main_class: "Program".to_string(),
            main_method: "main".to_string(),
        }
    }
}

pub struct Domain {
    pub(crate) metadata: Metadata,
    pub(crate) memory: MemoryManager,
    pub(crate) thunks: ThunkManager,
    pub(crate) backend: Box<dyn CBackend>,
    pub(crate) activator: Activator,
    pub(crate) ecalls: ECallCache,
    pub(crate) security: SecurityManager,
    pub(crate) profiler: Profiler,
    pub(crate) flags: DomainFlags,

    /// Frozen vtable buffers per class, registered by the prolog.
    pub(crate) vtables: HashMap<ClassId, usize>,
    /// Compiled destructors per class.
    pub(crate) dtor_ptrs: HashMap<ClassId, usize>,
    /// Stack-frame stack for stack traces.
    pub(crate) frames: Vec<MethodId>,
    /// Watch frames for soft debugging.
    pub(crate) debug_data: Vec<Vec<(String, usize)>>,
    pub(crate) breakpoint_callback: Option<BreakpointCallback>,

    /// Exported objects, mutated from both producer and consumer threads.
    pub(crate) exported: Arc<DashMap<String, usize>>,
    pub(crate) queue: Arc<MessageQueue>,
    pub(crate) handle: Option<Arc<DomainHandleShared>>,

    pub(crate) unique_id_counter: u64,
    name: String,
}

impl Domain {
    // ------------------------------------------------------------------
    // Creation sequence
    // ------------------------------------------------------------------

    pub fn create(
        mut creation: DomainCreation,
        backend: Box<dyn CBackend>,
    ) -> Result<Box<Domain>, RuntimeError> {
        if !CURRENT_DOMAIN.with(|d| d.get()).is_null() {
            return Err(RuntimeError::ThreadAlreadyBound);
        }

        // Parse the entry source, then drain the import queue.
        let units = parse_source_queue(&creation)?;

        let options = CompileOptions {
            stack_trace_enabled: creation.flags.stack_trace_enabled,
            profiling_enabled: creation.flags.profiling_enabled,
            soft_debugging_enabled: creation.flags.soft_debugging_enabled,
            explicit_null_check: creation.flags.explicit_null_check,
            safe_callbacks: creation.flags.safe_callbacks,
            inline_branching: creation.flags.inline_branching,
            is_trusted: !creation.is_untrusted,
        };
        let compilation = compile_units(&units, &options)?;

        let mut memory = MemoryManager::new();
        memory.set_stack_base(creation.stack_base);
        memory.set_min_gc_threshold(creation.min_gc_threshold);
        memory.enable_gc_stats(creation.flags.gc_stats_enabled);

        let mut domain = Box::new(Domain {
            metadata: compilation.metadata,
            memory,
            thunks: ThunkManager::new(creation.flags.safe_callbacks),
            backend,
            activator: Activator::new(),
            ecalls: ECallCache::new(creation.search_paths.clone()),
            security: SecurityManager::new(!creation.is_untrusted, creation.permissions.clone()),
            profiler: Profiler::new(),
            flags: creation.flags,
            vtables: HashMap::new(),
            dtor_ptrs: HashMap::new(),
            frames: Vec::new(),
            debug_data: Vec::new(),
            breakpoint_callback: creation.breakpoint_callback.take(),
            exported: Arc::new(DashMap::new()),
            queue: MessageQueue::new(),
            handle: None,
            unique_id_counter: 0,
            name: creation.module_name.clone(),
        });

        // Bind to this thread before any helper can run.
        let domain_ptr: *mut Domain = &mut *domain;
        CURRENT_DOMAIN.with(|d| d.set(domain_ptr));

        let result = domain.compile_and_link(&creation, &compilation.c_source, &compilation.string_literals);
        if result.is_err() {
            CURRENT_DOMAIN.with(|d| d.set(std::ptr::null_mut()));
        }
        result?;
        Ok(domain)
    }

    fn compile_and_link(
        &mut self,
        creation: &DomainCreation,
        c_source: &str,
        string_literals: &[String],
    ) -> Result<(), RuntimeError> {
        // Mark classes without static-ctor stages initialised up front;
        // the rest flip when their trapped cctor succeeds.
        let ids: Vec<ClassId> = self.metadata.class_ids().collect();
        for id in ids {
            let class = self.metadata.class(id);
            if class.static_ctor.is_none() && class.enum_items.is_empty() {
                self.metadata.class_mut(id).is_initialized = true;
            }
        }

        // The backend is not reentrant: the whole session runs under the
        // process-wide lock.
        let _guard = backend_lock();

        crate::helpers::register_runtime_helpers(self.backend.as_mut());
        for (name, ptr) in crate::icalls::default_icalls() {
            self.backend.add_symbol(name, ptr);
        }
        for (name, ptr) in &creation.icalls {
            self.backend.add_symbol(name, *ptr as *const c_void);
        }

        self.verify_icalls(creation)?;
        self.resolve_ecalls()?;
        self.register_thunk_symbols()?;

        self.backend
            .compile(c_source)
            .map_err(RuntimeError::Backend)?;

        self.fill_host_tables(string_literals)?;
        self.collect_dtor_pointers();

        // Prolog: registers vtables, static-field roots and runs static
        // ctors (stage 0 and the trapped stage 1).
        if let Some(prolog) = self.backend.symbol("_soX_prolog") {
            let domain_ptr: *mut Domain = self;
            unsafe {
                let prolog: unsafe extern "C" fn(*mut c_void) = std::mem::transmute(prolog);
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    prolog(domain_ptr as *mut c_void)
                }));
                if let Err(payload) = outcome {
                    let message = abort_message(payload);
                    set_last_error(&message);
                    return Err(RuntimeError::Aborted(message));
                }
            }
        }
        Ok(())
    }

    /// Every non-generated native method without an ECall module must be
    /// backed by a registered icall.
    fn verify_icalls(&self, creation: &DomainCreation) -> Result<(), RuntimeError> {
        let user_names: HashSet<&str> =
            creation.icalls.iter().map(|(n, _)| n.as_str()).collect();
        for mid in self.metadata.method_ids() {
            let method = self.metadata.method(mid);
            if method.special != SpecialMethod::Native
                || method.is_compiler_generated
                || method.ecall.module.is_some()
            {
                continue;
            }
            let class = self.metadata.class(method.declaring_class);
            if matches!(
                class.special,
                SpecialClass::Array
                    | SpecialClass::Failable
                    | SpecialClass::MethodClass
                    | SpecialClass::EventClass
            ) {
                continue;
            }
            let symbol = mangle::c_method_name(&class.flat_name, &method.name);
            let registered = self.backend.symbol(&symbol).is_some()
                || user_names.contains(symbol.as_str());
            if !registered {
                return Err(RuntimeError::MissingICall(symbol));
            }
        }
        Ok(())
    }

    /// Resolves each ECall to its native module symbol and registers it
    /// with the backend under the method's C name.
    fn resolve_ecalls(&mut self) -> Result<(), RuntimeError> {
        let mids: Vec<MethodId> = self.metadata.method_ids().collect();
        for mid in mids {
            let method = self.metadata.method(mid);
            let (Some(module), Some(entry)) = (
                method.ecall.module.clone(),
                method.ecall.entry_point.clone(),
            ) else {
                continue;
            };
            let class_flat = self.metadata.class(method.declaring_class).flat_name.clone();
            let method_name = method.name.clone();
            let Some(ptr) = self.ecalls.resolve(&module, &entry) else {
                return Err(RuntimeError::MissingECall(entry, module));
            };
            self.metadata.method_mut(mid).ecall.ptr = Some(ptr);
            let symbol = mangle::c_method_name(&class_flat, &method_name);
            self.backend.add_symbol(&symbol, ptr as *const c_void);
        }
        Ok(())
    }

    /// Closure ctors (and boxed-method entries) are machine code from the
    /// thunk manager, registered as icalls before the C unit compiles.
    fn register_thunk_symbols(&mut self) -> Result<(), RuntimeError> {
        let mids: Vec<MethodId> = self.metadata.method_ids().collect();
        for mid in mids {
            let method = self.metadata.method(mid);
            let special = method.special;
            if !matches!(
                special,
                SpecialMethod::ClosureCtor | SpecialMethod::BoxedCtor | SpecialMethod::BoxedMethod
            ) {
                continue;
            }
            let class_flat = self.metadata.class(method.declaring_class).flat_name.clone();
            let method_c_name = match special {
                SpecialMethod::ClosureCtor => mangle::c_method_name(&class_flat, "ctor"),
                _ => mangle::c_method_name(&class_flat, &method.name),
            };
            let stub = match special {
                SpecialMethod::ClosureCtor => self.thunks.install_closure_ctor_stub(
                    mid.0 as usize + 1,
                    crate::helpers::closure_ctor_helper_ptr(),
                )?,
                SpecialMethod::BoxedCtor | SpecialMethod::BoxedMethod => {
                    self.thunks.install_closure_ctor_stub(
                        mid.0 as usize + 1,
                        crate::helpers::boxed_entry_helper_ptr(),
                    )?
                }
                _ => unreachable!(),
            };
            self.backend
                .add_symbol(&method_c_name, stub as *const c_void);
        }
        Ok(())
    }

    /// Fills `_soX_classes`, `_soX_methods` and `_soX_strlits`, and seeds
    /// vtable slot 0 with class words so literals and allocations work
    /// before the prolog formally registers them.
    fn fill_host_tables(&mut self, string_literals: &[String]) -> Result<(), RuntimeError> {
        unsafe {
            if let Some(classes) = self.backend.symbol("_soX_classes") {
                let table = classes as *mut usize;
                for i in 0..self.metadata.class_count() {
                    *table.add(i) = i + 1;
                }
            }
            if let Some(methods) = self.backend.symbol("_soX_methods") {
                let table = methods as *mut usize;
                for i in 0..self.metadata.method_count() {
                    *table.add(i) = i + 1;
                }
            }

            // Seed emitted vtables (slot 0 = class word) and remember them.
            let ids: Vec<ClassId> = self.metadata.class_ids().collect();
            for id in ids {
                let class = self.metadata.class(id);
                if !class.has_vtable {
                    continue;
                }
                let symbol = format!("_so_vtbl_{}", sanitize(&class.flat_name));
                if let Some(vtable) = self.backend.symbol(&symbol) {
                    let vtable = vtable as *mut usize;
                    *vtable = id.0 as usize + 1;
                    self.vtables.insert(id, vtable as usize);
                }
            }

            // Interned string literals, alive until teardown.
            if let Some(slits) = self.backend.symbol("_soX_strlits") {
                let table = slits as *mut usize;
                for (i, text) in string_literals.iter().enumerate() {
                    let obj = self.create_string(text)?;
                    self.memory.add_string_literal(obj);
                    *table.add(i) = obj as usize;
                }
            }
        }
        Ok(())
    }

    fn collect_dtor_pointers(&mut self) {
        let ids: Vec<ClassId> = self.metadata.class_ids().collect();
        for id in ids {
            let class = self.metadata.class(id);
            if class.instance_dtor.is_none() {
                continue;
            }
            let symbol = format!("_so_{}_dtor", sanitize(&class.flat_name));
            if let Some(ptr) = self.backend.symbol(&symbol) {
                self.dtor_ptrs.insert(id, ptr as usize);
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Resolves and calls the entry point. Any domain abort is caught
    /// here; its message becomes the last error and the result failure.
    pub fn invoke_entry_point(&mut self, creation_main: (&str, &str)) -> bool {
        let (main_class, main_method) = creation_main;
        let Some(class_id) = self.metadata.class_by_nice_name(main_class) else {
            set_last_error(&format!("Entry class '{}' not found", main_class));
            return false;
        };
        let Some(MemberRef::Method(_)) = self.metadata.class(class_id).member(main_method) else {
            set_last_error(&format!(
                "Entry point '{}::{}' not found",
                main_class, main_method
            ));
            return false;
        };
        let symbol = mangle::c_method_name(
            &self.metadata.class(class_id).flat_name,
            main_method,
        );
        let Some(entry) = self.backend.symbol(&symbol) else {
            set_last_error(&format!("Entry symbol '{}' missing", symbol));
            return false;
        };

        unsafe {
            let entry: unsafe extern "C" fn() = std::mem::transmute(entry);
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry()));
            match outcome {
                Ok(()) => true,
                Err(payload) => {
                    let message = abort_message(payload);
                    eprintln!("{}", message);
                    self.print_stack_trace();
                    set_last_error(&message);
                    false
                }
            }
        }
    }

    /// Dispatches incoming message requests from other domains until
    /// `stop` returns true.
    pub fn listen(&mut self, stop: impl Fn() -> bool) {
        let queue = Arc::clone(&self.queue);
        loop {
            if stop() {
                return;
            }
            let Some(message) = queue.dequeue(MESSAGEQUEUE_TIMEOUT) else {
                continue;
            };
            let result = self.dispatch_message(&message);
            message.response.complete(result);
        }
    }

    fn dispatch_message(
        &mut self,
        message: &crate::remoting::DomainMessage,
    ) -> Result<Vec<u8>, String> {
        let Some(object) = self.exported.get(&message.target_name).map(|o| *o) else {
            return Err(format!("Exported object '{}' not found", message.target_name));
        };
        let method = self.metadata.method(message.method);
        let class_flat = self
            .metadata
            .class(method.declaring_class)
            .flat_name
            .clone();
        let stub_name = format!(
            "_soX_srvstub_{}_{}",
            sanitize(&class_flat),
            sanitize(&method.name)
        );
        let Some(stub) = self.backend.symbol(&stub_name) else {
            return Err(format!("Server stub '{}' missing", stub_name));
        };

        let mut ret_buffer = [0u8; 16];
        // _soX_unpack expects a length-prefixed buffer.
        let mut framed = (message.payload.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(&message.payload);
        let payload_ptr = framed.as_ptr();
        unsafe {
            let stub: unsafe extern "C" fn(*mut c_void, *const c_void, *mut c_void) =
                std::mem::transmute(stub);
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                stub(
                    object as *mut c_void,
                    payload_ptr as *const c_void,
                    ret_buffer.as_mut_ptr() as *mut c_void,
                )
            }));
            if let Err(payload) = outcome {
                return Err(abort_message(payload));
            }
        }
        Ok(ret_buffer.to_vec())
    }

    // ------------------------------------------------------------------
    // Embedding surface
    // ------------------------------------------------------------------

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_unique_id(&mut self) -> u64 {
        self.unique_id_counter += 1;
        self.unique_id_counter
    }

    pub fn collect_garbage(&mut self) {
        self.run_gc(false);
    }

    pub(crate) fn run_gc(&mut self, teardown: bool) {
        let dtors = std::mem::take(&mut self.dtor_ptrs);
        let thunks: *mut ThunkManager = &mut self.thunks;
        let mut release = |obj: *mut u8| unsafe { (*thunks).release_closure(obj) };
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };
        self.memory
            .collect_garbage(&self.metadata, &mut hooks, teardown);
        self.dtor_ptrs = dtors;
    }

    pub fn add_gc_root(&mut self, obj: *mut u8) -> bool {
        self.memory.add_gc_root(obj)
    }

    pub fn remove_gc_root(&mut self, obj: *mut u8) -> bool {
        self.memory.remove_gc_root(obj)
    }

    pub fn object_count(&self) -> usize {
        self.memory.pool().object_count()
    }

    /// Allocates a string object on the GC heap.
    pub fn create_string(&mut self, text: &str) -> Result<*mut u8, RuntimeError> {
        let string_class = self
            .metadata
            .class_by_flat_name("string")
            .ok_or_else(|| RuntimeError::MissingICall("string class".to_string()))?;
        let Some(&vtable) = self.vtables.get(&string_class) else {
            return Err(RuntimeError::MissingICall("_so_vtbl_string".to_string()));
        };
        let utf16 = strings::encode_utf16(text);
        let size = strings::string_object_size(utf16.len());

        let dtors = std::mem::take(&mut self.dtor_ptrs);
        let thunks: *mut ThunkManager = &mut self.thunks;
        let mut release = |obj: *mut u8| unsafe { (*thunks).release_closure(obj) };
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };
        let obj = unsafe {
            self.memory
                .allocate(&self.metadata, size, vtable as *mut usize, &mut hooks)
        };
        self.dtor_ptrs = dtors;
        if obj.is_null() {
            return Err(RuntimeError::Aborted("OUT_OF_MEMORY".to_string()));
        }
        unsafe { strings::fill_string_object(obj, &utf16) };
        Ok(obj)
    }

    /// Exports a GC-allocated object so other domains can import it as a
    /// foreign proxy. The export pins the object.
    pub fn export_object(&mut self, name: &str, obj: *mut u8) -> bool {
        if !self.memory.add_gc_root(obj) {
            return false;
        }
        self.exported.insert(name.to_string(), obj as usize);
        true
    }

    pub fn push_frame(&mut self, method: MethodId) {
        self.frames.push(method);
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn print_stack_trace(&self) {
        if !self.flags.stack_trace_enabled || self.frames.is_empty() {
            return;
        }
        eprintln!("stack trace:");
        for &mid in self.frames.iter().rev() {
            eprintln!("  at {}", self.metadata.method_full_name(mid));
        }
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Runs the epilog (static dtors), drains the heap, releases the
    /// backend session, unloads ECall modules and unbinds the thread.
    pub fn close(mut self: Box<Self>) {
        if let Some(epilog) = self.backend.symbol("_soX_epilog") {
            unsafe {
                let epilog: unsafe extern "C" fn() = std::mem::transmute(epilog);
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| epilog()));
            }
        }
        self.run_gc(true);
        self.ecalls.unload_all();
        if let Some(handle) = &self.handle {
            handle.mark_closed();
        }
        CURRENT_DOMAIN.with(|d| d.set(std::ptr::null_mut()));
    }

    /// Aborts the current domain with a message; unwinds to the creation
    /// or entry-point frame.
    pub fn abort(message: impl Into<String>) -> ! {
        let message = message.into();
        set_last_error(&message);
        std::panic::panic_any(DomainAbort::with_message(message))
    }
}

/// Spawns a domain on its own OS thread, runs its entry point, and hands
/// back a handle other domains can send synchronous calls through. The
/// caller blocks until the remote domain is ready (or `DOMAIN_TIMEOUT`).
pub fn create_remote_domain<F>(
    creation: DomainCreation,
    backend_factory: F,
) -> Result<crate::remoting::DomainHandle, RuntimeError>
where
    F: FnOnce() -> Box<dyn CBackend> + Send + 'static,
{
    let shared = DomainHandleShared::new();
    let thread_shared = Arc::clone(&shared);
    let main = (creation.main_class.clone(), creation.main_method.clone());

    let thread = std::thread::spawn(move || {
        let backend = backend_factory();
        match Domain::create(creation, backend) {
            Ok(mut domain) => {
                domain.queue = Arc::clone(&thread_shared.queue);
                domain.handle = Some(Arc::clone(&thread_shared));
                thread_shared.mark_ready();
                let ok = domain.invoke_entry_point((&main.0, &main.1));
                thread_shared.mark_closed();
                domain.close();
                ok
            }
            Err(error) => {
                log::error!("remote domain creation failed: {}", error);
                thread_shared.mark_closed();
                thread_shared.mark_ready();
                false
            }
        }
    });

    let handle = crate::remoting::DomainHandle {
        shared,
        thread: Some(thread),
    };
    handle.shared.wait_ready()?;
    Ok(handle)
}

impl Drop for Domain {
    fn drop(&mut self) {
        let current = CURRENT_DOMAIN.with(|d| d.get());
        if current == self as *mut Domain {
            CURRENT_DOMAIN.with(|d| d.set(std::ptr::null_mut()));
        }
    }
}

// ---------------------------------------------------------------------------
// Thread-level state
// ---------------------------------------------------------------------------

/// The domain bound to the current thread, for the extern helper surface.
///
/// # Safety
/// Only call from a thread that created a domain; the pointer is valid
/// for the domain's lifetime because domains are thread-bound.
pub(crate) unsafe fn current_domain<'a>() -> Option<&'a mut Domain> {
    let ptr = CURRENT_DOMAIN.with(|d| d.get());
    if ptr.is_null() {
        None
    } else {
        Some(&mut *ptr)
    }
}

pub fn set_last_error(message: &str) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(message.to_string()));
}

/// The most recent abort message recorded on this thread. Owned by the
/// domain thread; valid until the domain is torn down.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow().clone())
}

pub(crate) fn abort_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(abort) = payload.downcast_ref::<DomainAbort>() {
        abort.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else {
        "domain aborted".to_string()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn parse_source_queue(creation: &DomainCreation) -> Result<Vec<skizo_ast::Unit>, RuntimeError> {
    let mut queue: VecDeque<(String, String)> =
        VecDeque::from([(creation.module_name.clone(), creation.source.clone())]);
    let mut seen: HashSet<String> = HashSet::from([creation.module_name.clone()]);
    let mut units = Vec::new();

    while let Some((module, text)) = queue.pop_front() {
        let unit = Parser::new(&module, &text)?.parse_unit()?;
        for import in &unit.imports {
            if !seen.insert(import.clone()) {
                continue;
            }
            let mut found = false;
            for dir in &creation.search_paths {
                let path = dir.join(format!("{}.skizo", import));
                if let Ok(text) = std::fs::read_to_string(&path) {
                    queue.push_back((import.clone(), text));
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(RuntimeError::MissingImport(import.clone()));
            }
        }
        units.push(unit);
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;

    #[test]
    fn test_domain_compiles_and_binds_thread() {
        let creation = DomainCreation::new("class Program { static method main { print 1+2; } }");
        let domain = Domain::create(creation, Box::new(StubBackend::new())).unwrap();
        assert!(domain.metadata().class_by_nice_name("Program").is_some());

        // A second domain on the same thread is rejected.
        let creation2 = DomainCreation::new("class Program { static method main { } }");
        let err = Domain::create(creation2, Box::new(StubBackend::new()));
        assert!(matches!(err, Err(RuntimeError::ThreadAlreadyBound)));

        domain.close();

        // After closing, the thread can host a new domain.
        let creation3 = DomainCreation::new("class Program { static method main { } }");
        let domain3 = Domain::create(creation3, Box::new(StubBackend::new())).unwrap();
        domain3.close();
    }

    #[test]
    fn test_missing_icall_detected() {
        let creation =
            DomainCreation::new("class A { native method mystery:int; } class Program { static method main { } }");
        let err = Domain::create(creation, Box::new(StubBackend::new()));
        match err {
            Err(RuntimeError::MissingICall(name)) => assert_eq!(name, "_so_A_mystery"),
            other => panic!("expected missing icall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_import_reported() {
        let creation = DomainCreation::new("import nowhere; class Program { static method main { } }");
        let err = Domain::create(creation, Box::new(StubBackend::new()));
        assert!(matches!(err, Err(RuntimeError::MissingImport(_))));
    }

    #[test]
    fn test_abort_sets_last_error() {
        let result = std::panic::catch_unwind(|| {
            Domain::abort("NULLDEREFERENCE");
        });
        assert!(result.is_err());
        assert_eq!(
            last_error().as_deref(),
            Some("NULLDEREFERENCE")
        );
    }

    #[test]
    fn test_entry_point_lookup_failure() {
        let creation = DomainCreation::new("class NotProgram { static method main { } }");
        let mut domain = Domain::create(creation, Box::new(StubBackend::new())).unwrap();
        assert!(!domain.invoke_entry_point(("Program", "main")));
        assert!(last_error().unwrap().contains("Program"));
        domain.close();
    }
}
