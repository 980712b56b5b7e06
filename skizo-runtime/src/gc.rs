//! The memory manager: a precise-roots, conservative-stack, mark-sweep
//! collector over the pool allocator.
//!
//! An object's header is a single word holding the pointer to its vtable;
//! slot 0 of the vtable is the class word (class id + 1). The least
//! significant bit of the header word is stolen as the mark bit for the
//! duration of a collection and cleared before user code can observe it.

use crate::pool::PoolAllocator;
use skizo_metadata::{ClassId, Metadata, SpecialClass, ARRAY_FIRST_ITEM_OFFSET};
use std::collections::HashMap;

/// Initial (and minimum) collection threshold in bytes.
pub const MIN_GC_THRESHOLD: i64 = 1024 * 1024;

/// A destructor compiled by the backend.
pub type DtorFn = unsafe extern "C" fn(*mut u8);

/// Per-collection context the domain supplies: compiled destructors and
/// the hook that releases a swept closure's trampoline.
pub struct GcHooks<'a> {
    pub dtors: &'a HashMap<ClassId, usize>,
    pub release_closure: &'a mut dyn FnMut(*mut u8),
}

struct RootHolder {
    object: *mut u8,
}

pub struct MemoryManager {
    pool: PoolAllocator,
    /// Locations (not objects!) registered as precise roots.
    roots: Vec<*mut *mut u8>,
    root_holders: Vec<Box<RootHolder>>,
    heap_start: usize,
    heap_end: usize,
    stack_base: usize,
    allocd_memory: i64,
    min_gc_threshold: i64,
    floor_gc_threshold: i64,
    custom_memory_pressure: i64,
    destructables: Vec<*mut u8>,
    string_literals: Vec<*mut u8>,
    /// Destructors cannot re-enter the collector.
    disable_gc: bool,
    dtors_enabled: bool,
    gc_stats_enabled: bool,
    last_gc_time_ms: u64,
    /// Hook for a built-in map container with per-instance GC shape.
    map_class: Option<ClassId>,
}

const MARK_BIT: usize = 1;

#[inline]
unsafe fn header_word(obj: *mut u8) -> usize {
    *(obj as *mut usize)
}

#[inline]
unsafe fn set_header_word(obj: *mut u8, word: usize) {
    *(obj as *mut usize) = word;
}

#[inline]
unsafe fn is_marked(obj: *mut u8) -> bool {
    header_word(obj) & MARK_BIT != 0
}

impl MemoryManager {
    pub fn new() -> Self {
        MemoryManager {
            pool: PoolAllocator::new(),
            roots: Vec::new(),
            root_holders: Vec::new(),
            heap_start: usize::MAX,
            heap_end: 0,
            stack_base: 0,
            allocd_memory: 0,
            min_gc_threshold: MIN_GC_THRESHOLD,
            floor_gc_threshold: MIN_GC_THRESHOLD,
            custom_memory_pressure: 0,
            destructables: Vec::new(),
            string_literals: Vec::new(),
            disable_gc: false,
            dtors_enabled: true,
            gc_stats_enabled: false,
            last_gc_time_ms: 0,
            map_class: None,
        }
    }

    pub fn set_stack_base(&mut self, base: usize) {
        self.stack_base = base;
    }

    pub fn set_min_gc_threshold(&mut self, value: i64) {
        self.min_gc_threshold = value.max(1);
        self.floor_gc_threshold = self.min_gc_threshold;
    }

    pub fn enable_gc_stats(&mut self, value: bool) {
        self.gc_stats_enabled = value;
    }

    pub fn set_map_class(&mut self, value: Option<ClassId>) {
        self.map_class = value;
    }

    pub fn pool(&self) -> &PoolAllocator {
        &self.pool
    }

    pub fn allocated_bytes(&self) -> i64 {
        self.allocd_memory
    }

    pub fn threshold(&self) -> i64 {
        self.min_gc_threshold
    }

    pub fn last_gc_time_ms(&self) -> u64 {
        self.last_gc_time_ms
    }

    /// The class behind an object, read from vtable slot 0.
    ///
    /// # Safety
    /// `obj` must be a live object with a valid header word.
    pub unsafe fn class_of(obj: *mut u8) -> ClassId {
        let vtable = (header_word(obj) & !MARK_BIT) as *const usize;
        ClassId((*vtable - 1) as u32)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates a zeroed object with the given vtable. Returns null if
    /// the class's static ctor previously aborted (the caller raises
    /// TYPE_INITIALIZATION_ERROR) or on memory exhaustion.
    ///
    /// # Safety
    /// `vtable` must point at a frozen vtable whose slot 0 is a valid
    /// class word for `md`.
    pub unsafe fn allocate(
        &mut self,
        md: &Metadata,
        size: usize,
        vtable: *mut usize,
        hooks: &mut GcHooks<'_>,
    ) -> *mut u8 {
        let used = self.allocd_memory + self.custom_memory_pressure;
        if used > self.min_gc_threshold {
            if self.gc_stats_enabled {
                log::info!(
                    "[GC reason] alloc'd: {}; pressure: {}; threshold: {}",
                    self.allocd_memory,
                    self.custom_memory_pressure,
                    self.min_gc_threshold
                );
            }
            self.collect_garbage(md, hooks, false);

            let used = self.allocd_memory + self.custom_memory_pressure;
            if used > (self.min_gc_threshold as f64 * 0.75) as i64 {
                self.min_gc_threshold = used + used / 2;
            } else if used < self.min_gc_threshold / 2 {
                self.min_gc_threshold =
                    (self.min_gc_threshold / 2).max(self.floor_gc_threshold);
            }
            if self.gc_stats_enabled {
                log::info!("GC threshold set to: {}", self.min_gc_threshold);
            }
        }

        let class_id = ClassId((*vtable - 1) as u32);
        let class = md.class(class_id);
        if !class.is_initialized {
            return std::ptr::null_mut();
        }

        let obj = self.pool.allocate(size);
        if obj.is_null() {
            return obj;
        }

        if class.special == SpecialClass::Array {
            self.allocd_memory += size as i64;
        } else {
            self.allocd_memory += class.gc_info.content_size.max(size as u32) as i64;
        }

        self.heap_start = self.heap_start.min(obj as usize);
        self.heap_end = self.heap_end.max(obj as usize + size);

        set_header_word(obj, vtable as usize);
        obj
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Registers locations that hold references (static fields).
    pub fn add_gc_roots(&mut self, locations: &[*mut *mut u8]) {
        self.roots.extend_from_slice(locations);
    }

    /// Pins an object through a dedicated holder until removed.
    pub fn add_gc_root(&mut self, obj: *mut u8) -> bool {
        if !self.is_valid_object(obj) {
            return false;
        }
        let mut holder = Box::new(RootHolder { object: obj });
        let location: *mut *mut u8 = &mut holder.object;
        self.root_holders.push(holder);
        self.roots.push(location);
        true
    }

    pub fn remove_gc_root(&mut self, obj: *mut u8) -> bool {
        let Some(index) = self.root_holders.iter().position(|h| h.object == obj) else {
            return false;
        };
        let holder = self.root_holders.remove(index);
        let location: *const *mut u8 = &holder.object;
        self.roots.retain(|&r| r as *const *mut u8 != location);
        true
    }

    /// String literals stay alive until domain teardown.
    pub fn add_string_literal(&mut self, literal: *mut u8) {
        self.string_literals.push(literal);
    }

    pub fn string_literals(&self) -> &[*mut u8] {
        &self.string_literals
    }

    pub fn add_memory_pressure(&mut self, amount: i64) {
        if amount < 0 {
            return;
        }
        self.custom_memory_pressure = self.custom_memory_pressure.saturating_add(amount);
    }

    pub fn remove_memory_pressure(&mut self, amount: i64) {
        if amount < 0 {
            return;
        }
        // Saturates at zero; careless user code never drives it negative.
        self.custom_memory_pressure = (self.custom_memory_pressure - amount).max(0);
    }

    /// Registers the GC map locations of a static value-type field and
    /// zeroes its storage (`_soX_static_vt`).
    pub unsafe fn init_static_value_type_field(
        &mut self,
        md: &Metadata,
        obj: *mut u8,
        class_id: ClassId,
    ) {
        let gc_info = &md.class(class_id).gc_info;
        std::ptr::write_bytes(obj, 0, gc_info.content_size as usize);
        for &offset in &gc_info.gc_map {
            self.roots.push(obj.add(offset as usize) as *mut *mut u8);
        }
    }

    /// Fast validity check: alignment, heap bounds, then the allocator's
    /// precise cell test. Fails for string literals, which live in their
    /// own side list.
    pub fn is_valid_object(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        if addr == 0 || addr % std::mem::size_of::<usize>() != 0 {
            return false;
        }
        if addr < self.heap_start || addr >= self.heap_end {
            return false;
        }
        self.pool.is_valid_pointer(ptr)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Forces a collection. Ignored inside destructors. With
    /// `teardown = true` all roots are ignored and everything is swept;
    /// if destructors created new objects the sweep re-runs with
    /// destructors disabled, guaranteeing termination.
    pub fn collect_garbage(&mut self, md: &Metadata, hooks: &mut GcHooks<'_>, teardown: bool) {
        if self.disable_gc {
            return;
        }
        let started = std::time::Instant::now();
        if self.gc_stats_enabled {
            log::info!(
                "Memory before GC: {} | objects before GC: {}",
                self.allocd_memory,
                self.pool.object_count()
            );
        }

        // Mark phase (skipped entirely on teardown).
        if !teardown {
            let roots = self.roots.clone();
            for location in roots {
                // Roots are locations holding the variables, so deref once.
                let obj = unsafe { *location };
                self.mark(md, obj);
            }
            let literals = self.string_literals.clone();
            for literal in literals {
                self.mark(md, literal);
            }
            self.scan_stack(md);
        }

        self.dtors_enabled = true;
        loop {
            self.sweep(md, hooks);

            // Literal marks are reset so their vtables stay usable.
            for &literal in &self.string_literals {
                unsafe { set_header_word(literal, header_word(literal) & !MARK_BIT) };
            }

            // Destructor phase: each destructable runs exactly once with
            // collection disabled, then its cell is freed.
            let destructables = std::mem::take(&mut self.destructables);
            self.disable_gc = true;
            for obj in destructables {
                unsafe {
                    let class_id = Self::class_of(obj);
                    if md.class(class_id).special == SpecialClass::MethodClass {
                        (hooks.release_closure)(obj);
                    }
                    if let Some(&dtor) = hooks.dtors.get(&class_id) {
                        let dtor: DtorFn = std::mem::transmute(dtor);
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || dtor(obj),
                        ));
                        // Aborts escaping a destructor are swallowed.
                        if result.is_err() {
                            log::warn!("destructor aborted; continuing sweep");
                        }
                    }
                }
                self.pool.free(obj);
            }
            self.disable_gc = false;

            if teardown && self.pool.object_count() > self.string_literal_live_count() {
                if self.dtors_enabled {
                    // Dtors may have created new garbage; re-run without
                    // them so the heap drains.
                    self.dtors_enabled = false;
                    continue;
                }
            }
            break;
        }

        if teardown {
            let literals = std::mem::take(&mut self.string_literals);
            for literal in literals {
                self.pool.free(literal);
            }
        }

        self.last_gc_time_ms = started.elapsed().as_millis() as u64;
        if self.gc_stats_enabled {
            log::info!(
                "Memory after GC: {}, time: {}ms | objects after GC: {}",
                self.allocd_memory,
                self.last_gc_time_ms,
                self.pool.object_count()
            );
        }
    }

    fn string_literal_live_count(&self) -> usize {
        self.string_literals.len()
    }

    /// Marking walks the object graph guided by each class's GC map; the
    /// work list keeps deep object chains off the native stack.
    fn mark(&mut self, md: &Metadata, obj: *mut u8) {
        let mut work = vec![obj];
        while let Some(obj) = work.pop() {
            if obj.is_null() {
                continue;
            }
            unsafe {
                if is_marked(obj) {
                    continue;
                }
                let class_id = Self::class_of(obj);
                set_header_word(obj, header_word(obj) | MARK_BIT);

                let class = md.class(class_id);
                if class.special == SpecialClass::Array {
                    // Arrays apply the wrapped class's GC map per element.
                    let Some(wrapped) = class.wrapped.as_ref() else {
                        continue;
                    };
                    let length = *(obj.add(4) as *const i32) as usize;
                    let base = obj.add(ARRAY_FIRST_ITEM_OFFSET as usize);
                    let elem_is_ref = crate::helpers::typeref_is_reference(md, wrapped);
                    if elem_is_ref {
                        for i in 0..length {
                            let child = *(base.add(i * std::mem::size_of::<usize>())
                                as *const *mut u8);
                            work.push(child);
                        }
                    } else if let Some(elem_class) = wrapped.resolved {
                        let info = &md.class(elem_class).gc_info;
                        if !info.gc_map.is_empty() {
                            let stride = info.size_for_use as usize;
                            for i in 0..length {
                                for &off in &info.gc_map {
                                    let child = *(base.add(i * stride + off as usize)
                                        as *const *mut u8);
                                    work.push(child);
                                }
                            }
                        }
                    }
                } else if Some(class_id) == self.map_class {
                    // Reserved for a built-in map container with an
                    // embedded backing table; none is registered today.
                } else {
                    for &offset in &class.gc_info.gc_map {
                        let child = *(obj.add(offset as usize) as *const *mut u8);
                        work.push(child);
                    }
                }
            }
        }
    }

    /// Conservative scan between the stored stack base and a local in
    /// this frame. Assumes a downward-growing stack and aligned pointers.
    fn scan_stack(&mut self, md: &Metadata) {
        if self.stack_base == 0 {
            return;
        }
        let local_marker: usize = 0;
        let low = (&local_marker as *const usize) as usize;
        let high = self.stack_base;
        if low >= high {
            return;
        }
        let mut addr = low;
        while addr + std::mem::size_of::<usize>() <= high {
            let candidate = unsafe { *(addr as *const *mut u8) };
            if self.is_valid_object(candidate) {
                self.mark(md, candidate);
            }
            addr += std::mem::size_of::<usize>();
        }
    }

    /// Sweep: marked cells survive with their mark cleared; unmarked
    /// cells are freed immediately, or queued for the destructor phase
    /// when their class has a dtor (or is a closure owning a thunk).
    fn sweep(&mut self, md: &Metadata, _hooks: &mut GcHooks<'_>) {
        let mut freed_bytes: i64 = 0;
        let mut destructables = std::mem::take(&mut self.destructables);
        let dtors_enabled = self.dtors_enabled;
        let string_literals: Vec<usize> =
            self.string_literals.iter().map(|&p| p as usize).collect();

        self.pool.enumerate(|pool, obj| unsafe {
            if string_literals.contains(&(obj as usize)) {
                return;
            }
            if is_marked(obj) {
                set_header_word(obj, header_word(obj) & !MARK_BIT);
                return;
            }
            let class_id = Self::class_of(obj);
            let class = md.class(class_id);

            if class.special == SpecialClass::Array {
                let item = class
                    .wrapped
                    .as_ref()
                    .and_then(|w| w.resolved)
                    .map(|id| md.class(id).gc_info.size_for_use)
                    .unwrap_or(std::mem::size_of::<usize>() as u32);
                let length = *(obj.add(4) as *const i32) as i64;
                freed_bytes += ARRAY_FIRST_ITEM_OFFSET as i64 + length * item as i64;
            } else {
                freed_bytes += class.gc_info.content_size as i64;
            }

            // Closures own a generated thunk that must be released even
            // without a user dtor.
            let needs_dtor_phase = (dtors_enabled && class.instance_dtor.is_some())
                || class.special == SpecialClass::MethodClass;
            if needs_dtor_phase {
                destructables.push(obj);
            } else {
                pool.free(obj);
            }
        });

        self.allocd_memory = (self.allocd_memory - freed_bytes).max(0);
        self.destructables = destructables;
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for MemoryManager {}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_metadata::Class;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_dtor(_obj: *mut u8) {
        DTOR_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn no_release(_: *mut u8) {}

    /// Builds a metadata universe with one plain class and one class that
    /// holds a single reference at offset 4.
    fn test_metadata() -> (Metadata, ClassId, ClassId) {
        let mut md = Metadata::new();
        let plain_id = md.next_class_id();
        let mut plain = Class::new(plain_id, "Plain");
        plain.is_initialized = true;
        plain.has_vtable = true;
        plain.gc_info.content_size = 64;
        plain.gc_info.size_for_use = 4;
        let plain_id = md.register_class(plain).unwrap();

        let holder_id = md.next_class_id();
        let mut holder = Class::new(holder_id, "Holder");
        holder.is_initialized = true;
        holder.has_vtable = true;
        holder.gc_info.content_size = 8;
        holder.gc_info.size_for_use = 4;
        holder.gc_info.gc_map = vec![4];
        let holder_id = md.register_class(holder).unwrap();

        (md, plain_id, holder_id)
    }

    fn vtable_for(id: ClassId) -> Box<[usize; 4]> {
        Box::new([id.0 as usize + 1, 0, 0, 0])
    }

    #[test]
    fn test_unreachable_objects_are_swept() {
        let (md, plain_id, _) = test_metadata();
        let mut mm = MemoryManager::new();
        let mut vt = vtable_for(plain_id);
        let dtors = HashMap::new();
        let mut release = no_release;
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };

        for _ in 0..100 {
            let obj = unsafe { mm.allocate(&md, 64, vt.as_mut_ptr(), &mut hooks) };
            assert!(!obj.is_null());
        }
        assert_eq!(mm.pool().object_count(), 100);
        // No roots, no stack base: everything is garbage.
        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(mm.pool().object_count(), 0);
        assert_eq!(mm.allocated_bytes(), 0);
    }

    #[test]
    fn test_rooted_objects_survive_and_release() {
        let (md, plain_id, _) = test_metadata();
        let mut mm = MemoryManager::new();
        let mut vt = vtable_for(plain_id);
        let dtors = HashMap::new();
        let mut release = no_release;
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };

        let obj = unsafe { mm.allocate(&md, 64, vt.as_mut_ptr(), &mut hooks) };
        assert!(mm.add_gc_root(obj));

        mm.collect_garbage(&md, &mut hooks, false);
        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(mm.pool().object_count(), 1);
        assert!(mm.is_valid_object(obj));
        // The mark bit never leaks to user-visible headers.
        unsafe { assert_eq!(header_word(obj) & MARK_BIT, 0) };

        assert!(mm.remove_gc_root(obj));
        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(mm.pool().object_count(), 0);
    }

    #[test]
    fn test_reference_fields_keep_children_alive() {
        let (md, plain_id, holder_id) = test_metadata();
        let mut mm = MemoryManager::new();
        let mut plain_vt = vtable_for(plain_id);
        let mut holder_vt = vtable_for(holder_id);
        let dtors = HashMap::new();
        let mut release = no_release;
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };

        let child = unsafe { mm.allocate(&md, 64, plain_vt.as_mut_ptr(), &mut hooks) };
        let holder = unsafe { mm.allocate(&md, 8, holder_vt.as_mut_ptr(), &mut hooks) };
        unsafe { *(holder.add(4) as *mut *mut u8) = child };
        assert!(mm.add_gc_root(holder));

        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(mm.pool().object_count(), 2);
        assert!(mm.is_valid_object(child));
    }

    #[test]
    fn test_destructor_runs_exactly_once() {
        let (md, plain_id, _) = test_metadata();
        // Give Plain a destructor.
        let mut md = md;
        let mid = md.next_method_id();
        let m = skizo_metadata::Method::new(
            mid,
            plain_id,
            skizo_metadata::MethodKind::Dtor,
            String::new(),
        );
        let mid = md.add_method(m);
        md.class_mut(plain_id).instance_dtor = Some(mid);

        let mut mm = MemoryManager::new();
        let mut vt = vtable_for(plain_id);
        let mut dtors = HashMap::new();
        dtors.insert(plain_id, counting_dtor as usize);
        let mut release = no_release;
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };

        DTOR_RUNS.store(0, Ordering::SeqCst);
        let _obj = unsafe { mm.allocate(&md, 64, vt.as_mut_ptr(), &mut hooks) };
        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(mm.pool().object_count(), 0);

        // A second collection must not run it again.
        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_ignores_roots() {
        let (md, plain_id, _) = test_metadata();
        let mut mm = MemoryManager::new();
        let mut vt = vtable_for(plain_id);
        let dtors = HashMap::new();
        let mut release = no_release;
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };

        let obj = unsafe { mm.allocate(&md, 64, vt.as_mut_ptr(), &mut hooks) };
        assert!(mm.add_gc_root(obj));
        mm.collect_garbage(&md, &mut hooks, true);
        assert_eq!(mm.pool().object_count(), 0);
    }

    #[test]
    fn test_gc_stress_threshold_stabilises() {
        let (md, plain_id, _) = test_metadata();
        let mut mm = MemoryManager::new();
        mm.set_min_gc_threshold(64 * 1024);
        let mut vt = vtable_for(plain_id);
        let dtors = HashMap::new();
        let mut release = no_release;
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };

        // A million short-lived 64-byte objects.
        for _ in 0..1_000_000u32 {
            let obj = unsafe { mm.allocate(&md, 64, vt.as_mut_ptr(), &mut hooks) };
            assert!(!obj.is_null());
        }
        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(mm.pool().object_count(), 0);
        // The adaptive threshold stays within sane bounds of the floor.
        assert!(mm.threshold() >= 64 * 1024);
        assert!(mm.threshold() <= 4 * 1024 * 1024, "threshold {}", mm.threshold());
    }

    #[test]
    fn test_memory_pressure_saturates() {
        let mut mm = MemoryManager::new();
        mm.add_memory_pressure(100);
        mm.remove_memory_pressure(500);
        // Never underflows.
        mm.add_memory_pressure(50);
        assert_eq!(mm.custom_memory_pressure, 50);
    }

    #[test]
    fn test_array_marking_keeps_elements() {
        let (mut md, plain_id, _) = test_metadata();
        // An array-of-Plain class.
        let arr_id = md.next_class_id();
        let mut arr = Class::new(arr_id, "0Array_Plain");
        arr.is_initialized = true;
        arr.has_vtable = true;
        arr.special = SpecialClass::Array;
        let mut wrapped = skizo_metadata::TypeRef::object("Plain");
        wrapped.resolved = Some(plain_id);
        arr.wrapped = Some(wrapped);
        arr.gc_info.content_size = ARRAY_FIRST_ITEM_OFFSET;
        arr.gc_info.size_for_use = 4;
        let arr_id = md.register_class(arr).unwrap();

        let mut mm = MemoryManager::new();
        let mut plain_vt = vtable_for(plain_id);
        let mut arr_vt = vtable_for(arr_id);
        let dtors = HashMap::new();
        let mut release = no_release;
        let mut hooks = GcHooks {
            dtors: &dtors,
            release_closure: &mut release,
        };

        let elem = unsafe { mm.allocate(&md, 64, plain_vt.as_mut_ptr(), &mut hooks) };
        let array_size = ARRAY_FIRST_ITEM_OFFSET as usize + 2 * std::mem::size_of::<usize>();
        let array = unsafe { mm.allocate(&md, array_size, arr_vt.as_mut_ptr(), &mut hooks) };
        unsafe {
            *(array.add(4) as *mut i32) = 2;
            *(array.add(ARRAY_FIRST_ITEM_OFFSET as usize) as *mut *mut u8) = elem;
        }
        assert!(mm.add_gc_root(array));

        mm.collect_garbage(&md, &mut hooks, false);
        assert_eq!(mm.pool().object_count(), 2);
        assert!(mm.is_valid_object(elem));
    }
}
