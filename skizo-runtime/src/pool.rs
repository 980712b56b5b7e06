//! The GC heap allocator. Each object size gets its own pool of fixed-size
//! arenas with an intrusive free list. The key property: any pointer can
//! be checked for validity quickly (arena membership, cell alignment and
//! in-use state), which the conservative stack scan depends on. The heap
//! is local to its domain, so no synchronisation is needed.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{HashMap, HashSet};

const TARGET_ARENA_SIZE: usize = 128 * 1024;
const MIN_OBJECT_COUNT_PER_ARENA: usize = 64;
/// 16 bytes granularity.
const GRANULARITY: usize = 16;

/// An arena is a contiguous block where fixed-size allocations are made.
/// All elements are prepended an `ElementHeader`.
#[repr(C)]
struct ArenaHeader {
    element_size: usize,
    element_count: usize,
    start: *mut u8,
    end: *mut u8,
}

/// An "element" is the allocated object plus its header. A non-null pool
/// pointer marks the element in use; a free element threads the pool's
/// free list through `next`.
#[repr(C)]
struct ElementHeader {
    next: *mut ElementHeader,
    pool: *mut Pool,
}

struct Pool {
    element_size: usize,
    free_list: *mut ElementHeader,
}

const fn align_up(sz: usize) -> usize {
    if sz % GRANULARITY != 0 {
        sz + (GRANULARITY - sz % GRANULARITY)
    } else {
        sz
    }
}

const fn element_size_for(object_size: usize) -> usize {
    align_up(align_up(std::mem::size_of::<ElementHeader>()) + object_size)
}

fn is_large_object(element_size: usize) -> bool {
    element_size > TARGET_ARENA_SIZE || TARGET_ARENA_SIZE / element_size < MIN_OBJECT_COUNT_PER_ARENA
}

unsafe fn object_start(header: *mut ElementHeader) -> *mut u8 {
    (header as *mut u8).add(align_up(std::mem::size_of::<ElementHeader>()))
}

unsafe fn element_header(object: *mut u8) -> *mut ElementHeader {
    object.sub(align_up(std::mem::size_of::<ElementHeader>())) as *mut ElementHeader
}

pub struct PoolAllocator {
    pools: HashMap<usize, Box<Pool>>,
    arenas: Vec<*mut ArenaHeader>,
    /// Frees requested during heap enumeration are applied after the walk.
    pending_free: Vec<*mut u8>,
    /// Large objects live outside the arenas, tracked by address.
    large_objects: HashSet<usize>,
    large_layouts: HashMap<usize, Layout>,
    object_count: usize,
    is_enumerating: bool,
}

impl PoolAllocator {
    pub fn new() -> Self {
        PoolAllocator {
            pools: HashMap::new(),
            arenas: Vec::new(),
            pending_free: Vec::new(),
            large_objects: HashSet::new(),
            large_layouts: HashMap::new(),
            object_count: 0,
            is_enumerating: false,
        }
    }

    /// Allocates a zeroed block. Returns null only on system allocation
    /// failure; the caller aborts the domain with OUT_OF_MEMORY.
    pub fn allocate(&mut self, object_size: usize) -> *mut u8 {
        let element_size = element_size_for(object_size);

        if is_large_object(element_size) {
            let layout = match Layout::from_size_align(object_size.max(1), GRANULARITY) {
                Ok(l) => l,
                Err(_) => return std::ptr::null_mut(),
            };
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return ptr;
            }
            self.large_objects.insert(ptr as usize);
            self.large_layouts.insert(ptr as usize, layout);
            self.object_count += 1;
            return ptr;
        }

        // Fetch or create the pool for this element size.
        if !self.pools.contains_key(&element_size) {
            self.pools.insert(
                element_size,
                Box::new(Pool {
                    element_size,
                    free_list: std::ptr::null_mut(),
                }),
            );
        }

        // Refill from a fresh arena when the free list drains.
        let needs_arena = self
            .pools
            .get(&element_size)
            .map(|p| p.free_list.is_null())
            .unwrap_or(true);
        if needs_arena {
            let arena = match self.allocate_arena(element_size) {
                Some(a) => a,
                None => return std::ptr::null_mut(),
            };
            let pool = self.pools.get_mut(&element_size).expect("pool just created");
            unsafe {
                let mut cursor = (*arena).start;
                for _ in 0..(*arena).element_count {
                    let element = cursor as *mut ElementHeader;
                    (*element).next = pool.free_list;
                    (*element).pool = std::ptr::null_mut();
                    pool.free_list = element;
                    cursor = cursor.add(element_size);
                }
            }
        }

        let pool = self.pools.get_mut(&element_size).expect("pool exists");
        let pool_ptr: *mut Pool = pool.as_mut();
        unsafe {
            let element = pool.free_list;
            pool.free_list = (*element).next;
            // A non-null pool pointer marks the element allocated.
            (*element).pool = pool_ptr;
            let obj = object_start(element);
            std::ptr::write_bytes(obj, 0, object_size);
            self.object_count += 1;
            obj
        }
    }

    fn allocate_arena(&mut self, element_size: usize) -> Option<*mut ArenaHeader> {
        let element_count = TARGET_ARENA_SIZE / element_size;
        let header_size = align_up(std::mem::size_of::<ArenaHeader>());
        let full_size = header_size + element_count * element_size;
        let layout = Layout::from_size_align(full_size, GRANULARITY).ok()?;
        unsafe {
            let raw = alloc_zeroed(layout);
            if raw.is_null() {
                return None;
            }
            let arena = raw as *mut ArenaHeader;
            (*arena).element_size = element_size;
            (*arena).element_count = element_count;
            (*arena).start = raw.add(header_size);
            (*arena).end = raw.add(header_size + element_count * element_size);
            self.arenas.push(arena);
            Some(arena)
        }
    }

    /// Returns the cell to its pool's free list (or releases a large
    /// object). During heap enumeration the free is deferred.
    pub fn free(&mut self, ptr: *mut u8) {
        if self.is_enumerating {
            self.pending_free.push(ptr);
            return;
        }

        if self.large_objects.remove(&(ptr as usize)) {
            if let Some(layout) = self.large_layouts.remove(&(ptr as usize)) {
                unsafe { dealloc(ptr, layout) };
            }
            self.object_count -= 1;
            return;
        }

        unsafe {
            let element = element_header(ptr);
            let pool = (*element).pool;
            debug_assert!(!pool.is_null(), "double free of pooled object");
            (*element).next = (*pool).free_list;
            (*pool).free_list = element;
            // Also marks the element as deallocated.
            (*element).pool = std::ptr::null_mut();
        }
        self.object_count -= 1;
    }

    /// True iff the pointer lies inside some arena at a correct cell
    /// boundary and the cell is in use, or is a tracked large object.
    pub fn is_valid_pointer(&self, object: *const u8) -> bool {
        unsafe {
            let element = element_header(object as *mut u8) as *const u8;
            for &arena in &self.arenas {
                let start = (*arena).start as *const u8;
                let end = (*arena).end as *const u8;
                if element >= start && element < end {
                    let offset = element as usize - start as usize;
                    if offset % (*arena).element_size != 0 {
                        return false;
                    }
                    return !(*(element as *const ElementHeader)).pool.is_null();
                }
            }
        }
        self.large_objects.contains(&(object as usize))
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Walks every in-use cell, then every large object. Frees requested
    /// by the callback are deferred and applied after the walk.
    pub fn enumerate(&mut self, mut callback: impl FnMut(&mut Self, *mut u8)) {
        self.is_enumerating = true;

        let arenas = self.arenas.clone();
        for arena in arenas {
            unsafe {
                let element_size = (*arena).element_size;
                let mut cursor = (*arena).start;
                let end = (*arena).end;
                while cursor < end {
                    let element = cursor as *mut ElementHeader;
                    if !(*element).pool.is_null() {
                        callback(self, object_start(element));
                    }
                    cursor = cursor.add(element_size);
                }
            }
        }
        let large: Vec<usize> = self.large_objects.iter().copied().collect();
        for obj in large {
            callback(self, obj as *mut u8);
        }

        self.is_enumerating = false;
        let pending = std::mem::take(&mut self.pending_free);
        for ptr in pending {
            self.free(ptr);
        }
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        for &arena in &self.arenas {
            unsafe {
                let header_size = align_up(std::mem::size_of::<ArenaHeader>());
                let full_size = header_size + (*arena).element_count * (*arena).element_size;
                if let Ok(layout) = Layout::from_size_align(full_size, GRANULARITY) {
                    dealloc(arena as *mut u8, layout);
                }
            }
        }
        for (&addr, &layout) in &self.large_layouts {
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

// The allocator is only touched from its owning domain's thread.
unsafe impl Send for PoolAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_free_roundtrip() {
        let mut pool = PoolAllocator::new();
        let a = pool.allocate(24);
        let b = pool.allocate(24);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        assert_eq!(pool.object_count(), 2);

        assert!(pool.is_valid_pointer(a));
        pool.free(a);
        assert!(!pool.is_valid_pointer(a));
        assert_eq!(pool.object_count(), 1);

        // The freed cell is reused for the next same-size request.
        let c = pool.allocate(24);
        assert_eq!(c, a);
    }

    #[test]
    fn test_allocation_is_zeroed() {
        let mut pool = PoolAllocator::new();
        let a = pool.allocate(64);
        unsafe {
            for i in 0..64 {
                assert_eq!(*a.add(i), 0);
            }
            std::ptr::write_bytes(a, 0xAB, 64);
        }
        pool.free(a);
        let b = pool.allocate(64);
        assert_eq!(a, b);
        unsafe {
            for i in 0..64 {
                assert_eq!(*b.add(i), 0, "recycled cell must be zeroed");
            }
        }
    }

    #[test]
    fn test_invalid_pointers_rejected() {
        let mut pool = PoolAllocator::new();
        let a = pool.allocate(32);
        // Interior pointers are not valid object starts.
        assert!(!pool.is_valid_pointer(unsafe { a.add(4) }));
        let unrelated = Box::new(0u64);
        assert!(!pool.is_valid_pointer(&*unrelated as *const u64 as *const u8));
    }

    #[test]
    fn test_large_objects_use_side_table() {
        let mut pool = PoolAllocator::new();
        let big = pool.allocate(TARGET_ARENA_SIZE);
        assert!(!big.is_null());
        assert!(pool.is_valid_pointer(big));
        assert_eq!(pool.object_count(), 1);
        pool.free(big);
        assert!(!pool.is_valid_pointer(big));
        assert_eq!(pool.object_count(), 0);
    }

    #[test]
    fn test_enumerate_visits_live_objects() {
        let mut pool = PoolAllocator::new();
        let mut expected = std::collections::HashSet::new();
        for _ in 0..10 {
            expected.insert(pool.allocate(48) as usize);
        }
        let big = pool.allocate(TARGET_ARENA_SIZE / 2);
        expected.insert(big as usize);

        let mut seen = std::collections::HashSet::new();
        pool.enumerate(|_, obj| {
            seen.insert(obj as usize);
        });
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_free_during_enumeration_is_deferred() {
        let mut pool = PoolAllocator::new();
        for _ in 0..5 {
            pool.allocate(40);
        }
        pool.enumerate(|p, obj| {
            p.free(obj);
        });
        assert_eq!(pool.object_count(), 0);
    }

    #[test]
    fn test_many_allocations_spill_to_new_arenas() {
        let mut pool = PoolAllocator::new();
        // Enough 64-byte objects to require several arenas.
        let mut ptrs = Vec::new();
        for _ in 0..10_000 {
            let p = pool.allocate(64);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        assert_eq!(pool.object_count(), 10_000);
        for p in ptrs {
            assert!(pool.is_valid_pointer(p));
            pool.free(p);
        }
        assert_eq!(pool.object_count(), 0);
    }
}
