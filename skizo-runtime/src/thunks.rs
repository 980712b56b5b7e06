//! The thunk manager hand-emits 32-bit x86 machine code for four cases:
//! closure callback trampolines, closure constructors, self-patching
//! boxed-method trampolines, and reflection thunks. Bypassing the C
//! backend avoids pathological recompiles on class-heavy programs and
//! permits call-site tricks the backend cannot express.
//!
//! Assumptions: 32-bit x86, cdecl by default (stdcall via attribute),
//! 4-byte argument granules, downward-growing stack. Byte sequences are
//! buildable and testable on any host; mapping them executable is gated
//! on the target actually being x86-32.

use skizo_metadata::{ClassId, Metadata, MethodId, PrimType, TypeRefKind, WORD_SIZE};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThunkError {
    #[error("Thunks require a 32-bit x86 target")]
    UnsupportedArch,
    #[error("Non-primitive value-type parameters are not supported in thunk signatures")]
    UnsupportedParameter,
    #[error("Executable page allocation failed")]
    PageAllocation,
}

/// Word-granule count of a parameter in a cdecl frame.
pub fn param_granules(md: &Metadata, ty: &skizo_metadata::TypeRef) -> Result<u32, ThunkError> {
    if ty.array_level > 0 || ty.kind != TypeRefKind::Normal {
        return Ok(1);
    }
    match ty.prim {
        PrimType::Object => match ty.resolved {
            Some(id) if md.class(id).is_value_type => {
                let size = md.class(id).gc_info.size_for_use;
                if size > WORD_SIZE {
                    // Different ABIs lay big value types out differently;
                    // surface a clean error instead of miscompiling.
                    Err(ThunkError::UnsupportedParameter)
                } else {
                    Ok(1)
                }
            }
            _ => Ok(1),
        },
        PrimType::Void => Ok(0),
        _ => Ok(1),
    }
}

// ---------------------------------------------------------------------------
// Executable pages
// ---------------------------------------------------------------------------

/// Bump allocator over RWX pages with a simple size-bucketed free list.
/// Thunks are small and fixed-size per shape, so recycling is exact.
pub struct ExecutablePageAllocator {
    chunks: Vec<(*mut u8, usize)>,
    cursor: usize,
    remaining: usize,
    free_lists: HashMap<usize, Vec<*mut u8>>,
    chunk_size: usize,
}

impl ExecutablePageAllocator {
    pub fn new() -> Self {
        ExecutablePageAllocator {
            chunks: Vec::new(),
            cursor: 0,
            remaining: 0,
            free_lists: HashMap::new(),
            chunk_size: 64 * 1024,
        }
    }

    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, ThunkError> {
        let size = size.next_multiple_of(16);
        if let Some(list) = self.free_lists.get_mut(&size) {
            if let Some(ptr) = list.pop() {
                return Ok(ptr);
            }
        }
        if self.remaining < size {
            self.map_chunk()?;
        }
        let ptr = self.cursor as *mut u8;
        self.cursor += size;
        self.remaining -= size;
        Ok(ptr)
    }

    pub fn free(&mut self, ptr: *mut u8, size: usize) {
        let size = size.next_multiple_of(16);
        self.free_lists.entry(size).or_default().push(ptr);
    }

    fn map_chunk(&mut self) -> Result<(), ThunkError> {
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                self.chunk_size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(ThunkError::PageAllocation);
            }
            self.chunks.push((ptr as *mut u8, self.chunk_size));
            self.cursor = ptr as usize;
            self.remaining = self.chunk_size;
            Ok(())
        }
    }
}

impl Default for ExecutablePageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutablePageAllocator {
    fn drop(&mut self) {
        for &(ptr, size) in &self.chunks {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, size);
            }
        }
    }
}

unsafe impl Send for ExecutablePageAllocator {}

// ---------------------------------------------------------------------------
// Code buffer
// ---------------------------------------------------------------------------

/// Byte-level x86-32 emitter.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        CodeBuffer { bytes: Vec::new() }
    }

    fn u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// push dword [esp + disp8]
    pub fn push_esp_disp8(&mut self, disp: u8) {
        self.u8(0xFF);
        self.u8(0x74);
        self.u8(0x24);
        self.u8(disp);
    }

    /// push imm32
    pub fn push_imm32(&mut self, v: u32) {
        self.u8(0x68);
        self.u32(v);
    }

    /// mov eax, imm32
    pub fn mov_eax_imm32(&mut self, v: u32) {
        self.u8(0xB8);
        self.u32(v);
    }

    /// mov eax, [esp + disp8]
    pub fn mov_eax_esp_disp8(&mut self, disp: u8) {
        self.u8(0x8B);
        self.u8(0x44);
        self.u8(0x24);
        self.u8(disp);
    }

    /// push dword [eax + disp8]
    pub fn push_eax_disp8(&mut self, disp: u8) {
        self.u8(0xFF);
        self.u8(0x70);
        self.u8(disp);
    }

    /// call eax
    pub fn call_eax(&mut self) {
        self.u8(0xFF);
        self.u8(0xD0);
    }

    /// jmp eax
    pub fn jmp_eax(&mut self) {
        self.u8(0xFF);
        self.u8(0xE0);
    }

    /// add esp, imm8
    pub fn add_esp_imm8(&mut self, v: u8) {
        self.u8(0x83);
        self.u8(0xC4);
        self.u8(v);
    }

    /// fstp dword [esp] — spill st0 for float-return boxing.
    pub fn fstp_esp(&mut self) {
        self.u8(0xD9);
        self.u8(0x1C);
        self.u8(0x24);
    }

    /// pop eax
    pub fn pop_eax(&mut self) {
        self.u8(0x58);
    }

    /// push eax
    pub fn push_eax(&mut self) {
        self.u8(0x50);
    }

    /// sub esp, imm8
    pub fn sub_esp_imm8(&mut self, v: u8) {
        self.u8(0x83);
        self.u8(0xEC);
        self.u8(v);
    }

    /// ret (cdecl: caller cleans) or ret imm16 (stdcall).
    pub fn ret(&mut self) {
        self.u8(0xC3);
    }

    pub fn ret_imm16(&mut self, v: u16) {
        self.u8(0xC2);
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Thunk manager
// ---------------------------------------------------------------------------

/// Built per domain. Caches reflection thunks per method and tracks every
/// closure trampoline so the GC can release them on sweep.
pub struct ThunkManager {
    pages: ExecutablePageAllocator,
    reflection_cache: HashMap<MethodId, *const u8>,
    closure_trampolines: HashMap<usize, (*mut u8, usize)>,
    /// Lazily built single-`invoke` vtables for closure classes.
    closure_vtables: HashMap<ClassId, Box<[usize]>>,
    safe_callbacks: bool,
}

impl ThunkManager {
    pub fn new(safe_callbacks: bool) -> Self {
        ThunkManager {
            pages: ExecutablePageAllocator::new(),
            reflection_cache: HashMap::new(),
            closure_trampolines: HashMap::new(),
            closure_vtables: HashMap::new(),
            safe_callbacks,
        }
    }

    fn require_x86(&self) -> Result<(), ThunkError> {
        if cfg!(target_arch = "x86") {
            Ok(())
        } else {
            Err(ThunkError::UnsupportedArch)
        }
    }

    /// The vtable of a generated closure class: slot 0 = class word,
    /// slot 1 = invoke. Built on first use and owned here so object
    /// headers can point into it.
    pub fn closure_vtable(&mut self, class_id: ClassId, invoke_ptr: usize) -> *mut usize {
        let entry = self
            .closure_vtables
            .entry(class_id)
            .or_insert_with(|| Box::new([class_id.0 as usize + 1, invoke_ptr]) as Box<[usize]>);
        entry.as_mut_ptr()
    }

    // ------------------------------------------------------------------
    // Closure callback trampoline
    // ------------------------------------------------------------------

    /// Byte image of a trampoline that re-pushes `arg_granules` words of
    /// arguments, pushes the closure as `this`, and calls its invoke.
    /// With safe callbacks on, a prolog call verifies the running domain
    /// is the closure's home domain.
    pub fn build_closure_trampoline(
        &self,
        closure: usize,
        invoke: usize,
        arg_granules: u8,
        domain_check: Option<usize>,
    ) -> CodeBuffer {
        let mut code = CodeBuffer::new();
        if let Some(check) = domain_check {
            // check(closure) aborts on a foreign domain.
            code.push_imm32(closure as u32);
            code.mov_eax_imm32(check as u32);
            code.call_eax();
            code.add_esp_imm8(4);
        }
        // Re-push the caller's arguments. The first argument sits just
        // above the return address; each push shifts the frame by one
        // word, so the displacement stays constant.
        for _ in 0..arg_granules {
            code.push_esp_disp8(arg_granules * 4);
        }
        code.push_imm32(closure as u32);
        code.mov_eax_imm32(invoke as u32);
        code.call_eax();
        code.add_esp_imm8((arg_granules + 1) * 4);
        code.ret();
        code
    }

    /// Installs a trampoline for the closure and records it in the
    /// closure's `code_offset` slot. Freed by the GC when the closure is
    /// swept.
    ///
    /// # Safety
    /// `closure` must be a live closure object with the shared layout.
    pub unsafe fn install_closure_trampoline(
        &mut self,
        closure: *mut u8,
        invoke: usize,
        arg_granules: u8,
        domain_check: Option<usize>,
    ) -> Result<*const u8, ThunkError> {
        self.require_x86()?;
        let check = if self.safe_callbacks { domain_check } else { None };
        let code = self.build_closure_trampoline(closure as usize, invoke, arg_granules, check);
        let dest = self.pages.allocate(code.len())?;
        std::ptr::copy_nonoverlapping(code.bytes().as_ptr(), dest, code.len());
        // code_offset is the third word of the shared closure layout.
        *(closure.add(8) as *mut usize) = dest as usize;
        self.closure_trampolines
            .insert(closure as usize, (dest, code.len()));
        Ok(dest)
    }

    /// Releases the thunk owned by a swept closure.
    pub fn release_closure(&mut self, closure: *mut u8) {
        if let Some((ptr, size)) = self.closure_trampolines.remove(&(closure as usize)) {
            self.pages.free(ptr, size);
        }
    }

    pub fn live_trampoline_count(&self) -> usize {
        self.closure_trampolines.len()
    }

    // ------------------------------------------------------------------
    // Closure constructor stub
    // ------------------------------------------------------------------

    /// Byte image of a closure-ctor stub: pushes the method's metadata
    /// word and the `env` argument and calls the runtime helper that
    /// lazily builds the closure class's vtable, computes its GC map,
    /// allocates the object and stores the env pointer.
    pub fn build_closure_ctor_stub(&self, method_meta: usize, helper: usize) -> CodeBuffer {
        let mut code = CodeBuffer::new();
        // env arrives at [esp+4]; after the meta push it sits at [esp+8].
        code.push_esp_disp8(4);
        code.push_imm32(method_meta as u32);
        code.mov_eax_imm32(helper as u32);
        code.call_eax();
        code.add_esp_imm8(8);
        code.ret();
        code
    }

    pub fn install_closure_ctor_stub(
        &mut self,
        method_meta: usize,
        helper: usize,
    ) -> Result<*const u8, ThunkError> {
        self.require_x86()?;
        let code = self.build_closure_ctor_stub(method_meta, helper);
        let dest = self.pages.allocate(code.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.bytes().as_ptr(), dest, code.len());
        }
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Boxed-method trampoline
    // ------------------------------------------------------------------

    /// First-stage boxed-method trampoline: one shot into the JIT helper
    /// that builds the real stub and patches this one to jump straight to
    /// it on subsequent calls.
    pub fn build_boxed_method_entry(&self, thunk_info: usize, jit_helper: usize) -> CodeBuffer {
        let mut code = CodeBuffer::new();
        code.mov_eax_imm32(thunk_info as u32);
        code.push_eax();
        code.mov_eax_imm32(jit_helper as u32);
        code.call_eax();
        code.add_esp_imm8(4);
        // The helper returned the compiled stub; chain into it with the
        // original frame intact.
        code.jmp_eax();
        code
    }

    /// Second-stage boxed-method stub: re-pushes the boxed receiver's
    /// unwrapped fields in granule order and tail-calls the wrapped
    /// value-type's method.
    pub fn build_boxed_method_stub(&self, value_granules: u8, target: usize) -> CodeBuffer {
        let mut code = CodeBuffer::new();
        // eax = boxed this (first argument).
        code.mov_eax_esp_disp8(4);
        // Push the unwrapped payload, highest granule first, so the
        // lowest word lands at the top of the stack.
        for g in (0..value_granules).rev() {
            // Payload begins after the header word.
            code.push_eax_disp8(4 + g * 4);
        }
        code.mov_eax_imm32(target as u32);
        code.call_eax();
        code.add_esp_imm8(value_granules * 4);
        code.ret();
        code
    }

    /// Patches a first-stage trampoline into `jmp imm32`-style dispatch
    /// to the compiled stub.
    ///
    /// # Safety
    /// `entry` must point at a trampoline built by
    /// `build_boxed_method_entry` and mapped writable.
    pub unsafe fn patch_boxed_entry(&self, entry: *mut u8, stub: usize) {
        // mov eax, stub; jmp eax — overwrites the first-stage prologue.
        *entry = 0xB8;
        std::ptr::copy_nonoverlapping((stub as u32).to_le_bytes().as_ptr(), entry.add(1), 4);
        *entry.add(5) = 0xFF;
        *entry.add(6) = 0xE0;
    }

    // ------------------------------------------------------------------
    // Reflection thunk
    // ------------------------------------------------------------------

    /// Reflection thunk: unpacks a flat argument buffer into the CDECL
    /// frame (including the hidden return-buffer argument for value-type
    /// returns), calls the compiled method, and boxes a value-type
    /// result through the wrapped class's boxed ctor. A float return in
    /// st0 is spilled to the stack and re-read into eax before boxing.
    pub fn build_reflection_thunk(
        &self,
        target: usize,
        arg_granules: u8,
        returns_float: bool,
        box_ctor: Option<usize>,
        hidden_ret_buffer: Option<usize>,
    ) -> CodeBuffer {
        let mut code = CodeBuffer::new();
        // The flat buffer pointer arrives at [esp+4]; load it and push
        // its words right-to-left.
        code.mov_eax_esp_disp8(4);
        for g in (0..arg_granules).rev() {
            code.push_eax_disp8(g * 4);
        }
        let mut pushed = arg_granules;
        if let Some(buffer) = hidden_ret_buffer {
            code.push_imm32(buffer as u32);
            pushed += 1;
        }
        code.mov_eax_imm32(target as u32);
        code.call_eax();
        if pushed > 0 {
            code.add_esp_imm8(pushed * 4);
        }
        if returns_float {
            // Copy st0 into eax for the boxing path.
            code.sub_esp_imm8(4);
            code.fstp_esp();
            code.pop_eax();
        }
        if let Some(ctor) = box_ctor {
            code.push_eax();
            code.mov_eax_imm32(ctor as u32);
            code.call_eax();
            code.add_esp_imm8(4);
        }
        code.ret();
        code
    }

    /// The thunk is cached on the method.
    pub fn reflection_thunk(
        &mut self,
        method: MethodId,
        target: usize,
        arg_granules: u8,
        returns_float: bool,
        box_ctor: Option<usize>,
    ) -> Result<*const u8, ThunkError> {
        if let Some(&cached) = self.reflection_cache.get(&method) {
            return Ok(cached);
        }
        self.require_x86()?;
        let code =
            self.build_reflection_thunk(target, arg_granules, returns_float, box_ctor, None);
        let dest = self.pages.allocate(code.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.bytes().as_ptr(), dest, code.len());
        }
        self.reflection_cache.insert(method, dest);
        Ok(dest)
    }
}

unsafe impl Send for ThunkManager {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_trampoline_bytes() {
        let tm = ThunkManager::new(false);
        let code = tm.build_closure_trampoline(0x11223344, 0x55667788, 2, None);
        let bytes = code.bytes();
        // Two re-pushes of [esp+8].
        assert_eq!(&bytes[0..4], &[0xFF, 0x74, 0x24, 0x08]);
        assert_eq!(&bytes[4..8], &[0xFF, 0x74, 0x24, 0x08]);
        // push imm32 closure
        assert_eq!(bytes[8], 0x68);
        assert_eq!(&bytes[9..13], &0x11223344u32.to_le_bytes());
        // mov eax, invoke; call eax
        assert_eq!(bytes[13], 0xB8);
        assert_eq!(&bytes[14..18], &0x55667788u32.to_le_bytes());
        assert_eq!(&bytes[18..20], &[0xFF, 0xD0]);
        // add esp, 12; ret
        assert_eq!(&bytes[20..23], &[0x83, 0xC4, 0x0C]);
        assert_eq!(bytes[23], 0xC3);
    }

    #[test]
    fn test_safe_callback_prolog() {
        let tm = ThunkManager::new(true);
        let code = tm.build_closure_trampoline(0xAA, 0xBB, 0, Some(0xCC));
        let bytes = code.bytes();
        // push closure; mov eax, check; call eax; add esp, 4
        assert_eq!(bytes[0], 0x68);
        assert_eq!(bytes[5], 0xB8);
        assert_eq!(&bytes[10..12], &[0xFF, 0xD0]);
        assert_eq!(&bytes[12..15], &[0x83, 0xC4, 0x04]);
    }

    #[test]
    fn test_closure_ctor_stub_bytes() {
        let tm = ThunkManager::new(false);
        let code = tm.build_closure_ctor_stub(0xDEAD, 0xBEEF);
        let bytes = code.bytes();
        // push [esp+4] (env)
        assert_eq!(&bytes[0..4], &[0xFF, 0x74, 0x24, 0x04]);
        // push imm32 meta
        assert_eq!(bytes[4], 0x68);
        assert_eq!(&bytes[5..9], &0xDEADu32.to_le_bytes());
    }

    #[test]
    fn test_boxed_stub_pushes_granules_in_reverse() {
        let tm = ThunkManager::new(false);
        let code = tm.build_boxed_method_stub(2, 0x1000);
        let bytes = code.bytes();
        // mov eax, [esp+4]
        assert_eq!(&bytes[0..4], &[0x8B, 0x44, 0x24, 0x04]);
        // push [eax+8] then push [eax+4]: highest granule first.
        assert_eq!(&bytes[4..7], &[0xFF, 0x70, 0x08]);
        assert_eq!(&bytes[7..10], &[0xFF, 0x70, 0x04]);
    }

    #[test]
    fn test_reflection_thunk_float_return() {
        let tm = ThunkManager::new(false);
        let code = tm.build_reflection_thunk(0x2000, 1, true, Some(0x3000), None);
        let bytes = code.bytes();
        // The float spill sequence must appear: sub esp,4; fstp [esp]; pop eax.
        let spill = [0x83, 0xEC, 0x04, 0xD9, 0x1C, 0x24, 0x58];
        assert!(
            bytes.windows(spill.len()).any(|w| w == spill),
            "missing float spill in {:02x?}",
            bytes
        );
    }

    #[test]
    fn test_unsupported_value_type_param() {
        let mut md = Metadata::new();
        let id = md.next_class_id();
        let mut big = skizo_metadata::Class::new(id, "Big");
        big.is_value_type = true;
        big.gc_info.size_for_use = 16;
        let id = md.register_class(big).unwrap();
        let mut ty = skizo_metadata::TypeRef::object("Big");
        ty.resolved = Some(id);
        assert!(matches!(
            param_granules(&md, &ty),
            Err(ThunkError::UnsupportedParameter)
        ));
        assert_eq!(param_granules(&md, &skizo_metadata::TypeRef::int()).unwrap(), 1);
    }

    #[test]
    fn test_page_allocator_recycles() {
        let mut pages = ExecutablePageAllocator::new();
        let a = pages.allocate(24).unwrap();
        pages.free(a, 24);
        let b = pages.allocate(24).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_arch_gate() {
        let mut tm = ThunkManager::new(false);
        let result = tm.install_closure_ctor_stub(0x1, 0x2);
        if cfg!(target_arch = "x86") {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(ThunkError::UnsupportedArch)));
        }
    }

    #[test]
    fn test_closure_vtable_shape() {
        let mut tm = ThunkManager::new(false);
        let vt = tm.closure_vtable(ClassId(7), 0x4242);
        unsafe {
            assert_eq!(*vt, 8); // class word = id + 1
            assert_eq!(*vt.add(1), 0x4242);
        }
    }
}
