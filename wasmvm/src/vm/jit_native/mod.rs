use crate::compiler::CompileError;

#[cfg(target_arch = "x86_64")]
pub(crate) mod x86_64;

/// A page-aligned executable code region with a stable base address.
///
/// The region is reserved read-write once, at a capacity computed from the
/// module's worst-case emission size. Artifacts (trap stubs, trampolines,
/// the indirect jump table, function bodies) are allocated append-only;
/// a function's over-reserved tail is returned with `reclaim`. `end_code`
/// flips the pages to read-execute; no explicit instruction-cache flush is
/// needed on x86-64.
pub(crate) struct CodeRegion {
    base: *mut u8,
    capacity: usize,
    used: usize,
    finalized: bool,
}

impl CodeRegion {
    pub(crate) fn new(capacity: usize) -> Result<Self, CompileError> {
        let capacity = round_up_to_page(capacity);
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CompileError::Platform(format!(
                "mmap of {capacity} byte code region failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            base: base as *mut u8,
            capacity,
            used: 0,
            finalized: false,
        })
    }

    /// Current write position; artifacts emitted later start at or after it.
    pub(crate) fn start_code(&self) -> usize {
        self.used
    }

    /// Reserve `len` bytes. The returned offset is stable for the region's
    /// lifetime.
    pub(crate) fn alloc(&mut self, len: usize) -> Result<usize, CompileError> {
        debug_assert!(!self.finalized);
        if self.capacity - self.used < len {
            return Err(CompileError::OutOfCodeSpace {
                needed: len,
                available: self.capacity - self.used,
            });
        }
        let offset = self.used;
        self.used += len;
        Ok(offset)
    }

    /// Return the unused tail of the most recent reservation.
    pub(crate) fn reclaim(&mut self, unused: usize) {
        debug_assert!(unused <= self.used);
        self.used -= unused;
    }

    /// The whole writable reservation. Emitters index it by offset.
    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        debug_assert!(!self.finalized);
        unsafe { std::slice::from_raw_parts_mut(self.base, self.capacity) }
    }

    /// Flip the region to read-execute. After this no further writes happen
    /// and derived function pointers become callable.
    pub(crate) fn end_code(&mut self) -> Result<(), CompileError> {
        let rc = unsafe { libc::mprotect(self.base as *mut _, self.capacity, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(CompileError::Platform(format!(
                "mprotect(rx) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        self.finalized = true;
        Ok(())
    }

    pub(crate) fn ptr_at(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.capacity);
        unsafe { self.base.add(offset) }
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut _, self.capacity);
        }
    }
}

fn round_up_to_page(len: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    len.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_append_only_and_reclaim_shrinks_the_tail() {
        let mut region = CodeRegion::new(4096).expect("region should map");
        let first = region.alloc(100).expect("alloc should fit");
        let second = region.alloc(200).expect("alloc should fit");
        assert_eq!(first, 0);
        assert_eq!(second, 100);
        region.reclaim(50);
        assert_eq!(region.used(), 250);
        let third = region.alloc(10).expect("alloc should fit");
        assert_eq!(third, 250);
    }

    #[test]
    fn exhaustion_is_a_fatal_compile_error() {
        let mut region = CodeRegion::new(4096).expect("region should map");
        let err = region.alloc(1 << 20).unwrap_err();
        assert!(matches!(err, CompileError::OutOfCodeSpace { .. }));
    }

    #[test]
    fn finalized_region_executes() {
        let mut region = CodeRegion::new(4096).expect("region should map");
        let offset = region.alloc(16).expect("alloc should fit");
        // mov eax, 7; ret
        region.buf_mut()[offset..offset + 6].copy_from_slice(&[0xB8, 0x07, 0, 0, 0, 0xC3]);
        region.end_code().expect("finalize should succeed");
        let entry: extern "sysv64" fn() -> u32 =
            unsafe { std::mem::transmute(region.ptr_at(offset)) };
        assert_eq!(entry(), 7);
    }
}
