use crate::vm::{VmError, VmResult};

pub const WASM_PAGE_SIZE: usize = 65536;

/// Address space reserved per linear memory. A load or store computes
/// `base + u32 index + u32 static offset`, so the farthest reachable byte is
/// just under `base + 8 GiB`; reserving that much PROT_NONE plus one wasm
/// page guarantees every out-of-bounds access lands in the guard and faults.
const RESERVED_BYTES: usize = (8 << 30) + WASM_PAGE_SIZE;

/// Hard Wasm limit for 32-bit memories: 64 Ki pages = 4 GiB.
const MAX_MEMORY_PAGES: u32 = 65536;

/// A growable linear memory backed by one fixed reservation.
///
/// Pages up to the current size are committed read-write; everything beyond
/// stays PROT_NONE so generated code needs no explicit bounds checks — the
/// process signal handler converts guard faults into the out-of-bounds trap.
/// The base address never moves, which lets generated code keep it pinned in
/// a register for the whole invocation.
pub struct LinearMemory {
    base: *mut u8,
    pages: u32,
    max_pages: u32,
}

impl LinearMemory {
    pub(crate) fn new(initial_pages: u32, max_pages: u32) -> VmResult<Self> {
        let max_pages = max_pages.min(MAX_MEMORY_PAGES);
        let initial_pages = initial_pages.min(max_pages);
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                RESERVED_BYTES,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(VmError::Platform(format!(
                "linear memory reservation failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let mut memory = Self {
            base: base as *mut u8,
            pages: 0,
            max_pages,
        };
        if initial_pages > 0 {
            memory.commit(initial_pages)?;
            memory.pages = initial_pages;
        }
        Ok(memory)
    }

    pub fn page_count(&self) -> u32 {
        self.pages
    }

    pub fn byte_size(&self) -> usize {
        self.pages as usize * WASM_PAGE_SIZE
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    /// Span of the whole reservation, guard included. The signal handler
    /// uses it to tell linear-memory faults apart from genuine crashes.
    pub(crate) fn reserved_span(&self) -> (usize, usize) {
        (self.base as usize, RESERVED_BYTES)
    }

    /// Grow by `delta` pages. Returns the previous page count, or -1 if the
    /// declared maximum would be exceeded — the `memory.grow` contract.
    pub fn grow(&mut self, delta: u32) -> i32 {
        let old = self.pages;
        let Some(new) = old.checked_add(delta) else {
            return -1;
        };
        if new > self.max_pages {
            return -1;
        }
        if delta > 0 && self.commit(new).is_err() {
            return -1;
        }
        self.pages = new;
        old as i32
    }

    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.byte_size()) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, self.byte_size()) }
    }

    fn commit(&mut self, pages: u32) -> VmResult<()> {
        let len = pages as usize * WASM_PAGE_SIZE;
        let rc = unsafe {
            libc::mprotect(
                self.base as *mut _,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(VmError::Platform(format!(
                "linear memory commit of {pages} pages failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut _, RESERVED_BYTES);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_returns_old_page_count_and_respects_the_maximum() {
        let mut memory = LinearMemory::new(1, 3).expect("memory should map");
        assert_eq!(memory.page_count(), 1);
        assert_eq!(memory.grow(1), 1);
        assert_eq!(memory.grow(1), 2);
        assert_eq!(memory.grow(1), -1);
        assert_eq!(memory.page_count(), 3);
    }

    #[test]
    fn committed_pages_are_readable_and_writable() {
        let mut memory = LinearMemory::new(1, 1).expect("memory should map");
        memory.data_mut()[0] = 0xAB;
        memory.data_mut()[WASM_PAGE_SIZE - 1] = 0xCD;
        assert_eq!(memory.data()[0], 0xAB);
        assert_eq!(memory.data()[WASM_PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn zero_page_memory_still_reserves_a_guard() {
        let memory = LinearMemory::new(0, 0).expect("memory should map");
        assert_eq!(memory.page_count(), 0);
        let (base, len) = memory.reserved_span();
        assert_ne!(base, 0);
        assert!(len > 8 << 30);
    }
}
