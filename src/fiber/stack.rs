//! Call stacks backing each fiber.

use std::num::NonZeroUsize;
use std::sync::OnceLock;
use std::{ffi, io, ptr};

/// Size of a virtual memory page, queried once per process.
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(size >= 4096, "page size must be no smaller than 4KiB");
        size as usize
    })
}

/// Rounds [bytes] up to whole pages, at least one.
pub(crate) fn pages_for(bytes: usize) -> NonZeroUsize {
    let page_size = page_size();
    let pages = bytes.div_ceil(page_size);
    NonZeroUsize::new(pages).unwrap_or(NonZeroUsize::MIN)
}

#[derive(Debug)]
pub(crate) struct Stack {
    pointer: *mut u8,
    length: usize,
    usable: usize,
}

impl Stack {
    /// Allocates a general purpose stack.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    /// The stack is protected from overflow using guard pages.
    pub(crate) fn new(guard_pages: NonZeroUsize, usable_pages: NonZeroUsize) -> io::Result<Self> {
        let (guard_pages, usable_pages) = (guard_pages.get(), usable_pages.get());

        // page aligned sizes
        let page_size = page_size();
        let length = (guard_pages.checked_add(usable_pages))
            .and_then(|pages| pages.checked_mul(page_size))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stack size overflows"))?;

        #[cfg(not(target_os = "macos"))]
        const MAP_STACK: libc::c_int = libc::MAP_STACK;
        #[cfg(target_os = "macos")]
        const MAP_STACK: libc::c_int = 0;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_STACK,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
            usable: usable_pages * page_size,
        };

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, guard_pages * page_size, libc::PROT_NONE) };
        if result == -1 {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        Ok(stack)
    }

    /// Highest address of the stack, where the first frame starts.
    pub(crate) fn base(&self) -> *mut u8 {
        // safety: part of same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }

    /// Bytes available to frames, excluding guard pages.
    pub(crate) fn usable_size(&self) -> usize {
        self.usable
    }

    /// Whether [Stack::new] with these arguments would produce an identical stack.
    pub(crate) fn has_geometry(&self, guard_pages: NonZeroUsize, usable_pages: NonZeroUsize) -> bool {
        let page_size = page_size();
        let length = (guard_pages.get().checked_add(usable_pages.get()))
            .and_then(|pages| pages.checked_mul(page_size));
        self.usable == usable_pages.get().wrapping_mul(page_size) && length == Some(self.length)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        debug_assert_eq!(result, 0, "munmap: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn writes_lowest_usable_byte() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        unsafe {
            let pointer = stack.base().sub(stack.usable_size());
            pointer.write(7);
            assert_eq!(pointer.read(), 7);
        }
    }

    #[test]
    fn matches_own_geometry() {
        let guard_pages = NonZeroUsize::MIN;
        let usable_pages = NonZeroUsize::new(2).unwrap();

        let stack = Stack::new(guard_pages, usable_pages).unwrap();

        assert!(stack.has_geometry(guard_pages, usable_pages));
        assert!(!stack.has_geometry(usable_pages, usable_pages));
        assert!(!stack.has_geometry(guard_pages, guard_pages));
    }

    #[test]
    fn refuses_overflowing_size() {
        let error = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MAX).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn usable_size_excludes_guard_pages() {
        let guard_pages = NonZeroUsize::new(2).unwrap();
        let usable_pages = NonZeroUsize::new(3).unwrap();

        let stack = Stack::new(guard_pages, usable_pages).unwrap();

        assert_eq!(stack.usable_size(), 3 * page_size());
    }

    #[test]
    fn base_is_page_aligned() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();

        assert_eq!(stack.base() as usize % page_size(), 0);
    }

    #[test]
    fn rounds_up_to_whole_pages() {
        assert_eq!(pages_for(0).get(), 1);
        assert_eq!(pages_for(1).get(), 1);
        assert_eq!(pages_for(page_size()).get(), 1);
        assert_eq!(pages_for(page_size() + 1).get(), 2);
    }

    #[test]
    #[ignore = "aborts process"] // TODO: test with fork()
    fn overflow() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        unsafe {
            let pointer = stack.base().sub(stack.usable_size() + 1);
            pointer.write(123);
        }
    }
}
