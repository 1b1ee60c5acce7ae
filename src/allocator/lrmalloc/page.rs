//! OS page provider: the allocator's only blocking, syscall-backed primitive.
//!
//! Mirrors `PageAlloc`/`PageFree` from the original `pages.cpp`: a pair of
//! thin `mmap`/`munmap` wrappers. Everything above this module treats pages
//! as an opaque request/return resource.

use std::ptr::NonNull;

/// System page size, queried once via `sysconf` and cached for the process
/// lifetime (same approach as `os_page_size` in the mimalloc-style reference).
pub fn page_size() -> usize {
    lazy_static::lazy_static! {
        static ref PAGE_SIZE: usize = unsafe {
            let sz = libc::sysconf(libc::_SC_PAGESIZE);
            if sz <= 0 {
                4096
            } else {
                sz as usize
            }
        };
    }
    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the system page size.
pub fn page_ceiling(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// Requests `size` bytes of fresh, zeroed, page-aligned memory from the OS.
///
/// `size` must already be a multiple of the page size. Returns `None` on
/// failure instead of panicking or aborting: callers decide how to surface
/// OOM (the `GlobalAlloc` path returns a null pointer, the safe wrappers
/// return an error).
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    debug_assert_eq!(size % page_size(), 0);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        log::warn!("mmap({} bytes) failed: {}", size, std::io::Error::last_os_error());
        return None;
    }

    NonNull::new(ptr as *mut u8)
}

/// Requests page-aligned memory backed by overcommitted, never-resident
/// pages until touched. Used for the page map, which is sized for the
/// entire address space but only sparsely populated.
pub fn alloc_overcommit(size: usize) -> Option<NonNull<u8>> {
    debug_assert_eq!(size % page_size(), 0);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        log::warn!(
            "overcommitted mmap({} bytes) failed: {}",
            size,
            std::io::Error::last_os_error()
        );
        return None;
    }

    NonNull::new(ptr as *mut u8)
}

/// Returns `size` bytes previously obtained from [`alloc`] or
/// [`alloc_overcommit`] back to the OS.
///
/// # Safety
/// `ptr` must be the exact pointer returned by a prior call, and `size` must
/// match the size passed to that call.
pub unsafe fn free(ptr: NonNull<u8>, size: usize) {
    debug_assert_eq!(size % page_size(), 0);

    let ret = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) };
    if ret != 0 {
        log::warn!("munmap failed: {}", std::io::Error::last_os_error());
    }
}
