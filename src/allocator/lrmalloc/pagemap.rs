//! Flat, page-indexed descriptor lookup.
//!
//! Grounded in `pagemap.h`/`pagemap.cpp`: the address space is split into
//! insignificant high bits (above the canonical 48-bit range on x86-64),
//! a significant middle range that indexes the table, and the page-offset
//! low bits. The table is a single overcommitted `mmap` so only pages that
//! are actually touched (i.e. pages some superblock or oversized
//! allocation was ever registered under) become resident.

use crate::sync::atomic::{AtomicUsize, Ordering};

use super::descriptor::Descriptor;
use super::page;

/// Insignificant high bits above the canonical 48-bit x86-64 address range.
const INSIGNIFICANT_HIGH_BITS: u32 = 12;

pub struct PageMap {
    base: *mut AtomicUsize,
    key_shift: u32,
    key_mask: usize,
}

unsafe impl Sync for PageMap {}
unsafe impl Send for PageMap {}

impl PageMap {
    pub fn new() -> Self {
        let key_shift = page::page_size().trailing_zeros();
        let significant_bits = 64 - INSIGNIFICANT_HIGH_BITS - key_shift;
        let key_mask = (1usize << significant_bits) - 1;
        let entries = 1usize << significant_bits;
        let bytes = page::page_ceiling(entries * std::mem::size_of::<AtomicUsize>());

        let region = page::alloc_overcommit(bytes).unwrap_or_else(|| {
            log::error!("failed to reserve {} bytes for the page map", bytes);
            std::process::abort();
        });

        Self {
            base: region.as_ptr() as *mut AtomicUsize,
            key_shift,
            key_mask,
        }
    }

    fn key(&self, ptr: *const u8) -> usize {
        ((ptr as usize) >> self.key_shift) & self.key_mask
    }

    fn slot(&self, ptr: *const u8) -> &AtomicUsize {
        let idx = self.key(ptr);
        unsafe { &*self.base.add(idx) }
    }

    /// Registers every page covered by `[ptr, ptr + len)` as owned by
    /// `desc`. `len` need not be page-aligned; the final partial page is
    /// still registered.
    pub fn register(&self, ptr: *mut u8, len: usize, desc: *mut Descriptor) {
        let page_size = page::page_size();
        let mut addr = ptr as usize;
        let end = addr + len;
        while addr < end {
            self.slot(addr as *const u8).store(desc as usize, Ordering::Release);
            addr += page_size;
        }
    }

    /// Registers a single page. Used to additionally register the
    /// forward-aligned page of an oversized `aligned_alloc` request, so a
    /// `deallocate` on the aligned pointer resolves to the same descriptor.
    pub fn register_page(&self, ptr: *mut u8, desc: *mut Descriptor) {
        self.slot(ptr as *const u8).store(desc as usize, Ordering::Release);
    }

    pub fn unregister(&self, ptr: *mut u8, len: usize) {
        let page_size = page::page_size();
        let mut addr = ptr as usize;
        let end = addr + len;
        while addr < end {
            self.slot(addr as *const u8).store(0, Ordering::Relaxed);
            addr += page_size;
        }
    }

    pub fn unregister_page(&self, ptr: *mut u8) {
        self.slot(ptr as *const u8).store(0, Ordering::Relaxed);
    }

    /// Looks up the descriptor owning the page containing `ptr`. Null if
    /// `ptr` was never registered (not an allocation this allocator made).
    pub fn load(&self, ptr: *const u8) -> *mut Descriptor {
        self.slot(ptr).load(Ordering::Acquire) as *mut Descriptor
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_load() {
        let map = PageMap::new();
        let page = page::page_size();
        let region = page::alloc(page).unwrap();
        let fake_desc = 0x1000 as *mut Descriptor;

        assert!(map.load(region.as_ptr()).is_null());

        map.register(region.as_ptr(), page, fake_desc);
        assert_eq!(map.load(region.as_ptr()), fake_desc);

        map.unregister(region.as_ptr(), page);
        assert!(map.load(region.as_ptr()).is_null());

        unsafe { page::free(region, page) };
    }
}
