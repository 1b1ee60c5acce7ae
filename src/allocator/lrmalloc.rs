//! A lock-free, thread-caching general purpose allocator
//!
//! # Internal design
//! ## Thread-Local Caches
//! Each thread has a small Cache of ready to use allocations, which help with performance
//! in most cases as they dont need any extra synchronization between threads.
//!
//! ## Heap
//! The Heap is the central shared entity, which actually manages the underlying allocations
//! as well as the needed synchronization between different threads.
//!
//! # References
//! * [Paper - 'LRMalloc: a Modern and Competitive Lock-Free Dynamic Memory Allocator'](https://vecpar2018.ncc.unesp.br/wp-content/uploads/2018/09/VECPAR_2018_paper_27.pdf)

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::RefCell,
    ptr,
};

pub mod cache;
pub mod descriptor;
pub mod heap;
pub mod page;
pub mod pagemap;
pub mod size_classes;

use cache::Cache;
use descriptor::pool::DescriptorPool;
use heap::Heap;
use pagemap::PageMap;

lazy_static::lazy_static! {
    static ref PAGEMAP: PageMap = PageMap::new();
    static ref POOL: DescriptorPool = DescriptorPool::new();
    static ref HEAPS: Vec<Heap> = (0..size_classes::size_class_count()).map(Heap::new).collect();
}

struct ThreadCache {
    cache: RefCell<Cache>,
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        let mut cache = self.cache.borrow_mut();
        for sc in 1..size_classes::size_class_count() {
            let blocks: Vec<_> = cache.drain(sc).collect();
            for block in blocks {
                let desc = PAGEMAP.load(block);
                if !desc.is_null() {
                    Heap::flush_block(&PAGEMAP, &POOL, desc, block);
                }
            }
        }
    }
}

thread_local! {
    static CACHE: ThreadCache = ThreadCache {
        cache: RefCell::new(Cache::new()),
    };
}

/// The lock-free allocator. Install as `#[global_allocator]` to make every
/// `Box`/`Vec`/`String` allocation in the process go through it.
///
/// All instances share the same global state (page map, descriptor pool,
/// per-size-class heaps); only one should ever be installed as the global
/// allocator for a process.
pub struct Allocator;

impl Allocator {
    pub const fn new() -> Self {
        Self
    }

    /// Allocates memory satisfying `layout`, or returns null on OS-level
    /// allocation failure.
    pub unsafe fn allocate(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();
        let effective_size = size.max(align);

        let sc_idx = match size_classes::get_size_class_index(effective_size) {
            Some(idx) => idx,
            None => return Heap::alloc_oversized(&PAGEMAP, &POOL, effective_size).unwrap_or(ptr::null_mut()),
        };

        let block_size = size_classes::get_block_size(sc_idx);
        if block_size % align != 0 {
            // Alignment exceeds what this size class's blocks naturally
            // provide; service as a dedicated oversized mapping instead.
            return Heap::alloc_oversized(&PAGEMAP, &POOL, effective_size).unwrap_or(ptr::null_mut());
        }

        CACHE.with(|tc| {
            let mut cache = tc.cache.borrow_mut();
            if let Some(ptr) = cache.try_alloc(sc_idx) {
                return ptr;
            }

            let heap = &HEAPS[sc_idx];
            let want = size_classes::get_size_class(sc_idx).cache_capacity;
            let blocks = heap.fill(&PAGEMAP, &POOL, want);
            if blocks.is_empty() {
                return ptr::null_mut();
            }
            cache.extend(sc_idx, blocks);
            cache
                .try_alloc(sc_idx)
                .expect("cache was just filled with at least one block")
        })
    }

    /// Frees memory previously returned by [`Allocator::allocate`]. `ptr`
    /// being null is a no-op.
    pub unsafe fn deallocate(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }

        let desc_ptr = PAGEMAP.load(ptr);
        if desc_ptr.is_null() {
            panic!("ptr was not allocated with this allocator");
        }
        let desc = unsafe { &*desc_ptr };

        if desc.is_oversized() {
            Heap::free_oversized(&PAGEMAP, &POOL, desc_ptr, ptr);
            return;
        }

        let sc_idx = desc.size_class();
        let cache_capacity = size_classes::get_size_class(sc_idx).cache_capacity;

        CACHE.with(|tc| {
            let mut cache = tc.cache.borrow_mut();
            cache.push(sc_idx, ptr);

            if cache.len(sc_idx) >= cache_capacity {
                let blocks: Vec<_> = cache.drain(sc_idx).collect();
                for block in blocks {
                    let block_desc = PAGEMAP.load(block);
                    Heap::flush_block(&PAGEMAP, &POOL, block_desc, block);
                }
            }
        });
    }

    /// Size of the usable allocation backing `ptr`, per the descriptor
    /// that owns its page. Equivalent to `malloc_usable_size`.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let desc_ptr = PAGEMAP.load(ptr);
        if desc_ptr.is_null() {
            return 0;
        }
        unsafe { (*desc_ptr).block_size() }
    }

    /// `calloc`: overflow-checked `n * size`, allocated and zeroed.
    pub unsafe fn calloc(&self, n: usize, size: usize) -> *mut u8 {
        let total = match n.checked_mul(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };

        // `total == 0` falls through to `allocate`, which already returns a
        // unique, freeable pointer for a zero-sized request; `calloc(0, s)`
        // should behave the same way rather than diverging into null.
        let layout = match Layout::from_size_align(total, std::mem::align_of::<usize>()) {
            Ok(l) => l,
            Err(_) => return ptr::null_mut(),
        };

        let p = unsafe { self.allocate(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// `realloc`: naive allocate-copy-free. The old usable size is read
    /// from the descriptor, not from a caller-supplied layout.
    pub unsafe fn reallocate(&self, old_ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        if old_ptr.is_null() {
            let layout = Layout::from_size_align(new_size, old_layout.align()).unwrap_or(old_layout);
            return unsafe { self.allocate(layout) };
        }
        if new_size == 0 {
            unsafe { self.deallocate(old_ptr, old_layout) };
            return ptr::null_mut();
        }

        let old_usable = unsafe { self.usable_size(old_ptr) };
        let new_layout = Layout::from_size_align(new_size, old_layout.align()).unwrap_or(old_layout);
        let new_ptr = unsafe { self.allocate(new_layout) };
        if new_ptr.is_null() {
            return new_ptr;
        }

        let copy_size = old_usable.min(new_size);
        unsafe { ptr::copy_nonoverlapping(old_ptr, new_ptr, copy_size) };
        unsafe { self.deallocate(old_ptr, old_layout) };
        new_ptr
    }

    /// `posix_memalign`: `align` must be a power of two and a multiple of
    /// `size_of::<*const ()>()`, matching `lrmalloc.h`'s `MIN_ALIGN`/
    /// `ALIGN_VAL` validation.
    pub unsafe fn posix_memalign(&self, align: usize, size: usize) -> Result<*mut u8, PosixMemalignError> {
        let ptr_size = std::mem::size_of::<*const ()>();
        if !align.is_power_of_two() || align % ptr_size != 0 {
            return Err(PosixMemalignError::InvalidAlignment);
        }

        let layout = Layout::from_size_align(size.max(1), align).map_err(|_| PosixMemalignError::InvalidAlignment)?;
        let p = unsafe { self.allocate(layout) };
        if p.is_null() {
            return Err(PosixMemalignError::OutOfMemory);
        }
        Ok(p)
    }

    /// `aligned_alloc`: over-requests `max(align, size) * 2` and hands
    /// back a forward-aligned pointer; if servicing this as an oversized
    /// mapping, the forward-aligned page is registered in the page map as
    /// well so a later `deallocate` on the aligned pointer resolves.
    pub unsafe fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }

        if size_classes::get_size_class_index(size.max(align)).is_some() {
            // A size class already guarantees the alignment check in
            // `allocate`; no over-request needed.
            let layout = match Layout::from_size_align(size, align) {
                Ok(l) => l,
                Err(_) => return ptr::null_mut(),
            };
            return unsafe { self.allocate(layout) };
        }

        let over_request = size.max(align) * 2;
        let base = match Heap::alloc_oversized(&PAGEMAP, &POOL, over_request) {
            Some(p) => p,
            None => return ptr::null_mut(),
        };

        let aligned = ((base as usize + align - 1) & !(align - 1)) as *mut u8;
        if aligned != base {
            let desc = PAGEMAP.load(base);
            PAGEMAP.register_page(aligned, desc);
        }
        aligned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosixMemalignError {
    InvalidAlignment,
    OutOfMemory,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { self.allocate(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.deallocate(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { self.reallocate(ptr, layout, new_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_dealloc_small() {
        let allocator = Allocator::new();
        let layout = Layout::new::<[u8; 128]>();
        let ptr = unsafe { allocator.allocate(layout) };
        assert!(!ptr.is_null());
        unsafe {
            ptr.write(0xAB);
            allocator.deallocate(ptr, layout);
        }
    }

    #[test]
    fn alloc_dealloc_oversized() {
        let allocator = Allocator::new();
        let layout = Layout::from_size_align(1 << 20, 8).unwrap();
        let ptr = unsafe { allocator.allocate(layout) };
        assert!(!ptr.is_null());
        unsafe { allocator.deallocate(ptr, layout) };
    }

    #[test]
    fn calloc_zeroes() {
        let allocator = Allocator::new();
        let ptr = unsafe { allocator.calloc(16, 8) };
        assert!(!ptr.is_null());
        let slice = unsafe { std::slice::from_raw_parts(ptr, 128) };
        assert!(slice.iter().all(|&b| b == 0));
        unsafe { allocator.deallocate(ptr, Layout::from_size_align(128, 8).unwrap()) };
    }

    #[test]
    fn calloc_overflow_returns_null() {
        let allocator = Allocator::new();
        let ptr = unsafe { allocator.calloc(usize::MAX, 2) };
        assert!(ptr.is_null());
    }

    #[test]
    fn realloc_grows_and_preserves_prefix() {
        let allocator = Allocator::new();
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = unsafe { allocator.allocate(layout) };
        unsafe { ptr.write_bytes(0x42, 32) };

        let grown = unsafe { allocator.reallocate(ptr, layout, 256) };
        assert!(!grown.is_null());
        let slice = unsafe { std::slice::from_raw_parts(grown, 32) };
        assert!(slice.iter().all(|&b| b == 0x42));

        unsafe { allocator.deallocate(grown, Layout::from_size_align(256, 8).unwrap()) };
    }

    #[test]
    fn posix_memalign_rejects_bad_alignment() {
        let allocator = Allocator::new();
        assert_eq!(
            unsafe { allocator.posix_memalign(3, 64) },
            Err(PosixMemalignError::InvalidAlignment)
        );
    }

    #[test]
    fn posix_memalign_returns_aligned_pointer() {
        let allocator = Allocator::new();
        let ptr = unsafe { allocator.posix_memalign(4096, 64) }.unwrap();
        assert_eq!(ptr as usize % 4096, 0);
        unsafe { allocator.deallocate(ptr, Layout::from_size_align(64, 4096).unwrap()) };
    }

    #[test]
    fn usable_size_matches_size_class() {
        let allocator = Allocator::new();
        let layout = Layout::from_size_align(10, 1).unwrap();
        let ptr = unsafe { allocator.allocate(layout) };
        let usable = unsafe { allocator.usable_size(ptr) };
        assert!(usable >= 10);
        unsafe { allocator.deallocate(ptr, layout) };
    }
}
