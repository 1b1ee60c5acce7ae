pub mod anchor;
pub mod pool;
pub mod tagged;

use crate::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use anchor::Anchor;

use super::heap::Heap;

/// A superblock descriptor: cache-line-aligned, heap-allocated in bulk by
/// the descriptor pool, and never freed for the life of the process.
///
/// Fields other than `anchor` and the two link words are written exactly
/// once per "lease" of the descriptor (when it's carved out of the pool and
/// wired up to a freshly minted superblock) by the thread that owns it at
/// that moment, before the descriptor is published into the page map. The
/// page map's release store on registration, paired with the acquire load
/// on lookup, is what makes reading these plain fields from another thread
/// sound; see `pagemap::register_descriptor`.
#[repr(align(64))]
pub struct Descriptor {
    anchor: AtomicU64,
    free_list_next: AtomicUsize,
    partial_next: AtomicUsize,
    superblock: AtomicPtr<u8>,
    /// Null for the dedicated descriptor of an oversized allocation.
    heap: AtomicPtr<Heap>,
    block_size: AtomicUsize,
    max_count: AtomicUsize,
    size_class: AtomicUsize,
}

impl Descriptor {
    /// Wires a descriptor, just popped from the pool, to a freshly minted
    /// superblock. Only sound while the descriptor is not yet reachable
    /// from the page map or any partial list.
    pub fn bind(
        &self,
        superblock: *mut u8,
        block_size: usize,
        max_count: usize,
        size_class: usize,
        heap: *mut Heap,
        anchor: Anchor,
    ) {
        self.superblock.store(superblock, Ordering::Relaxed);
        self.block_size.store(block_size, Ordering::Relaxed);
        self.max_count.store(max_count, Ordering::Relaxed);
        self.size_class.store(size_class, Ordering::Relaxed);
        self.heap.store(heap, Ordering::Relaxed);
        self.anchor.store(anchor.into(), Ordering::Release);
    }

    pub fn anchor(&self) -> &AtomicU64 {
        &self.anchor
    }

    pub fn free_list_next(&self) -> &AtomicUsize {
        &self.free_list_next
    }

    pub fn partial_next(&self) -> &AtomicUsize {
        &self.partial_next
    }

    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Relaxed)
    }

    pub fn max_count(&self) -> usize {
        self.max_count.load(Ordering::Relaxed)
    }

    pub fn size_class(&self) -> usize {
        self.size_class.load(Ordering::Relaxed)
    }

    pub fn superblock_ptr(&self) -> *mut u8 {
        self.superblock.load(Ordering::Relaxed)
    }

    /// Null iff this descriptor owns an oversized (dedicated) allocation.
    pub fn heap(&self) -> *mut Heap {
        self.heap.load(Ordering::Relaxed)
    }

    pub fn is_oversized(&self) -> bool {
        self.heap().is_null()
    }

    /// Computes the block index of `ptr` within this descriptor's
    /// superblock, re-canonicalizing a pointer that a caller may have
    /// forward-aligned (aligned_alloc/posix_memalign).
    pub fn block_index(&self, ptr: *mut u8) -> usize {
        let base = self.superblock_ptr() as usize;
        let block_size = self.block_size();
        (ptr as usize - base) / block_size
    }

    pub fn block_at(&self, index: usize) -> *mut u8 {
        let base = self.superblock_ptr() as usize;
        (base + index * self.block_size()) as *mut u8
    }

    pub fn contains(&self, ptr: *mut u8) -> bool {
        let ptr_value = ptr as usize;
        let lower_bound = self.superblock_ptr() as usize;
        let upper_bound = lower_bound + self.block_size() * self.max_count();

        lower_bound <= ptr_value && ptr_value < upper_bound
    }
}
