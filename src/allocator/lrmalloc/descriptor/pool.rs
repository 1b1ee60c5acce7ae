//! The descriptor pool: a lock-free stack of never-freed, cache-line-sized
//! descriptors, minted in bulk on exhaustion.
//!
//! Grounded in `DescAlloc`/`DescRetire` from the original `lfmalloc.cpp`.
//! `Descriptor` is exactly one cache line (`#[repr(align(64))]`, and its
//! field layout happens to total 64 bytes), so a freshly mmap'd,
//! page-aligned block of memory can be sliced directly into descriptor
//! slots with no extra alignment arithmetic.

use crate::sync::atomic::Ordering;

use super::tagged::TaggedStack;
use super::Descriptor;
use crate::allocator::lrmalloc::page;

/// How many pages to request per bulk mint. Matches the original
/// `DESCRIPTOR_BLOCK_SZ = 16 * PAGE`.
const MINT_PAGES: usize = 16;

pub struct DescriptorPool {
    free: TaggedStack,
}

impl DescriptorPool {
    pub const fn new() -> Self {
        Self {
            free: TaggedStack::new(),
        }
    }

    /// Pops a descriptor off the free stack, minting a fresh batch first if
    /// the pool is empty. Returns a descriptor that is not yet reachable
    /// from any page map entry or partial list; the caller must `bind` it
    /// before publishing it anywhere.
    pub fn alloc(&self) -> *mut Descriptor {
        if let Some(desc) = unsafe { self.free.pop(|d| d.free_list_next()) } {
            return desc;
        }

        self.mint_batch()
    }

    pub fn retire(&self, desc: *mut Descriptor) {
        unsafe { self.free.push(desc, |d| d.free_list_next()) };
    }

    fn mint_batch(&self) -> *mut Descriptor {
        let page_size = page::page_size();
        let block_bytes = page_size * MINT_PAGES;
        let region = page::alloc(block_bytes).unwrap_or_else(|| {
            log::warn!("descriptor pool mint failed, OS refused {} bytes", block_bytes);
            std::process::abort();
        });

        log::trace!("descriptor pool minted {} bytes for new descriptors", block_bytes);

        let desc_size = std::mem::size_of::<Descriptor>();
        debug_assert_eq!(desc_size, 64, "Descriptor must occupy exactly one cache line");
        let count = block_bytes / desc_size;
        debug_assert!(count >= 2);

        let base = region.as_ptr() as *mut Descriptor;
        for i in 0..count {
            unsafe {
                base.add(i).write(std::mem::zeroed());
            }
        }

        // First slot is returned directly to the caller without ever
        // touching the shared stack. The rest are chained and published
        // in one CAS, mirroring `DescAlloc`'s bulk-mint path.
        let ret = base;
        let chain_first = unsafe { base.add(1) };
        let chain_last = unsafe { base.add(count - 1) };

        for i in 1..count - 1 {
            let curr = unsafe { &*base.add(i) };
            let next = unsafe { base.add(i + 1) };
            curr.free_list_next().store(next as usize, Ordering::Relaxed);
        }
        unsafe { (*chain_last).free_list_next().store(0, Ordering::Relaxed) };

        if count > 1 {
            unsafe {
                self.free
                    .push_chain(chain_first, chain_last, |d| d.free_list_next())
            };
        }

        ret
    }
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new()
    }
}
