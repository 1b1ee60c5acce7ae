//! Per-size-class heap: owns the partial-superblock list and drives the
//! Fill/Flush engine that moves blocks between superblocks and a thread
//! cache in bulk.
//!
//! Grounded in `lfmalloc.cpp`'s `MallocFromPartial`/`MallocFromNewSB`/
//! `FillCache`/`FlushCache`, with one deliberate simplification noted as
//! an Open Question in `DESIGN.md`: this implementation has no "active
//! superblock" slot or credits scheme. The thread cache already serves
//! that role (it is the fast, atomic-free path), so each `Fill` call
//! reserves as many blocks as it needs directly from the partial list or a
//! freshly minted superblock, rather than staging reservations through an
//! extra per-heap slot.

pub mod partial;

use crate::sync::atomic::Ordering;

use super::descriptor::anchor::{Anchor, AnchorState};
use super::descriptor::pool::DescriptorPool;
use super::descriptor::Descriptor;
use super::page;
use super::pagemap::PageMap;
use super::size_classes::{self, try_narrow};

pub struct Heap {
    partial: partial::PartialList,
    size_class: usize,
}

impl Heap {
    pub const fn new(size_class: usize) -> Self {
        Self {
            partial: partial::PartialList::new(),
            size_class,
        }
    }

    pub fn size_class(&self) -> usize {
        self.size_class
    }

    /// Pulls up to `want` blocks into the caller's buffer, reserving from
    /// partial superblocks first and minting fresh ones only once the
    /// partial list runs dry. Returns fewer than `want` blocks only on
    /// OS-level allocation failure.
    pub fn fill(&self, pagemap: &PageMap, pool: &DescriptorPool, want: usize) -> Vec<*mut u8> {
        let mut collected = Vec::with_capacity(want);

        while collected.len() < want {
            if let Some(desc) = self.partial.pop() {
                match reserve_blocks(desc, want - collected.len()) {
                    Some((mut blocks, still_partial)) => {
                        collected.append(&mut blocks);
                        if still_partial {
                            self.partial.push(desc);
                        }
                    }
                    None => {
                        // Observed Empty on a descriptor taken off the
                        // partial list. Matches the defensive retry in
                        // the original `MallocFromPartial`.
                        pool.retire(desc);
                    }
                }
                continue;
            }

            match self.mint_superblock(pagemap, pool) {
                Some(desc) => {
                    let (mut blocks, still_partial) = reserve_blocks(desc, want - collected.len())
                        .expect("freshly minted superblock cannot be Empty");
                    collected.append(&mut blocks);
                    if still_partial {
                        self.partial.push(desc);
                    }
                }
                None => break,
            }
        }

        collected
    }

    fn mint_superblock(&self, pagemap: &PageMap, pool: &DescriptorPool) -> Option<*mut Descriptor> {
        let sc = size_classes::get_size_class(self.size_class);
        let superblock = page::alloc(sc.sb_size)?;

        // Wire the intrusive free list over every block but the last;
        // the last block's next-index is never read (count tops out at
        // blocks_per_superblock - 1 before the superblock is full).
        for idx in 0..sc.blocks_per_superblock.saturating_sub(1) {
            let slot = (superblock.as_ptr() as usize + idx * sc.block_size) as *mut usize;
            unsafe { slot.write(idx + 1) };
        }

        let desc = pool.alloc();
        let anchor = Anchor::new_full(try_narrow(sc.blocks_per_superblock));
        unsafe {
            (*desc).bind(
                superblock.as_ptr(),
                sc.block_size,
                sc.blocks_per_superblock,
                self.size_class,
                self as *const Heap as *mut Heap,
                anchor,
            );
        }

        // Must happen before the descriptor is reachable from anywhere
        // else (partial list, thread cache blocks handed to a caller).
        pagemap.register(superblock.as_ptr(), sc.sb_size, desc);

        log::trace!(
            "minted superblock for size class {} ({} blocks of {} bytes)",
            self.size_class,
            sc.blocks_per_superblock,
            sc.block_size
        );

        Some(desc)
    }

    /// Returns a single block to its owning superblock, possibly
    /// unmapping the superblock and retiring the descriptor if this was
    /// the last outstanding block. The heap this dispatches to is read
    /// off the descriptor itself, since a thread cache flush may not know
    /// which heap originated a given block ahead of time.
    pub fn flush_block(pagemap: &PageMap, pool: &DescriptorPool, desc_ptr: *mut Descriptor, ptr: *mut u8) {
        let desc = unsafe { &*desc_ptr };
        let idx = desc.block_index(ptr);
        let max_count = desc.max_count();
        let block_size = desc.block_size();
        let superblock = desc.superblock_ptr();

        let anchor_word = desc.anchor();
        let mut old: Anchor = anchor_word.load(Ordering::Acquire).into();
        let mut new;
        loop {
            // Stitch ptr onto the head of the free list before publishing it.
            unsafe { (ptr as *mut usize).write(old.avail as usize) };

            new = old;
            new.avail = try_narrow(idx);
            if old.state == AnchorState::Full {
                // The freed block becomes the list's only entry: list
                // length 1 == count(0) + 1. Do not also increment count,
                // or the avail-list-length invariant breaks for the next
                // `reserve_blocks` walk.
                new.state = AnchorState::Partial;
            } else if old.count as usize == max_count - 2 {
                // total_free before this free was count+1 == max_count-1;
                // this is the last outstanding block.
                new.state = AnchorState::Empty;
            } else {
                new.count += 1;
            }
            new.tag = old.next_tag();

            match anchor_word.compare_exchange_weak(old.into(), new.into(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(cur) => old = cur.into(),
            }
        }

        // Past this point desc may already be recycled by another thread;
        // only touch locals captured before the CAS.
        if new.state == AnchorState::Empty {
            let sb_size = block_size * max_count;
            pagemap.unregister(superblock, sb_size);
            unsafe {
                page::free(
                    std::ptr::NonNull::new(superblock).expect("superblock pointer is never null"),
                    sb_size,
                );
            }
            pool.retire(desc_ptr);
        } else if old.state == AnchorState::Full {
            let heap = unsafe { &*desc.heap() };
            heap.partial.push(desc_ptr);
        }
    }

    /// Services an oversized request directly: one descriptor, one
    /// dedicated mapping, no size class involved (`desc.heap()` is null).
    pub fn alloc_oversized(pagemap: &PageMap, pool: &DescriptorPool, size: usize) -> Option<*mut u8> {
        let mapped = page::page_ceiling(size);
        let region = page::alloc(mapped)?;

        let desc = pool.alloc();
        unsafe {
            (*desc).bind(
                region.as_ptr(),
                mapped,
                1,
                0,
                std::ptr::null_mut(),
                Anchor {
                    state: AnchorState::Full,
                    avail: 0,
                    count: 0,
                    tag: 0,
                },
            );
        }
        pagemap.register(region.as_ptr(), mapped, desc);

        Some(region.as_ptr())
    }

    pub fn free_oversized(pagemap: &PageMap, pool: &DescriptorPool, desc_ptr: *mut Descriptor, ptr: *mut u8) {
        let desc = unsafe { &*desc_ptr };
        let size = desc.block_size();
        pagemap.unregister(ptr, size);
        unsafe {
            page::free(std::ptr::NonNull::new(ptr).expect("oversized pointer is never null"), size);
        }
        pool.retire(desc_ptr);
    }
}

/// Reserves up to `want` blocks from `desc`'s free list, in the two-phase
/// scheme described by the anchor protocol: phase one claims the blocks by
/// CAS-ing `count`/`state`, phase two walks the intrusive free list to find
/// the new `avail` head and publishes it. Returns `None` if the descriptor
/// was observed `Empty` (nothing to reserve); otherwise the reserved block
/// pointers and whether the descriptor is still `Partial` afterwards.
fn reserve_blocks(desc_ptr: *mut Descriptor, want: usize) -> Option<(Vec<*mut u8>, bool)> {
    let desc = unsafe { &*desc_ptr };
    let anchor_word = desc.anchor();

    let reserved;
    let still_partial;
    let mut old: Anchor = anchor_word.load(Ordering::Acquire).into();
    loop {
        if old.state == AnchorState::Empty {
            return None;
        }

        // Partial guarantees at least one free block at `avail`.
        let total_free = old.count as usize + 1;
        let take = want.min(total_free);
        let remaining = total_free - take;

        let mut new = old;
        new.count = if remaining == 0 { 0 } else { (remaining - 1) as u32 };
        new.state = if remaining == 0 { AnchorState::Full } else { AnchorState::Partial };
        new.tag = old.next_tag();

        match anchor_word.compare_exchange_weak(old.into(), new.into(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                reserved = take;
                still_partial = remaining > 0;
                break;
            }
            Err(cur) => old = cur.into(),
        }
    }

    let block_size = desc.block_size();
    let max_count = desc.max_count();
    let superblock = desc.superblock_ptr();

    let mut blocks = Vec::with_capacity(reserved);
    let mut old2: Anchor = anchor_word.load(Ordering::Acquire).into();
    loop {
        blocks.clear();
        let mut idx = old2.avail;
        let mut walk_ok = true;

        for _ in 0..reserved {
            if idx as usize >= max_count {
                walk_ok = false;
                break;
            }
            let block_ptr = (superblock as usize + idx as usize * block_size) as *mut u8;
            blocks.push(block_ptr);
            idx = unsafe { (block_ptr as *mut usize).read() } as u32;
        }

        if !walk_ok {
            old2 = anchor_word.load(Ordering::Acquire).into();
            continue;
        }

        let mut new2 = old2;
        new2.avail = idx;
        new2.tag = old2.next_tag();

        match anchor_word.compare_exchange_weak(old2.into(), new2.into(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(cur) => old2 = cur.into(),
        }
    }

    Some((blocks, still_partial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::lrmalloc::descriptor::pool::DescriptorPool;
    use crate::allocator::lrmalloc::pagemap::PageMap;

    #[test]
    fn fill_then_flush_roundtrip() {
        let pool = DescriptorPool::new();
        let pagemap = PageMap::new();
        let sc_idx = size_classes::get_size_class_index(64).unwrap();
        let heap = Heap::new(sc_idx);

        let sc = size_classes::get_size_class(sc_idx);
        let blocks = heap.fill(&pagemap, &pool, sc.cache_capacity);
        assert_eq!(blocks.len(), sc.cache_capacity);

        let mut seen = std::collections::HashSet::new();
        for b in &blocks {
            assert!(seen.insert(*b as usize), "fill handed out a duplicate block");
        }

        for b in blocks {
            let desc = pagemap.load(b);
            assert!(!desc.is_null());
            Heap::flush_block(&pagemap, &pool, desc, b);
        }
    }

    #[test]
    fn refill_after_full_superblock_cycle() {
        let pool = DescriptorPool::new();
        let pagemap = PageMap::new();
        let sc_idx = size_classes::get_size_class_index(64).unwrap();
        let heap = Heap::new(sc_idx);
        let sc = size_classes::get_size_class(sc_idx);

        // Drive a superblock to Full, then flush every block back
        // (Full -> Partial -> ... -> Empty would unmap it; flushing all
        // but leaving the descriptor reachable requires re-filling before
        // the last block goes back, so fill once more before the
        // superblock empties out entirely).
        let first = heap.fill(&pagemap, &pool, sc.cache_capacity);
        assert_eq!(first.len(), sc.cache_capacity);
        for &b in &first {
            let desc = pagemap.load(b);
            Heap::flush_block(&pagemap, &pool, desc, b);
        }

        // The superblock just emptied out and was retired; this exercises
        // the fresh-mint path a second time and must not hand out a block
        // that overlaps the first round's (now-freed) addresses being
        // reused legitimately, nor hang.
        let second = heap.fill(&pagemap, &pool, sc.cache_capacity);
        assert_eq!(second.len(), sc.cache_capacity);

        let mut seen = std::collections::HashSet::new();
        for b in &second {
            assert!(seen.insert(*b as usize), "fill handed out a duplicate block");
        }

        for b in second {
            let desc = pagemap.load(b);
            Heap::flush_block(&pagemap, &pool, desc, b);
        }
    }

    #[test]
    fn partial_refill_after_partial_flush_has_no_duplicates() {
        let pool = DescriptorPool::new();
        let pagemap = PageMap::new();
        let sc_idx = size_classes::get_size_class_index(64).unwrap();
        let heap = Heap::new(sc_idx);
        let sc = size_classes::get_size_class(sc_idx);
        assert!(sc.cache_capacity >= 4, "size class too small for this test");

        // Fill the whole superblock (Full), flush back all but one block
        // (Full -> Partial, then several more frees while Partial), then
        // fill again for fewer blocks than are free: this walks the
        // free-list chain built by `flush_block`, including the very
        // first link it wrote during the Full -> Partial transition.
        let all = heap.fill(&pagemap, &pool, sc.cache_capacity);
        let (to_free, kept) = all.split_at(all.len() - 1);
        for &b in to_free {
            let desc = pagemap.load(b);
            Heap::flush_block(&pagemap, &pool, desc, b);
        }

        let refilled = heap.fill(&pagemap, &pool, to_free.len());
        assert_eq!(refilled.len(), to_free.len());

        let mut seen = std::collections::HashSet::new();
        for b in kept.iter().chain(refilled.iter()) {
            assert!(seen.insert(*b as usize), "fill handed out a duplicate block");
        }

        for b in kept.iter().chain(refilled.iter()) {
            let desc = pagemap.load(*b);
            Heap::flush_block(&pagemap, &pool, desc, *b);
        }
    }

    #[test]
    fn oversized_roundtrip() {
        let pool = DescriptorPool::new();
        let pagemap = PageMap::new();

        let ptr = Heap::alloc_oversized(&pagemap, &pool, 1 << 20).unwrap();
        let desc = pagemap.load(ptr);
        assert!(!desc.is_null());

        Heap::free_oversized(&pagemap, &pool, desc, ptr);
        assert!(pagemap.load(ptr).is_null());
    }
}
