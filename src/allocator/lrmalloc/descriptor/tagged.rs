//! ABA-safe tagged pointers and the Treiber stack built on top of them.
//!
//! Grounded directly in the original `DescriptorNode`: a small counter is
//! packed into the low bits of a cache-line-aligned `Descriptor*`, since
//! every descriptor is aligned to `CACHELINE` (64) bytes and therefore has
//! 6 free low bits. This sidesteps the need for a double-word CAS: a single
//! `AtomicUsize` carries both the pointer and the counter.

use crate::sync::atomic::{AtomicUsize, Ordering};

use super::Descriptor;

const CACHELINE: usize = 64;
const TAG_MASK: usize = CACHELINE - 1;

/// A `*mut Descriptor` with a counter packed into its low 6 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorNode(usize);

impl DescriptorNode {
    pub const NULL: DescriptorNode = DescriptorNode(0);

    pub fn new(desc: *mut Descriptor, tag: usize) -> Self {
        let addr = desc as usize;
        debug_assert_eq!(
            addr & TAG_MASK,
            0,
            "descriptor must be cache-line aligned to carry an ABA tag"
        );
        DescriptorNode(addr | (tag & TAG_MASK))
    }

    pub fn desc(self) -> *mut Descriptor {
        (self.0 & !TAG_MASK) as *mut Descriptor
    }

    pub fn tag(self) -> usize {
        self.0 & TAG_MASK
    }

    pub fn is_null(self) -> bool {
        self.desc().is_null()
    }

    fn to_raw(self) -> usize {
        self.0
    }

    fn from_raw(raw: usize) -> Self {
        DescriptorNode(raw)
    }
}

/// A lock-free, ABA-safe stack of descriptors. The "next" link for each
/// node lives inside the `Descriptor` itself (selected by `next_of`), so
/// this type owns only the head.
pub struct TaggedStack {
    head: AtomicUsize,
}

impl TaggedStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    /// Pushes `desc` onto the stack. `next_of` selects which of the
    /// descriptor's two link fields (free-list or partial-list) this stack
    /// uses, so the same descriptor can sit in two different stacks'
    /// bookkeeping without needing two descriptor types.
    ///
    /// # Safety
    /// `desc` must be a valid, cache-line-aligned, permanently-live
    /// descriptor pointer (guaranteed by the descriptor pool never
    /// unmapping descriptor memory).
    pub unsafe fn push(&self, desc: *mut Descriptor, next_of: impl Fn(&Descriptor) -> &AtomicUsize) {
        let next_field = unsafe { next_of(&*desc) };
        loop {
            let old = DescriptorNode::from_raw(self.head.load(Ordering::Acquire));
            next_field.store(old.to_raw(), Ordering::Relaxed);

            let new = DescriptorNode::new(desc, old.tag().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.to_raw(), new.to_raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pushes an already-linked chain `first -> .. -> last` onto the stack
    /// in one CAS loop, splicing the old head in as `last`'s successor.
    /// Used by the descriptor pool when it mints a fresh batch of
    /// descriptors and publishes all but the first of them at once.
    ///
    /// # Safety
    /// Same as [`TaggedStack::push`]; additionally every descriptor in the
    /// chain from `first` to `last` (inclusive) must already be linked via
    /// `next_of`.
    pub unsafe fn push_chain(
        &self,
        first: *mut Descriptor,
        last: *mut Descriptor,
        next_of: impl Fn(&Descriptor) -> &AtomicUsize,
    ) {
        let last_next = unsafe { next_of(&*last) };
        loop {
            let old = DescriptorNode::from_raw(self.head.load(Ordering::Acquire));
            last_next.store(old.to_raw(), Ordering::Relaxed);

            let new = DescriptorNode::new(first, old.tag().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.to_raw(), new.to_raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pops the top descriptor, or `None` if the stack is empty.
    ///
    /// # Safety
    /// Every descriptor ever pushed through this stack must remain a valid
    /// pointer for the lifetime of the program (the descriptor pool
    /// invariant).
    pub unsafe fn pop(&self, next_of: impl Fn(&Descriptor) -> &AtomicUsize) -> Option<*mut Descriptor> {
        loop {
            let old = DescriptorNode::from_raw(self.head.load(Ordering::Acquire));
            if old.is_null() {
                return None;
            }

            let next_field = unsafe { next_of(&*old.desc()) };
            let next_raw = next_field.load(Ordering::Relaxed);
            let next_desc = DescriptorNode::from_raw(next_raw).desc();

            let new = DescriptorNode::new(next_desc, old.tag().wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(old.to_raw(), new.to_raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(old.desc());
            }
        }
    }
}

impl Default for TaggedStack {
    fn default() -> Self {
        Self::new()
    }
}
