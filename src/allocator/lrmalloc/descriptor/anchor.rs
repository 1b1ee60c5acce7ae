//! The per-superblock anchor: a single 64-bit atomic word carrying the
//! superblock's lifecycle state, its local free-list head, the number of
//! free blocks still held, and an ABA-defense tag.
//!
//! Bit layout, high to low: `state(2) | avail(21) | count(21) | tag(20)`.
//! State ordering follows the original `SuperblockState` enum
//! (`SB_FULL = 0`, `SB_PARTIAL = 1`, `SB_EMPTY = 2`).

const STATE_SHIFT: u32 = 62;
const AVAIL_SHIFT: u32 = 41;
const COUNT_SHIFT: u32 = 20;
const TAG_SHIFT: u32 = 0;

const AVAIL_BITS: u32 = 21;
const COUNT_BITS: u32 = 21;
const TAG_BITS: u32 = 20;

const AVAIL_MASK: u64 = (1 << AVAIL_BITS) - 1;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Sentinel `avail` value meaning "no free block" (superblock is FULL).
pub const NO_AVAIL: u32 = AVAIL_MASK as u32;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AnchorState {
    Full,
    Partial,
    Empty,
}

impl From<u64> for AnchorState {
    fn from(raw: u64) -> Self {
        match raw {
            0 => Self::Full,
            1 => Self::Partial,
            2 => Self::Empty,
            _ => unreachable!("the Anchor state has been corrupted"),
        }
    }
}
impl From<AnchorState> for u64 {
    fn from(raw: AnchorState) -> Self {
        match raw {
            AnchorState::Full => 0,
            AnchorState::Partial => 1,
            AnchorState::Empty => 2,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Anchor {
    pub state: AnchorState,
    /// Index of the head of the superblock's local free list.
    pub avail: u32,
    /// Number of free, *unreserved* blocks still in the superblock.
    pub count: u32,
    /// Incremented on every successful CAS transition; ABA protection for
    /// readers racing a pop/reserve against a concurrent push/free.
    pub tag: u32,
}

impl Anchor {
    /// A brand-new superblock: every block free, nothing reserved yet.
    pub fn new_full(blocks_per_superblock: u32) -> Self {
        Self {
            state: AnchorState::Partial,
            avail: 0,
            count: blocks_per_superblock.saturating_sub(1),
            tag: 0,
        }
    }

    /// Returns a copy with the tag advanced, wrapping within its field width.
    pub fn next_tag(self) -> u32 {
        (self.tag.wrapping_add(1)) & (TAG_MASK as u32)
    }
}

impl From<u64> for Anchor {
    fn from(raw: u64) -> Self {
        let state = ((raw >> STATE_SHIFT) & 0b11).into();
        let avail = ((raw >> AVAIL_SHIFT) & AVAIL_MASK) as u32;
        let count = ((raw >> COUNT_SHIFT) & COUNT_MASK) as u32;
        let tag = ((raw >> TAG_SHIFT) & TAG_MASK) as u32;

        Self {
            state,
            avail,
            count,
            tag,
        }
    }
}
impl From<Anchor> for u64 {
    fn from(raw: Anchor) -> Self {
        let state_bits: u64 = u64::from(raw.state) << STATE_SHIFT;
        let avail_bits: u64 = ((raw.avail as u64) & AVAIL_MASK) << AVAIL_SHIFT;
        let count_bits: u64 = ((raw.count as u64) & COUNT_MASK) << COUNT_SHIFT;
        let tag_bits: u64 = ((raw.tag as u64) & TAG_MASK) << TAG_SHIFT;

        state_bits | avail_bits | count_bits | tag_bits
    }
}
