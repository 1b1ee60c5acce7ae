//! Size-class table: maps a requested byte size to a size-class index and
//! the immutable geometry (block size, superblock size, blocks per
//! superblock) that index implies.
//!
//! The block-size progression below is the same shape the original
//! `size_classes.cpp` generates from its `lg_grp`/`lg_delta` macros (roughly
//! doubling, with a few linear steps in between), extended down to an
//! 8-byte minimum block the way the C table does, instead of starting at
//! 1024 bytes. Index 0 is reserved for "too large for any class".

use std::convert::TryFrom;

/// Minimum number of blocks a superblock must carve out of a size class,
/// so a very large block size doesn't end up with single-block
/// superblocks (which would make the partial-list machinery pointless).
const MIN_BLOCKS_PER_SUPERBLOCK: usize = 8;

const BLOCK_SIZES: &[usize] = &[
    8, 16, 24, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896,
    1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192, 10240, 12288,
    14336, 16384,
];

/// Immutable per-size-class geometry, computed once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SizeClass {
    /// Size of a single block, in bytes. Zero for the reserved oversized slot.
    pub block_size: usize,
    /// Size of one superblock for this class. Always a multiple of the
    /// system page size.
    pub sb_size: usize,
    /// `sb_size / block_size`, exactly (no tail waste).
    pub blocks_per_superblock: usize,
    /// How many blocks `Fill` pulls into a thread cache bin at once.
    pub cache_capacity: usize,
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn build_size_class(block_size: usize, page_size: usize) -> SizeClass {
    let k = block_size / gcd(block_size, page_size);
    let mut sb_size = page_size * k;
    let mut blocks_per_superblock = sb_size / block_size;

    if blocks_per_superblock < MIN_BLOCKS_PER_SUPERBLOCK {
        let factor =
            (MIN_BLOCKS_PER_SUPERBLOCK + blocks_per_superblock - 1) / blocks_per_superblock;
        sb_size *= factor;
        blocks_per_superblock *= factor;
    }

    debug_assert_eq!(sb_size % page_size, 0);
    debug_assert_eq!(block_size * blocks_per_superblock, sb_size);

    SizeClass {
        block_size,
        sb_size,
        blocks_per_superblock,
        cache_capacity: blocks_per_superblock,
    }
}

struct SizeClassTable {
    classes: Vec<SizeClass>,
    /// `lookup[n]` is the index of the smallest class whose block_size >= n,
    /// for `n` in `0..=max_size()`.
    lookup: Vec<usize>,
}

impl SizeClassTable {
    fn build() -> Self {
        let page_size = super::page::page_size();

        let mut classes = Vec::with_capacity(BLOCK_SIZES.len() + 1);
        classes.push(SizeClass {
            block_size: 0,
            sb_size: 0,
            blocks_per_superblock: 0,
            cache_capacity: 0,
        });
        for &block_size in BLOCK_SIZES {
            classes.push(build_size_class(block_size, page_size));
        }

        let max_size = BLOCK_SIZES[BLOCK_SIZES.len() - 1];
        let mut lookup = vec![0usize; max_size + 1];
        let mut idx = 0usize;
        for (class_idx, class) in classes.iter().enumerate().skip(1) {
            while idx <= class.block_size {
                lookup[idx] = class_idx;
                idx += 1;
            }
        }

        SizeClassTable { classes, lookup }
    }
}

lazy_static::lazy_static! {
    static ref TABLE: SizeClassTable = SizeClassTable::build();
}

/// Number of size classes, including the reserved oversized slot at index 0.
pub fn size_class_count() -> usize {
    TABLE.classes.len()
}

/// Largest size serviceable by a real (non-oversized) size class.
pub fn max_size() -> usize {
    TABLE.lookup.len() - 1
}

/// Looks up the size-class index for a requested allocation size.
/// Returns `None` for sizes too large for any class; the caller should
/// service these as an oversized allocation instead.
pub fn get_size_class_index(size: usize) -> Option<usize> {
    TABLE.lookup.get(size).copied().filter(|&idx| idx != 0)
}

/// Returns the geometry for a size-class index. Panics on an out-of-range
/// index; callers only ever pass indices handed back by
/// [`get_size_class_index`] or iterate `1..size_class_count()`.
pub fn get_size_class(index: usize) -> SizeClass {
    TABLE.classes[index]
}

pub fn get_block_size(index: usize) -> usize {
    TABLE.classes[index].block_size
}

/// `usize -> u32` narrowing used when packing counts into the anchor word.
pub fn try_narrow(value: usize) -> u32 {
    u32::try_from(value).expect("size class geometry exceeds anchor field width")
}
