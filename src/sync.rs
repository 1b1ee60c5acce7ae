//! Swaps in `loom`'s shadow atomics when model-checking under `cfg(loom)`,
//! plain `std::sync` otherwise. Every atomic type used by the allocator is
//! imported from here rather than directly from `std::sync::atomic`.

#[cfg(loom)]
pub(crate) use loom::sync::atomic;

#[cfg(not(loom))]
pub(crate) use std::sync::atomic;
