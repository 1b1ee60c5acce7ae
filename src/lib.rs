//! A lock-free, thread-caching general purpose memory allocator.
//!
//! Install [`allocator::lrmalloc::Allocator`] as the process's
//! `#[global_allocator]` to route every `Box`/`Vec`/`String` allocation
//! through it, or use its inherent methods directly for a C-style
//! malloc/calloc/realloc/posix_memalign surface.

#![warn(rust_2018_idioms)]

pub mod allocator;

pub(crate) mod sync;
