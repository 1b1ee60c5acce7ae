use std::alloc::{GlobalAlloc, Layout};
use std::collections::HashSet;
use std::thread;

use lrmalloc::allocator::lrmalloc;

#[global_allocator]
static ALLOCATOR: lrmalloc::Allocator = lrmalloc::Allocator::new();

#[test]
fn large_alloc() {
    let test: Box<[u8; 20000]> = Box::new([0; 20000]);
    drop(test);
}

#[test]
fn randomized_alloc_free_pattern() {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut live: Vec<(*mut u8, Layout)> = Vec::new();

    for _ in 0..5000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=8192);
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = unsafe { ALLOCATOR.alloc(layout) };
            assert!(!ptr.is_null());
            unsafe { ptr.write_bytes(0xCD, size) };
            live.push((ptr, layout));
        } else {
            let idx = rng.gen_range(0..live.len());
            let (ptr, layout) = live.swap_remove(idx);
            unsafe { ALLOCATOR.dealloc(ptr, layout) };
        }
    }

    for (ptr, layout) in live {
        unsafe { ALLOCATOR.dealloc(ptr, layout) };
    }
}

#[test]
fn multi_threaded_alloc_free() {
    let handles: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(|| {
                let mut ptrs = Vec::new();
                let layout = Layout::from_size_align(64, 8).unwrap();
                for _ in 0..2000 {
                    let ptr = unsafe { ALLOCATOR.alloc(layout) };
                    assert!(!ptr.is_null());
                    ptrs.push(ptr);
                }
                for ptr in ptrs {
                    unsafe { ALLOCATOR.dealloc(ptr, layout) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

/// Allocates enough blocks from one size class to span several
/// superblocks, frees every block in reverse order, and checks nothing
/// panics or corrupts state when a superblock transitions Partial ->
/// Empty and gets unmapped mid-sequence.
#[test]
fn superblock_empty_unmap_on_reverse_free() {
    let layout = Layout::from_size_align(32, 8).unwrap();
    let mut ptrs: Vec<*mut u8> = (0..4000)
        .map(|_| {
            let ptr = unsafe { ALLOCATOR.alloc(layout) };
            assert!(!ptr.is_null());
            ptr
        })
        .collect();

    let mut seen = HashSet::new();
    for ptr in &ptrs {
        assert!(seen.insert(*ptr as usize), "allocator handed out a duplicate pointer");
    }

    ptrs.reverse();
    for ptr in ptrs {
        unsafe { ALLOCATOR.dealloc(ptr, layout) };
    }
}

#[test]
fn oversized_allocation_and_usable_size() {
    let size = 4 * 1024 * 1024;
    let layout = Layout::from_size_align(size, 8).unwrap();
    let ptr = unsafe { ALLOCATOR.alloc(layout) };
    assert!(!ptr.is_null());

    let usable = unsafe { ALLOCATOR.usable_size(ptr) };
    assert!(usable >= size);

    unsafe {
        ptr.write_bytes(0x11, size);
        ALLOCATOR.dealloc(ptr, layout);
    }
}

#[test]
fn aligned_allocate_across_threads() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let align = 1usize << (12 + (i % 3));
                let ptr = unsafe { ALLOCATOR.aligned_allocate(align, 256) };
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % align, 0);
                ptr
            })
        })
        .collect();

    let ptrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for ptr in ptrs {
        unsafe { ALLOCATOR.deallocate(ptr, Layout::from_size_align(256, 8).unwrap()) };
    }
}
