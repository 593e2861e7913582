//! Integration tests for the stack allocator

use core::ptr::NonNull;

use xmem::prelude::*;

fn backing(size: usize) -> (Vec<u8>, MemoryRegion) {
    let mut buf = vec![0u8; size];
    let start = NonNull::new(buf.as_mut_ptr()).unwrap();
    // SAFETY: the buffer outlives the region in every test below.
    let region = unsafe { MemoryRegion::new(start, size) };
    (buf, region)
}

#[test]
fn test_stack_basic_write_read() {
    let (_buf, region) = backing(4096);
    let mut stack = StackAllocator::new(region).expect("failed to create stack allocator");

    let ptr = stack.alloc(128, 8).expect("allocation failed");
    unsafe {
        core::ptr::write_bytes(ptr.as_ptr(), 0x55, 128);
        assert_eq!(*ptr.as_ptr(), 0x55);
        assert_eq!(*ptr.as_ptr().add(127), 0x55);
    }
    assert!(stack.contains(ptr));
}

#[test]
fn test_stack_nested_checkpoints() {
    let (_buf, region) = backing(4096);
    let mut stack = StackAllocator::new(region).unwrap();

    let outer = stack.checkpoint();
    let _a = stack.alloc(64, 8).unwrap();

    let middle = stack.checkpoint();
    let _b = stack.alloc(64, 8).unwrap();

    let inner = stack.checkpoint();
    let _c = stack.alloc(64, 8).unwrap();

    stack.restore(inner).unwrap();
    stack.restore(middle).unwrap();
    stack.restore(outer).unwrap();

    assert!(stack.is_empty());
    assert_eq!(stack.unused_bytes(), 0);
}

#[test]
fn test_stack_restore_reuses_space() {
    let (_buf, region) = backing(4096);
    let mut stack = StackAllocator::new(region).unwrap();

    let mark = stack.checkpoint();
    let first = stack.alloc(64, 8).unwrap();
    stack.restore(mark).unwrap();

    let second = stack.alloc(64, 8).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_stack_alignment_series() {
    let (_buf, region) = backing(8192);
    let mut stack = StackAllocator::new(region).unwrap();

    for align in [1usize, 2, 4, 8, 16, 32, 64, 128] {
        let ptr = stack.alloc(24, align).expect("aligned allocation failed");
        assert_eq!(ptr.as_ptr() as usize % align, 0);
    }
}

#[test]
fn test_stack_exact_fill() {
    let (_buf, region) = backing(1024);
    let mut stack = StackAllocator::new(region).unwrap();

    let span = stack.free_space(1);
    stack.alloc(span.bytes, 1).unwrap();
    assert_eq!(stack.free_bytes(), 0);
    assert!(matches!(
        stack.alloc(1, 1),
        Err(MemError::AllocFailed { .. })
    ));
}

#[test]
fn test_stack_checkpoint_stress() {
    let (_buf, region) = backing(64 * 1024);
    let mut stack = StackAllocator::new(region).unwrap();

    for round in 0..100 {
        let mark = stack.checkpoint();
        for i in 0..10 {
            let ptr = stack.alloc(128, 8).expect("allocation failed");
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), (round + i) as u8, 128) };
        }
        stack.restore(mark).unwrap();
    }
    assert!(stack.is_empty());
}
