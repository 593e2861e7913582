//! Integration tests for the heap allocator

use core::ptr::NonNull;

use proptest::prelude::*;
use rand::Rng;
use xmem::prelude::*;

fn backing(size: usize) -> (Vec<u8>, MemoryRegion) {
    let mut buf = vec![0u8; size];
    let start = NonNull::new(buf.as_mut_ptr()).unwrap();
    // SAFETY: the buffer outlives the region in every test below.
    let region = unsafe { MemoryRegion::new(start, size) };
    (buf, region)
}

fn internal_heap(size: usize, slots: usize) -> (Vec<u8>, HeapAllocator) {
    let (buf, region) = backing(size);
    let heap = HeapAllocator::new(region, slots, HeaderPlacement::Internal)
        .expect("failed to create heap allocator");
    (buf, heap)
}

fn assert_conserved(heap: &HeapAllocator) {
    assert_eq!(
        heap.free_bytes() + heap.allocated_bytes(),
        heap.total_usable(),
        "free + allocated must equal total usable bytes"
    );
}

#[test]
fn test_heap_data_integrity_across_blocks() {
    let (_buf, mut heap) = internal_heap(16 * 1024, 64);

    let mut ptrs = Vec::new();
    for i in 0..16u8 {
        let ptr = heap.alloc(100, 4).expect("allocation failed");
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), i, 100) };
        ptrs.push((ptr, i));
    }
    // Every block still holds its own fill pattern.
    for (ptr, i) in &ptrs {
        unsafe {
            assert_eq!(*ptr.as_ptr(), *i);
            assert_eq!(*ptr.as_ptr().add(99), *i);
        }
    }
    for (ptr, _) in ptrs {
        heap.free(ptr).expect("free failed");
    }
    assert_conserved(&heap);
}

#[test]
fn test_heap_random_churn_conserves_bytes() {
    let (_buf, mut heap) = internal_heap(64 * 1024, 128);
    let mut rng = rand::rng();
    let mut live: Vec<NonNull<u8>> = Vec::new();

    for _ in 0..500 {
        if !live.is_empty() && rng.random::<bool>() {
            let index = rng.random_range(0..live.len());
            let ptr = live.swap_remove(index);
            heap.free(ptr).expect("free of live pointer failed");
        } else {
            let size = rng.random_range(1..1024);
            let align = 1usize << rng.random_range(0..7);
            if let Ok(ptr) = heap.alloc(size, align) {
                assert_eq!(ptr.as_ptr() as usize % align, 0);
                live.push(ptr);
            }
        }
        assert_conserved(&heap);
    }

    for ptr in live {
        heap.free(ptr).unwrap();
    }
    assert_conserved(&heap);
}

#[test]
fn test_heap_fragmentation_then_coalesce() {
    let (_buf, mut heap) = internal_heap(32 * 1024, 64);
    let free_before = heap.free_bytes();

    let ptrs: Vec<_> = (0..20)
        .map(|_| heap.alloc(512, 1).expect("allocation failed"))
        .collect();

    // Free every other block, then the rest; everything must coalesce back
    // into one span.
    for ptr in ptrs.iter().step_by(2) {
        heap.free(*ptr).unwrap();
    }
    for ptr in ptrs.iter().skip(1).step_by(2) {
        heap.free(*ptr).unwrap();
    }

    assert_eq!(heap.free_bytes(), free_before);
    let max = heap.free_space(1, FreeSpaceQuery::Max);
    assert_eq!(max.bytes, free_before);
}

#[test]
fn test_heap_external_header_keeps_buffer_intact() {
    let (_hdr_buf, hdr_region) = backing(HeapAllocator::header_bytes(32));
    let (_buf, region) = backing(8 * 1024);
    let mut heap = HeapAllocator::new(region, 32, HeaderPlacement::External(hdr_region))
        .expect("failed to create heap allocator");

    assert_eq!(heap.free_bytes(), 8 * 1024);
    assert_eq!(heap.allocated_bytes(), 0);

    let ptr = heap.alloc(4096, 64).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 64, 0);
    heap.free(ptr).unwrap();
    assert_eq!(heap.free_bytes(), 8 * 1024);
}

#[test]
fn test_heap_unknown_pointer_rejected() {
    let (_buf, mut heap) = internal_heap(4096, 16);
    let p = heap.alloc(64, 1).unwrap();

    let bogus = NonNull::new((p.as_ptr() as usize + 1) as *mut u8).unwrap();
    assert!(matches!(
        heap.free(bogus),
        Err(MemError::PtrOutOfBounds { .. })
    ));

    // Double free: the pointer is no longer on the alloc list.
    heap.free(p).unwrap();
    assert!(matches!(heap.free(p), Err(MemError::PtrOutOfBounds { .. })));
}

proptest! {
    /// Allocating any sequence of requests and freeing them all restores the
    /// initial counters, regardless of split/coalesce decisions in between.
    #[test]
    fn prop_alloc_all_free_all_restores_counters(
        requests in proptest::collection::vec((1usize..2048, 0u32..8), 1..32)
    ) {
        let (_buf, mut heap) = internal_heap(256 * 1024, 128);
        let free0 = heap.free_bytes();
        let alloc0 = heap.allocated_bytes();

        let mut live = Vec::new();
        for (size, align_exp) in requests {
            let align = 1usize << align_exp;
            if let Ok(ptr) = heap.alloc(size, align) {
                prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
                live.push(ptr);
            }
            assert_conserved(&heap);
        }

        // Free in a different order than allocation.
        for ptr in live.iter().rev().step_by(2) {
            heap.free(*ptr).unwrap();
        }
        for ptr in live.iter().rev().skip(1).step_by(2) {
            heap.free(*ptr).unwrap();
        }

        prop_assert_eq!(heap.free_bytes(), free0);
        prop_assert_eq!(heap.allocated_bytes(), alloc0);
    }
}
