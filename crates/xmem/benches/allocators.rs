//! Allocation-path benchmarks: stack bump/restore vs heap split/coalesce

use core::ptr::NonNull;
use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use xmem::prelude::*;

fn region_over(buf: &mut Vec<u8>) -> MemoryRegion {
    let start = NonNull::new(buf.as_mut_ptr()).unwrap();
    // SAFETY: the buffer outlives every allocator built over it below.
    unsafe { MemoryRegion::new(start, buf.len()) }
}

fn bench_stack_alloc_restore(c: &mut Criterion) {
    let mut buf = vec![0u8; 1 << 20];
    let region = region_over(&mut buf);
    let mut stack = StackAllocator::new(region).unwrap();

    c.bench_function("stack_alloc_restore_64x128", |b| {
        b.iter(|| {
            let mark = stack.checkpoint();
            for _ in 0..64 {
                black_box(stack.alloc(black_box(128), 8).unwrap());
            }
            stack.restore(mark).unwrap();
        });
    });
}

fn bench_heap_churn(c: &mut Criterion) {
    let mut buf = vec![0u8; 1 << 20];
    let region = region_over(&mut buf);
    let mut heap = HeapAllocator::new(region, 256, HeaderPlacement::Internal).unwrap();

    c.bench_function("heap_alloc_free_32x256", |b| {
        b.iter(|| {
            let mut live = [core::ptr::NonNull::<u8>::dangling(); 32];
            for slot in &mut live {
                *slot = heap.alloc(black_box(256), 8).unwrap();
            }
            // Free out of order to exercise sorted reinsertion + coalesce.
            for i in (0..32).step_by(2) {
                heap.free(live[i]).unwrap();
            }
            for i in (1..32).step_by(2) {
                heap.free(live[i]).unwrap();
            }
        });
    });
}

fn bench_bank_any_path(c: &mut Criterion) {
    let buf: &'static mut [u8] = vec![0u8; 1 << 20].leak();
    let start = NonNull::new(buf.as_mut_ptr()).unwrap();
    // SAFETY: leaked buffer, valid forever.
    let whole = unsafe { MemoryRegion::new(start, 1 << 20) };
    let (r0, r1) = whole.split_front(1 << 19).unwrap();
    let mgr = BankManager::new(&[r0, r1], BankConfig::heap_with_slots(256)).unwrap();

    c.bench_function("bank_any_alloc_free", |b| {
        b.iter(|| {
            let p = mgr.alloc(BankSelector::Any, black_box(512), 8).unwrap();
            mgr.free(BankSelector::Any, p).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_stack_alloc_restore,
    bench_heap_churn,
    bench_bank_any_path
);
criterion_main!(benches);
