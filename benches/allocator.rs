use corobox::allocator::{self, HeapTag};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_bump_allocation(c: &mut Criterion) {
    allocator::init();
    c.bench_function("alloc_16bytes_nongc", |b| {
        b.iter(|| {
            let ptr = allocator::with_thread_heap(|heap| heap.alloc(HeapTag::NonGc, 16, 8));
            black_box(ptr);
        });
    });
}

fn bench_arena_growth(c: &mut Criterion) {
    allocator::init();
    c.bench_function("alloc_4096bytes_forces_arena_refill", |b| {
        b.iter(|| {
            let ptr = allocator::with_thread_heap(|heap| heap.alloc(HeapTag::Gc, 4096, 16));
            black_box(ptr);
        });
    });
}

criterion_group!(benches, bench_bump_allocation, bench_arena_growth);
criterion_main!(benches);
