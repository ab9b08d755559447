use corobox::fixtures::{Leaf, Pair};
use corobox::gc::{self, refcount};
use corobox::allocator::ObjectHeader;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_incref_decref(c: &mut Criterion) {
    gc::init();
    let leaf = gc::alloc_untracked(Leaf { value: 1 });
    let header = unsafe { ObjectHeader::from_object(leaf.as_ptr() as *mut u8) };
    let header = unsafe { &*header };

    c.bench_function("owner_thread_incref_decref", |b| {
        b.iter(|| {
            refcount::inc(header);
            black_box(refcount::dec(header));
        });
    });
}

fn bench_alloc_tracked(c: &mut Criterion) {
    gc::init();
    gc::disable();
    c.bench_function("alloc_tracked_leaf", |b| {
        b.iter(|| {
            black_box(gc::alloc_tracked(Leaf { value: 1 }));
        });
    });
    gc::enable();
}

fn bench_cycle_collection(c: &mut Criterion) {
    gc::init();
    gc::disable();
    c.bench_function("collect_self_referential_pairs", |b| {
        b.iter(|| {
            let a = gc::alloc_tracked(Pair::new());
            a.link(a.clone());
            drop(a);
            black_box(gc::collect(0));
        });
    });
    gc::enable();
}

criterion_group!(benches, bench_incref_decref, bench_alloc_tracked, bench_cycle_collection);
criterion_main!(benches);
