//! End-to-end scenario tests exercised with real OS threads.

use corobox::allocator::ObjectHeader;
use corobox::fixtures::{Leaf, Pair};
use corobox::gc::{self, refcount, weakref, WeakrefKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn self_cycle_is_collected() {
    corobox::init();
    gc::disable();

    let a = gc::alloc_tracked(Pair::new());
    a.link(a.clone());
    let header = unsafe { ObjectHeader::from_object(a.as_ptr() as *mut u8) };
    drop(a);

    let info = gc::collect(0);
    assert!(info.collected >= 1);
    assert!(!gc::is_tracked(header));

    gc::enable();
}

#[test]
fn two_cycle_with_finalizer_runs_once_each() {
    gc::disable();

    let a = gc::alloc_tracked(Pair::new());
    let b = gc::alloc_tracked(Pair::new());
    a.link(b.clone());
    b.link(a.clone());
    let header_a = unsafe { ObjectHeader::from_object(a.as_ptr() as *mut u8) };
    let header_b = unsafe { ObjectHeader::from_object(b.as_ptr() as *mut u8) };

    drop(a);
    drop(b);

    let info = gc::collect(0);
    assert!(info.collected >= 2);
    assert!(!gc::is_tracked(header_a));
    assert!(!gc::is_tracked(header_b));

    // A second pass must not attempt to re-finalize already-cleared
    // memory.
    gc::collect(0);

    gc::enable();
}

#[test]
fn weakref_callback_fires_when_cycle_dies() {
    gc::disable();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();

    let a = gc::alloc_tracked(Pair::new());
    let header = unsafe { ObjectHeader::from_object(a.as_ptr() as *mut u8) };
    let _handle = weakref::create_weakref(
        header,
        WeakrefKind::Plain,
        Some(Arc::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })),
    );
    a.link(a.clone());
    drop(a);

    gc::collect(0);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    gc::enable();
}

#[test]
fn legacy_finalizer_object_is_uncollectable() {
    gc::disable();
    let before = gc::get_stats()[0].uncollectable;

    let mut pair = Pair::new();
    pair.legacy_finalizer = true;
    let a = gc::alloc_tracked(pair);
    a.link(a.clone());
    drop(a);

    gc::collect(0);
    assert!(gc::get_stats()[0].uncollectable > before);

    gc::enable();
}

#[test]
fn save_all_flag_diverts_unreachable_objects_to_garbage() {
    gc::disable();
    gc::set_debug(gc::debug_flags::SAVE_ALL);
    let before = gc::get_garbage().len();

    let a = gc::alloc_tracked(Pair::new());
    a.link(a.clone());
    drop(a);

    gc::collect(0);
    assert!(gc::get_garbage().len() > before);

    gc::set_debug(0);
    gc::enable();
}

/// A decref issued from a thread that does not own the target object's
/// local refcount half must be delivered (queued or applied directly)
/// without corrupting the count, even though the owning thread is
/// concurrently doing its own increments and decrements.
#[test]
fn cross_thread_decref_reaches_zero_without_double_free() {
    corobox::init();

    let owner_ctx = corobox::attach_thread();
    let leaf = gc::alloc_untracked(Leaf { value: 42 });
    let header = unsafe { ObjectHeader::from_object(leaf.as_ptr() as *mut u8) };

    // Hand out extra strong references the way a real cross-thread
    // publish would: clone on the owning thread, then send the clones
    // elsewhere to be dropped.
    let extra: Vec<_> = (0..4).map(|_| leaf.clone()).collect();
    assert_eq!(refcount::total_count(unsafe { &*header }), 5);

    let handles: Vec<_> = extra
        .into_iter()
        .map(|clone| {
            std::thread::spawn(move || {
                let _ctx = corobox::attach_thread();
                drop(clone);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // The foreign decrefs may have landed in the owner's inbox rather
    // than being applied instantly; drain it before checking.
    corobox::threads::registry().drain_all_queues();
    assert_eq!(refcount::total_count(unsafe { &*header }), 1);

    drop(leaf);
    drop(owner_ctx);
}

#[test]
fn thread_exit_abandons_heap_for_later_reclaim() {
    corobox::init();
    let before = corobox::allocator::abandoned_pool_len();

    let handle = std::thread::spawn(|| {
        let _ctx = corobox::attach_thread();
        let _leaf = gc::alloc_untracked(Leaf { value: 7 });
    });
    handle.join().unwrap();

    assert!(corobox::allocator::abandoned_pool_len() > before);
}
