//! Garbage collector - biased refcounting plus a whole-heap cycle pass
//!
//! Design: two complementary mechanisms (spec S2):
//! 1. Reference counting (fast path, deterministic, `refcount`/`decref_queue`)
//! 2. Stop-the-world cycle collection (rare, `cycles`) for reference
//!    cycles that counting alone can never reclaim
//!
//! This module also exposes the public GC API (spec S4.8): the
//! operations a caller uses to enable/disable collection, force a
//! pass, inspect tracked objects, and register progress callbacks.

pub mod decref_queue;
pub mod refcount;
pub mod traversable;
pub mod typeid;
pub mod weakref;
mod cycles;

#[cfg(test)]
mod tests;

pub use cycles::{collector, debug_flags, CollectInfo, CollectPhase, GenerationStats, PHASE_START, PHASE_STOP};
pub use refcount::{DecOutcome, GcRef};
pub use traversable::{FinalizeOutcome, Traversable, VisitControl};
pub use typeid::TypeId;
pub use weakref::{WeakrefHandle, WeakrefKind};

use core::ptr::NonNull;
use once_cell::sync::OnceCell;

use crate::allocator::{HeapTag, ObjectHeader, TypeInfo};
use crate::logging::log_runtime_init;

/// Initialize the GC subsystem. Idempotent.
pub fn init() {
    log_runtime_init();
    collector();
}

/// Allocate a new, tracked `T` on the calling thread's `Gc` heap,
/// registering its `Traversable` vtable with the type-id pool the
/// first time `T` is allocated (spec S4.5).
pub fn alloc_tracked<T: Traversable + 'static>(value: T) -> GcRef<T> {
    let type_info = type_info_for::<T>();
    let ptr: NonNull<T> = crate::allocator::with_thread_heap(|heap| {
        heap.alloc_object(HeapTag::Gc, NonNull::from(type_info))
            .expect("heap allocation failed")
    });
    unsafe {
        ptr.as_ptr().write(value);
        let header = ObjectHeader::from_object(ptr.as_ptr() as *mut u8);
        collector().track(header);
        GcRef::from_raw_initialized(ptr.as_ptr())
    }
}

/// Allocate a new `T` that is never tracked by the cycle collector
/// (spec S4.4 `NonGc` tag): appropriate for types that structurally
/// cannot form cycles.
pub fn alloc_untracked<T: Traversable + 'static>(value: T) -> GcRef<T> {
    let type_info = type_info_for::<T>();
    let ptr: NonNull<T> = crate::allocator::with_thread_heap(|heap| {
        heap.alloc_object(HeapTag::NonGc, NonNull::from(type_info))
            .expect("heap allocation failed")
    });
    unsafe {
        ptr.as_ptr().write(value);
        GcRef::from_raw_initialized(ptr.as_ptr())
    }
}

fn type_info_for<T: Traversable + 'static>() -> &'static TypeInfo {
    static_per_type::<T>()
}

fn static_per_type<T: Traversable + 'static>() -> &'static TypeInfo {
    static INFO: OnceCell<TypeInfo> = OnceCell::new();
    static REGISTERED: OnceCell<()> = OnceCell::new();
    static VTABLE: OnceCell<traversable::TraverseVtable> = OnceCell::new();

    unsafe fn drop_in_place<T>(ptr: *mut u8) {
        core::ptr::drop_in_place(ptr as *mut T);
    }

    let info = INFO.get_or_init(|| {
        TypeInfo::with_drop(core::mem::size_of::<T>(), core::mem::align_of::<T>(), drop_in_place::<T>)
    });
    REGISTERED.get_or_init(|| {
        let vtable = VTABLE.get_or_init(traversable::vtable_for::<T>);
        typeid::allocate(info, vtable);
    });
    info
}

// ============================================================================
// Public GC API (spec S4.8)
// ============================================================================

pub fn enable() {
    collector().enable();
}

pub fn disable() {
    collector().disable();
}

pub fn is_enabled() -> bool {
    collector().is_enabled()
}

/// Force a collection. `generation` is accepted for interface
/// compatibility and echoed back in callback info; there is only one
/// generation under this design (spec S4.8).
pub fn collect(generation: u32) -> CollectInfo {
    cycles::collect(generation)
}

pub fn set_debug(flags: u32) {
    collector().set_debug(flags);
}

pub fn get_debug() -> u32 {
    collector().get_debug()
}

pub fn set_threshold(threshold: u64) {
    collector().set_threshold(threshold);
}

pub fn get_threshold() -> u64 {
    collector().get_threshold()
}

/// `(count, 0, 0)`: a three-generation tuple for interface
/// compatibility (spec S4.8), with the latter two generations fixed at
/// zero since this design keeps only one.
pub fn get_count() -> (usize, usize, usize) {
    (collector().get_count(), 0, 0)
}

/// `generation` is ignored; every tracked object lives in the one
/// generation this design keeps (spec S4.8).
pub fn get_objects(_generation: Option<u32>) -> Vec<*mut ObjectHeader> {
    collector().get_objects()
}

/// A single-element vec for interface compatibility with a caller
/// expecting one `GenerationStats` per generation (spec S4.8); this
/// design keeps only one generation, so there is only ever one entry.
pub fn get_stats() -> Vec<GenerationStats> {
    vec![collector().stats()]
}

pub fn is_tracked(header: *mut ObjectHeader) -> bool {
    collector().is_tracked(header)
}

pub fn is_finalized(header: *mut ObjectHeader) -> bool {
    collector().is_finalized(header)
}

pub fn get_referrers(header: *mut ObjectHeader) -> Vec<*mut ObjectHeader> {
    collector().referrers_of(header)
}

pub fn get_referents(header: *mut ObjectHeader) -> Vec<*mut ObjectHeader> {
    collector().referents_of(header)
}

pub fn get_garbage() -> Vec<*mut ObjectHeader> {
    collector().get_garbage()
}

/// Register a progress callback invoked with `"start"`/`"stop"` and the
/// before/after counts (spec S4.8).
pub fn add_callback(cb: impl Fn(CollectPhase, CollectInfo) + Send + Sync + 'static) {
    collector().add_callback(Box::new(cb));
}

/// No-op in this design: a single generation is kept, so there is
/// nothing to freeze independently (spec S4.8, Open Question resolved
/// in DESIGN.md).
pub fn freeze() {}

pub fn unfreeze() {}

pub fn get_freeze_count() -> usize {
    0
}
