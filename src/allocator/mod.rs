//! Memory allocator - fast bump allocation with arenas, segregated by tag
//!
//! Design: three-layer architecture for optimal performance:
//! 1. Bump allocation (fast path, <10ns)
//! 2. Arena management (slow path, amortized cost)
//! 3. OS memory (rare, bulk acquisition)
//!
//! Each thread owns one bump+arena pair per `HeapTag` (spec S4.4): `Gc`
//! for collector-tracked objects, `GcPre` for objects allocated but not
//! yet registered with the collector, `NonGc` for everything else. When
//! a thread exits, its heaps are abandoned into a global pool rather
//! than torn down, so a live cross-thread reference into them stays
//! valid until the collector reclaims the pool.

mod header;
mod arena;

#[cfg(test)]
mod tests;

pub use header::{GcBits, LocalWord, ObjectHeader, SharedWord, TypeInfo};
pub use arena::{Arena, ArenaPool, BumpAllocator};

use core::cell::RefCell;
use core::ptr::NonNull;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::logging::{debug, log_allocation, trace};
use crate::threads::{current_thread_id, ThreadId};

/// Which segregated heap an allocation belongs to (spec S4.4).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapTag {
    /// Tracked by the cycle collector once `gc_track` runs on it.
    Gc,
    /// Allocated but not yet tracked (object still under construction).
    GcPre,
    /// Never tracked; freed purely by refcount reaching zero.
    NonGc,
}

const TAG_COUNT: usize = 3;

impl HeapTag {
    #[inline]
    fn index(self) -> usize {
        match self {
            HeapTag::Gc => 0,
            HeapTag::GcPre => 1,
            HeapTag::NonGc => 2,
        }
    }
}

thread_local! {
    static TLS_HEAP: RefCell<Option<ThreadHeap>> = RefCell::new(None);
}

/// Initialize this thread's segregated heap, reclaiming an abandoned
/// one from the global pool if one is available.
pub fn init() {
    TLS_HEAP.with(|heap| {
        if heap.borrow().is_none() {
            *heap.borrow_mut() = Some(ThreadHeap::acquire());
        }
    });
    debug!("thread heap ready (gc/gc_pre/non_gc bump allocators)");
}

/// Run `f` against this thread's heap, lazily creating one on first use.
pub fn with_thread_heap<F, R>(f: F) -> R
where
    F: FnOnce(&mut ThreadHeap) -> R,
{
    TLS_HEAP.with(|heap| {
        let mut heap_ref = heap.borrow_mut();
        let thread_heap = heap_ref.get_or_insert_with(ThreadHeap::acquire);
        f(thread_heap)
    })
}

/// Abandon this thread's heap into the global pool for reclaim by a
/// future thread (spec S4.4). Called from the thread-exit path.
pub fn abandon_current_thread_heap() {
    if let Some(heap) = TLS_HEAP.with(|heap| heap.borrow_mut().take()) {
        heap.abandon();
    }
}

/// One allocator per `HeapTag`, owned exclusively by a single thread
/// while attached; becomes an `AbandonedSegment` on thread exit.
pub struct ThreadHeap {
    owner: ThreadId,
    allocators: [Allocator; TAG_COUNT],
}

impl ThreadHeap {
    fn new() -> Self {
        Self {
            owner: current_thread_id(),
            allocators: [
                Allocator::new(HeapTag::Gc),
                Allocator::new(HeapTag::GcPre),
                Allocator::new(HeapTag::NonGc),
            ],
        }
    }

    /// Pull an abandoned heap off the global pool if one exists, else
    /// build a fresh one.
    fn acquire() -> Self {
        if let Some(segment) = ABANDONED_POOL.lock().pop() {
            trace!(event = "heap_reclaimed", previous_owner = segment.previous_owner.as_u64());
            Self {
                owner: current_thread_id(),
                allocators: segment.allocators,
            }
        } else {
            Self::new()
        }
    }

    #[inline]
    pub fn alloc(&mut self, tag: HeapTag, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.allocators[tag.index()].alloc(size, align)
    }

    /// Allocate a typed object with its header, attributing ownership
    /// to the calling thread.
    pub fn alloc_object<T>(&mut self, tag: HeapTag, type_info: NonNull<TypeInfo>) -> Option<NonNull<T>> {
        let total_size = core::mem::size_of::<ObjectHeader>() + core::mem::size_of::<T>();
        let align = core::mem::align_of::<ObjectHeader>().max(core::mem::align_of::<T>());

        let ptr = self.alloc(tag, total_size, align)?;

        unsafe {
            let header_ptr = ptr.as_ptr() as *mut ObjectHeader;
            header_ptr.write(ObjectHeader::new(type_info, self.owner));
            let data_ptr = ObjectHeader::data_ptr(header_ptr) as *mut T;
            NonNull::new(data_ptr)
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        self.allocators
            .iter()
            .fold(AllocatorStats::default(), |acc, a| acc.combine(a.stats()))
    }

    /// Hand this heap's contents off to the abandoned pool (spec S4.4).
    /// Objects already allocated within it remain valid: only
    /// ownership of future allocation capacity moves.
    fn abandon(self) {
        debug!(event = "heap_abandoned", owner = self.owner.as_u64());
        ABANDONED_POOL.lock().push(AbandonedSegment {
            previous_owner: self.owner,
            allocators: self.allocators,
        });
    }
}

/// A thread-exited heap, parked for reuse (spec S4.4: "abandon on
/// thread exit, reclaim from the abandoned pool").
struct AbandonedSegment {
    previous_owner: ThreadId,
    allocators: [Allocator; TAG_COUNT],
}

static ABANDONED_POOL: Lazy<Mutex<Vec<AbandonedSegment>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Number of heaps currently parked waiting for reclaim. Exposed for
/// diagnostics and tests.
pub fn abandoned_pool_len() -> usize {
    ABANDONED_POOL.lock().len()
}

/// Single-tag allocator combining bump allocation and arena management.
pub struct Allocator {
    bump: BumpAllocator,
    arenas: ArenaPool,
}

impl Allocator {
    pub fn new(tag: HeapTag) -> Self {
        Self {
            bump: BumpAllocator::new(),
            arenas: ArenaPool::new(tag),
        }
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.bump.try_alloc(size, align) {
            log_allocation(size, ptr.as_ptr());
            return Some(ptr);
        }
        self.alloc_slow(size, align)
    }

    fn alloc_slow(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let arena = self.arenas.grow_with_min(size + align)?;
        let (start, end) = arena.bounds();
        self.bump.reset(start, end);

        let result = self.bump.try_alloc(size, align);
        if let Some(ptr) = result {
            log_allocation(size, ptr.as_ptr());
        }
        result
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            total_allocated: self.arenas.total_allocated(),
            current_remaining: self.bump.remaining(),
        }
    }
}

/// Allocator statistics for monitoring and debugging.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorStats {
    pub total_allocated: usize,
    pub current_remaining: usize,
}

impl AllocatorStats {
    fn combine(self, other: Self) -> Self {
        Self {
            total_allocated: self.total_allocated + other.total_allocated,
            current_remaining: self.current_remaining + other.current_remaining,
        }
    }
}
