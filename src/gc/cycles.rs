//! Cycle collector - the 10-phase whole-heap stop-the-world pass
//!
//! Grounded on CPython's `gcmodule.c` (`gc_refs`, `gc_decref`,
//! `deduce_unreachable_heap`, `has_legacy_finalizer`): instead of
//! generations, every tracked object across every per-thread heap is
//! visited each run. `gc_refs` is computed by taking each object's true
//! refcount and subtracting one for every internal reference reported
//! by another tracked object's traversal; what's left over after the
//! mark phase with `gc_refs == 0` is unreachable from outside the
//! traced set and is therefore a cycle with no external root.

use dashmap::DashSet;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::allocator::{GcBits, ObjectHeader};
use crate::errors::{report_unraisable, UnraisableError};
use crate::logging::{debug, log_gc_complete, log_gc_mark, log_gc_start, log_gc_sweep, trace};
use crate::threads::registry;

use super::refcount::total_count;
use super::traversable::{clear_header, finalize_header, has_legacy_finalizer_header, traverse_header, FinalizeOutcome, VisitControl};
use super::weakref;

pub mod debug_flags {
    pub const STATS: u32 = 1 << 0;
    pub const COLLECTABLE_PRINT: u32 = 1 << 1;
    pub const UNCOLLECTABLE_PRINT: u32 = 1 << 2;
    pub const SAVE_ALL: u32 = 1 << 3;
    pub const LEAK: u32 = COLLECTABLE_PRINT | UNCOLLECTABLE_PRINT | SAVE_ALL;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CollectPhase(pub &'static str);

pub const PHASE_START: CollectPhase = CollectPhase("start");
pub const PHASE_STOP: CollectPhase = CollectPhase("stop");

#[derive(Clone, Copy, Debug, Default)]
pub struct CollectInfo {
    pub generation: u32,
    pub collected: usize,
    pub uncollectable: usize,
}

type ProgressCallback = Box<dyn Fn(CollectPhase, CollectInfo) + Send + Sync>;

/// Global collector state. A single instance; generations are an
/// interface fiction preserved for call compatibility (spec S4.8).
pub struct CycleCollector {
    tracked: DashSet<usize>,
    enabled: std::sync::atomic::AtomicBool,
    collection_lock: Mutex<()>,
    garbage: Mutex<Vec<usize>>,
    uncollectable_count: AtomicUsize,
    debug: AtomicU32,
    threshold: AtomicU64,
    objects_since_collection: AtomicUsize,
    collections_run: AtomicUsize,
    total_collected: AtomicUsize,
    callbacks: Mutex<Vec<ProgressCallback>>,
}

static COLLECTOR: Lazy<CycleCollector> = Lazy::new(CycleCollector::new);

pub fn collector() -> &'static CycleCollector {
    &COLLECTOR
}

impl CycleCollector {
    fn new() -> Self {
        Self {
            tracked: DashSet::with_capacity(1024),
            enabled: std::sync::atomic::AtomicBool::new(true),
            collection_lock: Mutex::new(()),
            garbage: Mutex::new(Vec::new()),
            uncollectable_count: AtomicUsize::new(0),
            debug: AtomicU32::new(0),
            threshold: AtomicU64::new(crate::config::runtime_config().gc_threshold_floor),
            objects_since_collection: AtomicUsize::new(0),
            collections_run: AtomicUsize::new(0),
            total_collected: AtomicUsize::new(0),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, flags: u32) {
        self.debug.store(flags, Ordering::Relaxed);
    }

    pub fn get_debug(&self) -> u32 {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_threshold(&self, threshold: u64) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn get_threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn get_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn add_callback(&self, cb: ProgressCallback) {
        self.callbacks.lock().push(cb);
    }

    fn run_callbacks(&self, phase: CollectPhase, info: CollectInfo) {
        for cb in self.callbacks.lock().iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(phase, info)));
            if let Err(payload) = result {
                report_unraisable(UnraisableError::from_panic_payload("gc progress callback", payload));
            }
        }
    }

    pub fn track(&self, header: *mut ObjectHeader) {
        let h = unsafe { &*header };
        if h.gc_bits().contains(GcBits::TRACKED) {
            return;
        }
        h.insert_gc_bits(GcBits::TRACKED);
        self.tracked.insert(header as usize);
        trace!(event = "gc_track", address = ?header);

        let since = self.objects_since_collection.fetch_add(1, Ordering::Relaxed) + 1;
        if self.is_enabled() && since as u64 >= self.threshold.load(Ordering::Relaxed) {
            self.objects_since_collection.store(0, Ordering::Relaxed);
            collect(0);
        }
    }

    pub fn untrack(&self, header: *mut ObjectHeader) {
        let h = unsafe { &*header };
        h.remove_gc_bits(GcBits::TRACKED);
        self.tracked.remove(&(header as usize));
    }

    pub fn is_tracked(&self, header: *mut ObjectHeader) -> bool {
        unsafe { (*header).gc_bits().contains(GcBits::TRACKED) }
    }

    pub fn is_finalized(&self, header: *mut ObjectHeader) -> bool {
        unsafe { (*header).gc_bits().contains(GcBits::FINALIZED) }
    }

    pub fn get_objects(&self) -> Vec<*mut ObjectHeader> {
        self.tracked.iter().map(|e| *e.key() as *mut ObjectHeader).collect()
    }

    pub fn get_garbage(&self) -> Vec<*mut ObjectHeader> {
        self.garbage.lock().iter().map(|a| *a as *mut ObjectHeader).collect()
    }

    pub fn uncollectable_count(&self) -> usize {
        self.uncollectable_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> GenerationStats {
        GenerationStats {
            tracked_objects: self.tracked.len(),
            collections_run: self.collections_run.load(Ordering::Relaxed),
            total_collected: self.total_collected.load(Ordering::Relaxed),
            uncollectable: self.uncollectable_count.load(Ordering::Relaxed),
            garbage_len: self.garbage.lock().len(),
        }
    }

    /// Referents currently reachable in one hop from `header`, for the
    /// public `get_referents` operation (spec S4.8). Not limited to
    /// tracked objects: a leaf's own referents (if any) are still
    /// reported.
    pub fn referents_of(&self, header: *mut ObjectHeader) -> Vec<*mut ObjectHeader> {
        let mut out = Vec::new();
        traverse_header(header, &mut |target| {
            out.push(target);
            VisitControl::Continue
        });
        out
    }

    /// Objects in the tracked set that directly reference `header`, for
    /// `get_referrers` (spec S4.8). O(tracked) - a debugging operation,
    /// not a hot path.
    pub fn referrers_of(&self, header: *mut ObjectHeader) -> Vec<*mut ObjectHeader> {
        let target = header as usize;
        self.tracked
            .iter()
            .filter_map(|e| {
                let candidate = *e.key() as *mut ObjectHeader;
                let mut found = false;
                traverse_header(candidate, &mut |t| {
                    if t as usize == target {
                        found = true;
                        return VisitControl::Stop;
                    }
                    VisitControl::Continue
                });
                if found {
                    Some(candidate)
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Stats for one generation. There is only ever one entry in the
/// `Vec<GenerationStats>` `get_stats` returns - the type stays
/// per-generation for interface compatibility with a caller expecting
/// the usual three-generation shape (spec S4.8).
#[derive(Clone, Copy, Debug, Default)]
pub struct GenerationStats {
    pub tracked_objects: usize,
    pub collections_run: usize,
    pub total_collected: usize,
    pub uncollectable: usize,
    pub garbage_len: usize,
}

/// Mark an object trackable the first time it could participate in a
/// cycle (spec S4.1 "mark_potential_cycle"). Idempotent.
#[inline]
pub fn register_candidate(header: *mut ObjectHeader) {
    COLLECTOR.track(header);
}

/// Run a full collection (spec S4.7). `generation` is accepted and
/// ignored beyond being echoed back in callback info (spec S4.8: three
/// generations are interface-compatible fiction over one collector).
pub fn collect(generation: u32) -> CollectInfo {
    let _serialize = COLLECTOR.collection_lock.lock();
    let started = std::time::Instant::now();

    let candidate_count = COLLECTOR.tracked.len();
    log_gc_start(generation, candidate_count);
    COLLECTOR.run_callbacks(PHASE_START, CollectInfo { generation, ..Default::default() });

    // --- Phase 1: Prepare ---
    let stw = registry().stop_the_world();
    registry().drain_all_queues();

    let all: Vec<*mut ObjectHeader> = COLLECTOR.tracked.iter().map(|e| *e.key() as *mut ObjectHeader).collect();

    // --- Phase 2: Enumerate & compute gc-refs ---
    // Kept in a local scratch map rather than borrowing a header field:
    // phases 6-7 run with the world restarted, and a finalizer invoking
    // incref/decref on its own object needs `owner` to still mean owner.
    let mut gc_refs: HashMap<usize, i64> = HashMap::with_capacity(all.len());
    for &header in &all {
        let h = unsafe { &*header };
        super::refcount::merge_to_shared(h);
        gc_refs.insert(header as usize, total_count(h) as i64);
        h.insert_gc_bits(GcBits::UNREACHABLE);
    }
    for &header in &all {
        traverse_header(header, &mut |target| {
            if COLLECTOR.is_tracked(target) {
                if let Some(refs) = gc_refs.get_mut(&(target as usize)) {
                    *refs -= 1;
                }
            }
            VisitControl::Continue
        });
    }

    // --- Phase 3: Untrack opportunities ---
    // A tracked leaf (no outgoing references at all) can't participate
    // in a cycle; drop it from future passes (spec S4.7 step 3 applied
    // generically rather than to a specific dict/tuple shape).
    for &header in &all {
        let mut has_refs = false;
        traverse_header(header, &mut |_| {
            has_refs = true;
            VisitControl::Stop
        });
        if !has_refs {
            let h = unsafe { &*header };
            h.remove_gc_bits(GcBits::UNREACHABLE);
            COLLECTOR.untrack(header);
        }
    }
    let all: Vec<*mut ObjectHeader> = all
        .into_iter()
        .filter(|h| COLLECTOR.is_tracked(*h))
        .collect();

    log_gc_mark(all.len());

    // --- Phase 4: Mark reachable ---
    let mut worklist: VecDeque<*mut ObjectHeader> = VecDeque::new();
    for &header in &all {
        let h = unsafe { &*header };
        if *gc_refs.get(&(header as usize)).unwrap_or(&0) > 0 && h.gc_bits().contains(GcBits::UNREACHABLE) {
            h.remove_gc_bits(GcBits::UNREACHABLE);
            worklist.push_back(header);
        }
    }
    while let Some(header) = worklist.pop_front() {
        traverse_header(header, &mut |target| {
            if COLLECTOR.is_tracked(target) {
                let th = unsafe { &*target };
                if th.gc_bits().contains(GcBits::UNREACHABLE) {
                    th.remove_gc_bits(GcBits::UNREACHABLE);
                    gc_refs.insert(target as usize, 0);
                    worklist.push_back(target);
                }
            }
            VisitControl::Continue
        });
    }

    // Legacy finalizers make an object (and its transitive closure)
    // uncollectable; move them out of the unreachable set into garbage.
    let mut unreachable: Vec<*mut ObjectHeader> = all
        .iter()
        .copied()
        .filter(|h| unsafe { (**h).gc_bits().contains(GcBits::UNREACHABLE) })
        .collect();

    let mut legacy_worklist: VecDeque<*mut ObjectHeader> = unreachable
        .iter()
        .copied()
        .filter(|h| has_legacy_finalizer_header(*h))
        .collect();
    let mut uncollectable = Vec::new();
    while let Some(header) = legacy_worklist.pop_front() {
        let h = unsafe { &*header };
        if !h.gc_bits().contains(GcBits::UNREACHABLE) {
            continue;
        }
        h.remove_gc_bits(GcBits::UNREACHABLE);
        uncollectable.push(header);
        traverse_header(header, &mut |target| {
            if COLLECTOR.is_tracked(target) {
                legacy_worklist.push_back(target);
            }
            VisitControl::Continue
        });
    }
    unreachable.retain(|h| unsafe { (**h).gc_bits().contains(GcBits::UNREACHABLE) });

    if !uncollectable.is_empty() {
        COLLECTOR.uncollectable_count.fetch_add(uncollectable.len(), Ordering::Relaxed);
        COLLECTOR.garbage.lock().extend(uncollectable.iter().map(|h| *h as usize));
    }

    // --- Phase 5: Restart for callbacks ---
    drop(stw);

    // --- Phase 6: Weakref processing ---
    for &header in &unreachable {
        weakref::clear_referent(header);
    }

    // --- Phase 7: Finalizers ---
    let mut resurrected = Vec::new();
    for &header in &unreachable {
        let h = unsafe { &*header };
        if h.gc_bits().contains(GcBits::FINALIZED) {
            continue;
        }
        h.insert_gc_bits(GcBits::FINALIZED);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| finalize_header(header)));
        let was_resurrected = matches!(outcome, Ok(FinalizeOutcome::Resurrected));
        match outcome {
            Ok(FinalizeOutcome::Resurrected) => resurrected.push(header),
            Ok(FinalizeOutcome::NoResurrection) => {}
            Err(payload) => {
                report_unraisable(UnraisableError::from_panic_payload("gc finalizer", payload));
            }
        }
        crate::logging::log_finalizer_run(was_resurrected);
    }

    // --- Phase 8: Handle resurrection ---
    let stw2 = registry().stop_the_world();
    for &header in &unreachable {
        if let Some(refs) = gc_refs.get_mut(&(header as usize)) {
            *refs -= 1;
        }
    }
    let mut revive_worklist: VecDeque<*mut ObjectHeader> = resurrected.clone().into();
    for &header in &unreachable {
        if *gc_refs.get(&(header as usize)).unwrap_or(&0) > 0 {
            revive_worklist.push_back(header);
        }
    }
    let mut revived = HashSet::new();
    while let Some(header) = revive_worklist.pop_front() {
        if !revived.insert(header as usize) {
            continue;
        }
        let h = unsafe { &*header };
        h.remove_gc_bits(GcBits::UNREACHABLE);
        traverse_header(header, &mut |target| {
            if COLLECTOR.is_tracked(target) {
                revive_worklist.push_back(target);
            }
            VisitControl::Continue
        });
    }
    unreachable.retain(|h| !revived.contains(&(*h as usize)));
    drop(stw2);

    // --- Phase 9: Clear cycles ---
    let save_all = COLLECTOR.get_debug() & debug_flags::SAVE_ALL != 0;
    if save_all {
        COLLECTOR.garbage.lock().extend(unreachable.iter().map(|h| *h as usize));
    } else {
        for &header in &unreachable {
            clear_header(header);
            COLLECTOR.untrack(header);
        }
    }
    log_gc_sweep(unreachable.len());

    // --- Phase 10: Epilogue ---
    let live = COLLECTOR.tracked.len() as u64;
    let scale = crate::config::runtime_config().gc_scale_percent as u64;
    let floor = crate::config::runtime_config().gc_threshold_floor;
    let new_threshold = (live + live * scale / 100).max(floor);
    COLLECTOR.set_threshold(new_threshold);
    COLLECTOR.collections_run.fetch_add(1, Ordering::Relaxed);
    COLLECTOR.total_collected.fetch_add(unreachable.len(), Ordering::Relaxed);

    let info = CollectInfo {
        generation,
        collected: unreachable.len(),
        uncollectable: uncollectable.len(),
    };
    log_gc_complete(started.elapsed().as_micros() as u64, info.collected, info.uncollectable);
    COLLECTOR.run_callbacks(PHASE_STOP, info);
    debug!(event = "gc_epilogue", new_threshold);

    info
}
