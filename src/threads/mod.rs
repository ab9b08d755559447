//! Thread registry and stop-the-world safe-point coordinator
//!
//! Grounded on CPython's free-threaded `pystate.c`: mutators move among
//! `Attached` (running interpreter code), `Detached` (blocked in a
//! foreign call or idle) and `Parked` (halted for a stop-the-world),
//! exactly as spec S4.3's table describes. Expressed with the crate's
//! usual concurrency stack (`dashmap`, `parking_lot`, `once_cell`)
//! instead of a raw futex.


use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logging::{debug, trace, warn};

/// Identifies a mutator thread. Thread ids are allocated densely and
/// never reused while a thread is registered; `0` is reserved as the
/// "no owner" / "nobody home" sentinel used by abandoned segments
/// before reclaim.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(u64);

impl ThreadId {
    pub const NONE: ThreadId = ThreadId(0);

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(v: u64) -> Self {
        ThreadId(v)
    }

    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    static CURRENT_THREAD_ID: ThreadId = ThreadId::next();
}

/// The current thread's id, stable for the lifetime of the thread.
#[inline]
pub fn current_thread_id() -> ThreadId {
    CURRENT_THREAD_ID.with(|id| *id)
}

/// Observable state of a mutator relative to the collector (spec S4.3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MutatorState {
    Attached = 0,
    Detached = 1,
    Parked = 2,
}

impl MutatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => MutatorState::Attached,
            1 => MutatorState::Detached,
            _ => MutatorState::Parked,
        }
    }
}

/// Eval-breaker bits a mutator polls at its next dispatch boundary.
pub mod eval_breaker {
    pub const GC_REQUESTED: u32 = 1 << 0;
    pub const ASYNC_EXC_PENDING: u32 = 1 << 1;
    pub const SIGNALS_PENDING: u32 = 1 << 2;
    pub const STOP_THE_WORLD: u32 = 1 << 3;
}

/// Per-thread registration record.
pub struct MutatorHandle {
    id: ThreadId,
    state: AtomicU8,
    eval_breaker: AtomicU32,
    cant_stop: AtomicBool,
    inbox: Mutex<Vec<crate::gc::decref_queue::QueuedDecref>>,
}

impl MutatorHandle {
    fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: AtomicU8::new(MutatorState::Attached as u8),
            eval_breaker: AtomicU32::new(0),
            cant_stop: AtomicBool::new(false),
            inbox: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> MutatorState {
        MutatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn eval_breaker_set(&self, bits: u32) -> bool {
        self.eval_breaker.load(Ordering::Relaxed) & bits != 0
    }

    #[inline]
    pub fn set_eval_breaker(&self, bits: u32) {
        self.eval_breaker.fetch_or(bits, Ordering::Release);
    }

    #[inline]
    pub fn clear_eval_breaker(&self, bits: u32) {
        self.eval_breaker.fetch_and(!bits, Ordering::Release);
    }

    /// Self-transition Attached -> Detached; always succeeds, the thread
    /// is voluntarily releasing the scheduler.
    pub fn self_detach(&self) {
        self.state.store(MutatorState::Detached as u8, Ordering::Release);
    }

    /// Self-transition Detached -> Attached; CAS, retried on race with
    /// the coordinator transitioning this thread to Parked underneath
    /// it (spec S4.3 table).
    pub fn self_attach(&self) {
        loop {
            match self.state.compare_exchange(
                MutatorState::Detached as u8,
                MutatorState::Attached as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) if current == MutatorState::Parked as u8 => {
                    // Coordinator got here first; wait for restart.
                    std::thread::yield_now();
                }
                Err(_) => return,
            }
        }
    }

    /// Called at a poll point (spec: "each bytecode dispatch checks
    /// it"). If a stop-the-world has been requested, self-parks and
    /// blocks until restarted.
    pub fn self_park_if_requested(&self) {
        if !self.eval_breaker_set(eval_breaker::STOP_THE_WORLD) {
            return;
        }
        if self.cant_stop.load(Ordering::Acquire) {
            return;
        }
        self.state.store(MutatorState::Parked as u8, Ordering::Release);
        registry().notify_parked();
        registry().wait_for_restart();
        self.state.store(MutatorState::Attached as u8, Ordering::Release);
        self.clear_eval_breaker(eval_breaker::STOP_THE_WORLD);
    }

    fn park_if_detached(&self) -> bool {
        self.state
            .compare_exchange(
                MutatorState::Detached as u8,
                MutatorState::Parked as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn restart(&self) {
        self.state.store(MutatorState::Detached as u8, Ordering::Release);
    }
}

/// RAII guard marking a critical section the coordinator must never
/// park out from under (spec S4.3 cancellation). Must only be held
/// across bounded, non-blocking work.
pub struct CantStopGuard<'a> {
    handle: &'a MutatorHandle,
}

impl<'a> CantStopGuard<'a> {
    pub fn new(handle: &'a MutatorHandle) -> Self {
        handle.cant_stop.store(true, Ordering::Release);
        Self { handle }
    }
}

impl Drop for CantStopGuard<'_> {
    fn drop(&mut self) {
        self.handle.cant_stop.store(false, Ordering::Release);
    }
}

/// RAII guard returned by `register()`; unregisters and abandons the
/// calling thread's heaps on drop (thread-exit path, spec S4.4).
pub struct RegistrationGuard {
    handle: Arc<MutatorHandle>,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        registry().unregister(self.handle.id);
    }
}

impl RegistrationGuard {
    pub fn handle(&self) -> &Arc<MutatorHandle> {
        &self.handle
    }
}

/// Global thread registry and stop-the-world coordinator.
pub struct ThreadRegistry {
    mutators: DashMap<ThreadId, Arc<MutatorHandle>>,
    stw_mutex: Mutex<()>,
    stw_depth: AtomicU32,
    /// Thread currently holding the world stopped, `ThreadId::NONE` when
    /// nobody does. Checked before locking `stw_mutex` so a nested call
    /// from the same thread doesn't deadlock on itself.
    stw_owner: AtomicU64,
    parked_condvar: Condvar,
    parked_lock: Mutex<()>,
    restart_condvar: Condvar,
    restart_lock: Mutex<bool>,
    pub timeout: Option<Duration>,
}

static REGISTRY: Lazy<ThreadRegistry> = Lazy::new(ThreadRegistry::new);

pub fn registry() -> &'static ThreadRegistry {
    &REGISTRY
}

impl ThreadRegistry {
    fn new() -> Self {
        Self {
            mutators: DashMap::new(),
            stw_mutex: Mutex::new(()),
            stw_depth: AtomicU32::new(0),
            stw_owner: AtomicU64::new(ThreadId::NONE.as_u64()),
            parked_condvar: Condvar::new(),
            parked_lock: Mutex::new(()),
            restart_condvar: Condvar::new(),
            restart_lock: Mutex::new(false),
            timeout: crate::config::runtime_config().stw_timeout,
        }
    }

    /// Register the calling thread as a mutator. Returns a guard that
    /// unregisters on drop.
    pub fn register(&self) -> RegistrationGuard {
        let id = current_thread_id();
        let handle = Arc::new(MutatorHandle::new(id));
        self.mutators.insert(id, handle.clone());
        trace!(event = "mutator_registered", thread = id.as_u64());
        RegistrationGuard { handle }
    }

    fn unregister(&self, id: ThreadId) {
        self.mutators.remove(&id);
        trace!(event = "mutator_unregistered", thread = id.as_u64());
    }

    pub fn handle(&self, id: ThreadId) -> Option<Arc<MutatorHandle>> {
        self.mutators.get(&id).map(|e| e.value().clone())
    }

    pub fn is_alive(&self, id: ThreadId) -> bool {
        self.mutators.contains_key(&id)
    }

    fn notify_parked(&self) {
        let _g = self.parked_lock.lock();
        self.parked_condvar.notify_all();
    }

    fn wait_for_restart(&self) {
        let mut restarted = self.restart_lock.lock();
        while !*restarted {
            self.restart_condvar.wait(&mut restarted);
        }
    }

    fn all_parked(&self, except: ThreadId) -> bool {
        self.mutators
            .iter()
            .all(|e| *e.key() == except || e.value().state() == MutatorState::Parked)
    }

    /// Stop the world: park every mutator but the caller. Re-entrant —
    /// only the outermost call actually pauses/resumes anyone (spec
    /// S4.3). A nested call from the thread already holding the world
    /// stopped must not re-lock `stw_mutex`, since `parking_lot::Mutex`
    /// isn't reentrant and the thread is both holder and waiter.
    pub fn stop_the_world(&self) -> StwGuard<'_> {
        let this = current_thread_id();

        if self.stw_owner.load(Ordering::Acquire) == this.as_u64() {
            self.stw_depth.fetch_add(1, Ordering::AcqRel);
            return StwGuard {
                registry: self,
                _mutex_guard: None,
                outermost: false,
            };
        }

        let guard = self.stw_mutex.lock();
        self.stw_owner.store(this.as_u64(), Ordering::Release);
        self.stw_depth.store(1, Ordering::Release);

        *self.restart_lock.lock() = false;
        debug!(event = "stop_the_world_begin", requester = this.as_u64());

        let started = Instant::now();
        loop {
            let mut stragglers = false;
            for entry in self.mutators.iter() {
                let id = *entry.key();
                if id == this {
                    continue;
                }
                let h = entry.value();
                match h.state() {
                    MutatorState::Parked => {}
                    MutatorState::Detached => {
                        if !h.park_if_detached() {
                            stragglers = true;
                        }
                    }
                    MutatorState::Attached => {
                        h.set_eval_breaker(eval_breaker::STOP_THE_WORLD | eval_breaker::GC_REQUESTED);
                        stragglers = true;
                    }
                }
            }

            if !stragglers && self.all_parked(this) {
                break;
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() > timeout {
                    warn!(
                        event = "stop_the_world_timeout",
                        waited_ms = started.elapsed().as_millis() as u64,
                        "stop-the-world has not observed all mutators parked; a mutator may be holding a cant-stop section too long"
                    );
                }
            }

            let mut lock = self.parked_lock.lock();
            self.parked_condvar.wait_for(&mut lock, Duration::from_millis(1));
        }

        debug!(event = "stop_the_world_achieved", waited_us = started.elapsed().as_micros() as u64);

        StwGuard {
            registry: self,
            _mutex_guard: Some(guard),
            outermost: true,
        }
    }

    fn restart_the_world(&self) {
        let this = current_thread_id();
        for entry in self.mutators.iter() {
            if *entry.key() == this {
                continue;
            }
            entry.value().restart();
        }
        *self.restart_lock.lock() = true;
        self.restart_condvar.notify_all();
        debug!(event = "start_the_world");
        self.stw_depth.store(0, Ordering::Release);
        self.stw_owner.store(ThreadId::NONE.as_u64(), Ordering::Release);
    }

    /// Drain every registered mutator's foreign-decref inbox. Called
    /// during the collector's Prepare phase (spec S4.7 step 1) and may
    /// also be invoked by an idle mutator at its own safe point.
    pub fn drain_all_queues(&self) {
        for entry in self.mutators.iter() {
            let mut inbox = entry.value().inbox.lock();
            if inbox.is_empty() {
                continue;
            }
            let drained: Vec<_> = inbox.drain(..).collect();
            drop(inbox);
            crate::gc::decref_queue::apply_to_owner(entry.value(), drained);
        }
    }

    pub fn push_inbox(&self, owner: ThreadId, entry: crate::gc::decref_queue::QueuedDecref) -> bool {
        if let Some(handle) = self.handle(owner) {
            handle.inbox.lock().push(entry);
            true
        } else {
            false
        }
    }
}

/// Guard returned by `stop_the_world`; restarts mutators on drop, but
/// only for the outermost (non-re-entrant) acquisition.
pub struct StwGuard<'a> {
    registry: &'a ThreadRegistry,
    /// Held only by the outermost acquisition; nested guards carry `None`
    /// since they never locked `stw_mutex` in the first place.
    _mutex_guard: Option<parking_lot::MutexGuard<'a, ()>>,
    outermost: bool,
}

impl Drop for StwGuard<'_> {
    fn drop(&mut self) {
        if self.outermost {
            self.registry.restart_the_world();
        } else {
            self.registry.stw_depth.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
