//! Corobox - a concurrent biased-refcounting and cycle-collecting
//! memory-management core for a dynamic-language runtime
//!
//! Modeled on CPython's free-threaded ("nogil") fork: every object
//! carries a split local/shared refcount (`gc::refcount`), mutator
//! threads coordinate through a stop-the-world safe-point registry
//! (`threads`), and cycles that refcounting alone can't reclaim are
//! found by a whole-heap tracing pass (`gc::cycles`). There is no
//! object model or bytecode interpreter here - this crate supplies the
//! memory substrate a runtime builds those on top of.

#![allow(dead_code)]

pub mod allocator;
pub mod config;
pub mod errors;
pub mod fixtures;
pub mod gc;
pub mod logging;
pub mod threads;

use threads::RegistrationGuard;

/// A handle for one mutator thread's participation in the runtime.
/// Dropping it unregisters the thread and abandons its heaps (spec
/// S4.3, S4.4).
pub struct ThreadContext {
    _registration: RegistrationGuard,
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Order matters: abandon the heap (spec S4.4) before
        // unregistering (which `_registration`'s own drop does next),
        // so a stop-the-world racing this thread's exit never observes
        // it unregistered while still holding exclusive heap access.
        allocator::abandon_current_thread_heap();
    }
}

/// Register the calling thread as a mutator, returning a guard that
/// unregisters and abandons its heaps on drop.
pub fn attach_thread() -> ThreadContext {
    allocator::init();
    ThreadContext {
        _registration: threads::registry().register(),
    }
}

/// Initialize process-wide runtime state. Idempotent; call once before
/// any thread calls `attach_thread`.
pub fn init() {
    logging::init();
    gc::init();
}

/// Best-effort shutdown: run a final collection so finalizers get a
/// chance to observe process exit, logging the outcome.
pub fn shutdown() {
    logging::log_runtime_shutdown();
    gc::collect(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_then_drop_unregisters() {
        init();
        let id;
        {
            let ctx = attach_thread();
            id = threads::current_thread_id();
            assert!(threads::registry().is_alive(id));
            drop(ctx);
        }
        assert!(!threads::registry().is_alive(id));
    }
}
