//! Error types and the unraisable-exception hook (spec S7)
//!
//! Two error surfaces: `GcError`, returned from fallible public-API
//! calls, and `UnraisableError`, which never returns anywhere - a
//! callback (weakref, finalizer, progress callback) that panics is
//! caught at the boundary and funneled to a process-wide hook instead
//! of unwinding through collector internals. `InternalInvariantViolation`
//! is not a `Result` variant at all: it means the heap is no longer
//! trustworthy, so it aborts the process rather than propagate.

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;

#[derive(Debug)]
pub enum GcError {
    /// The allocator could not satisfy a request (arena allocation
    /// failed against the OS).
    OutOfMemory { requested_bytes: usize },
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory { requested_bytes } => {
                write!(f, "allocation of {} bytes failed", requested_bytes)
            }
        }
    }
}

impl std::error::Error for GcError {}

/// An error captured from user callback code (weakref callback, modern
/// finalizer, progress callback) that would otherwise have nowhere to
/// propagate to (spec S4.7 "Failure semantics").
#[derive(Debug)]
pub struct UnraisableError {
    pub context: &'static str,
    pub message: String,
}

impl UnraisableError {
    pub fn from_panic_payload(context: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { context, message }
    }
}

impl fmt::Display for UnraisableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unraisable error in {}: {}", self.context, self.message)
    }
}

type UnraisableHook = Box<dyn Fn(UnraisableError) + Send + Sync>;

fn default_hook(err: UnraisableError) {
    crate::logging::log_runtime_error(&err.to_string());
}

static UNRAISABLE_HOOK: Mutex<Option<UnraisableHook>> = Mutex::new(None);

/// Install a custom unraisable-exception hook, replacing the default
/// (which logs via `tracing::error!`).
pub fn set_unraisable_hook(hook: UnraisableHook) {
    *UNRAISABLE_HOOK.lock() = Some(hook);
}

/// Route an unraisable error to the installed hook, or the default.
pub fn report_unraisable(err: UnraisableError) {
    let hook = UNRAISABLE_HOOK.lock();
    match hook.as_ref() {
        Some(h) => h(err),
        None => default_hook(err),
    }
}

/// The heap graph is no longer self-consistent (a dangling or null
/// type pointer observed during traversal). Continuing would corrupt
/// memory rather than raise a catchable error, so this aborts the
/// process (spec S4.7 Design Notes).
#[cold]
#[inline(never)]
pub fn internal_invariant_violation(detail: &str) -> ! {
    crate::logging::log_runtime_error(&format!("internal invariant violation: {}", detail));
    std::process::abort();
}
