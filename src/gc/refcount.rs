//! Biased (split) reference-count primitives
//!
//! Every object's count is split into a thread-local half (`local`,
//! fast, unsynchronized) and a shared atomic half (`shared`). The
//! owning thread mutates `local` directly; any other thread mutates
//! `shared` with a CAS, or - if `local` has not yet been merged -
//! appends to a decref queue for the owner to apply later (spec S4.1,
//! S4.2). Once merged, all further ops go through `shared` only.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::allocator::{LocalWord, ObjectHeader, SharedWord};
use crate::logging::trace;
use crate::threads::{current_thread_id, ThreadId};

/// Outcome of a `dec` fast-path call.
#[derive(Debug, PartialEq, Eq)]
pub enum DecOutcome {
    /// The object is still alive.
    Alive,
    /// The combined count hit zero; the caller must deallocate.
    Deallocate,
    /// A foreign thread appended to the owner's decref queue; the owner
    /// will discover the decrement at its next safe point.
    Queued,
}

/// Fast-path increment (spec S4.1). Immortal objects are a no-op.
#[inline(always)]
pub fn inc(header: &ObjectHeader) {
    if header.local.get().is_immortal() {
        return;
    }

    if header.owner_thread() == current_thread_id() && !header.shared_word().is_merged() {
        let old = header.local.get();
        header.local.set(old.incremented());
    } else {
        header.shared.fetch_add(SharedWord::new(1).raw(), Ordering::Relaxed);
    }
}

/// Fast-path decrement (spec S4.1, S4.2). Returns what the caller
/// should do about it.
#[inline(always)]
pub fn dec(header: &ObjectHeader) -> DecOutcome {
    if header.local.get().is_immortal() {
        return DecOutcome::Alive;
    }

    let owner = header.owner_thread();
    let this_thread = current_thread_id();

    if owner == this_thread && !header.shared_word().is_merged() {
        let old = header.local.get();
        if old.count() == 0 {
            // Already merged by a racing path or never incremented
            // locally (object created and immediately handed off);
            // fall through to the shared word.
            return dec_shared_from(header, this_thread, owner);
        }
        let new = old.decremented();
        header.local.set(new);
        if new.count() == 0 {
            merge_to_shared(header);
            if header.shared_word().count() == 0 {
                return DecOutcome::Deallocate;
            }
        }
        DecOutcome::Alive
    } else if owner == this_thread {
        // Merged already; owner keeps using the shared path.
        dec_shared_from(header, this_thread, owner)
    } else {
        dec_shared_from(header, this_thread, owner)
    }
}

fn dec_shared_from(header: &ObjectHeader, this_thread: ThreadId, owner: ThreadId) -> DecOutcome {
    if header.shared_word().is_merged() || this_thread == owner {
        if dec_shared(header) {
            DecOutcome::Deallocate
        } else {
            DecOutcome::Alive
        }
    } else {
        // Owner hasn't merged yet: this decrement can't be resolved
        // without racing the owner's unsynchronized local word. Queue
        // it for eventual delivery instead (spec S4.2).
        let raw_ptr = header as *const ObjectHeader as *mut ObjectHeader;
        crate::gc::decref_queue::queue_object(raw_ptr, owner);
        DecOutcome::Queued
    }
}

/// Decrement the shared word directly, atomically. Returns `true` if
/// this call drove the combined count to zero (merged and zero).
#[inline]
pub fn dec_shared(header: &ObjectHeader) -> bool {
    let mut current = header.shared_word();
    loop {
        let next = current.plus(-1);
        match header.shared.compare_exchange_weak(
            current.raw(),
            next.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return next.is_merged() && next.count() == 0,
            Err(observed) => current = SharedWord::from_raw(observed),
        }
    }
}

/// Apply one queued foreign decref against the owner's local word. Only
/// ever called by the owner thread itself (from `decref_queue`).
pub fn dec_local_from_queue(header: &ObjectHeader) {
    if header.local.get().is_immortal() {
        return;
    }
    let old = header.local.get();
    if old.count() == 0 {
        dec_shared(header);
        return;
    }
    let new = old.decremented();
    header.local.set(new);
    if new.count() == 0 {
        merge_to_shared(header);
    }
}

/// Fold the local half into the shared half, setting the merged bit.
/// Idempotent: a second call on an already-merged header is a no-op.
#[inline]
pub fn merge_to_shared(header: &ObjectHeader) {
    if header.shared_word().is_merged() {
        return;
    }
    let local_count = header.local.get().count() as i64;
    header.local.set(LocalWord::ZERO);
    let mut current = header.shared_word();
    loop {
        let next = current.plus(local_count).with_merged();
        match header.shared.compare_exchange_weak(
            current.raw(),
            next.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(observed) => current = SharedWord::from_raw(observed),
        }
    }
}

/// CAS-based increment that fails if the object is already known dead
/// (merged-and-zero). Used by weakref upgrade and by dictionary probes
/// that must not resurrect a freed object (spec S4.1).
#[inline]
pub fn inc_if_nonzero(header: &ObjectHeader) -> bool {
    if header.local.get().is_immortal() {
        return true;
    }
    let mut current = header.shared_word();
    loop {
        if current.is_merged_zero() {
            return false;
        }
        let next = current.plus(1);
        match header.shared.compare_exchange_weak(
            current.raw(),
            next.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(observed) => current = SharedWord::from_raw(observed),
        }
    }
}

/// Mark an object immortal; all further refcount ops on it are no-ops.
#[inline]
pub fn set_immortal(header: &ObjectHeader) {
    header.local.set(header.local.get().with_immortal());
}

/// Total live count: local + shared, ignoring the deferred bit (the
/// collector reconciles deferred counts separately, spec S3).
#[inline]
pub fn total_count(header: &ObjectHeader) -> u64 {
    header.local.get().count() as u64 + header.shared_word().count() as u64
}

/// Reference-counted smart pointer over a tracked or untracked heap
/// object. Cloning increments, dropping decrements; when a drop drives
/// the count to zero the type's destructor runs and the object is
/// handed back to its tag's heap.
pub struct GcRef<T> {
    ptr: NonNull<T>,
}

impl<T> GcRef<T> {
    /// Wrap a freshly allocated object (header already initialized with
    /// local count 1 by the allocator).
    #[inline]
    pub unsafe fn from_raw_initialized(ptr: *mut T) -> Self {
        debug_assert!(!ptr.is_null());
        Self {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    #[inline]
    fn header(&self) -> &ObjectHeader {
        unsafe { &*ObjectHeader::from_object(self.ptr.as_ptr() as *mut u8) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn count(&self) -> u64 {
        total_count(self.header())
    }

    #[inline]
    pub fn mark_potential_cycle(&self) {
        let header_ptr = unsafe { ObjectHeader::from_object(self.ptr.as_ptr() as *mut u8) };
        super::cycles::register_candidate(header_ptr);
    }

    #[inline]
    pub fn into_raw(self) -> *mut T {
        let ptr = self.ptr.as_ptr();
        core::mem::forget(self);
        ptr
    }

    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    #[cold]
    unsafe fn destroy(&self) {
        let header = self.header();
        trace!(event = "object_destroyed", address = ?self.ptr.as_ptr());
        if let Some(drop_fn) = header.type_info().drop {
            drop_fn(self.ptr.as_ptr() as *mut u8);
        }
    }
}

impl<T> Clone for GcRef<T> {
    #[inline]
    fn clone(&self) -> Self {
        inc(self.header());
        Self { ptr: self.ptr }
    }
}

impl<T> Drop for GcRef<T> {
    #[inline]
    fn drop(&mut self) {
        match dec(self.header()) {
            DecOutcome::Deallocate => unsafe { self.destroy() },
            DecOutcome::Alive | DecOutcome::Queued => {}
        }
    }
}

impl<T> Deref for GcRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for GcRef<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

unsafe impl<T: Send> Send for GcRef<T> {}
unsafe impl<T: Sync> Sync for GcRef<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::TypeInfo;

    static TYPE_INFO: TypeInfo = TypeInfo::simple(8, 8);

    fn make_header() -> ObjectHeader {
        ObjectHeader::new(NonNull::from(&TYPE_INFO), current_thread_id())
    }

    #[test]
    fn owner_inc_dec_stays_on_local_word() {
        let header = make_header();
        inc(&header);
        assert_eq!(header.local.get().count(), 2);
        assert_eq!(dec(&header), DecOutcome::Alive);
        assert_eq!(header.local.get().count(), 1);
    }

    #[test]
    fn owner_dec_to_zero_merges_and_deallocates() {
        let header = make_header();
        assert_eq!(dec(&header), DecOutcome::Deallocate);
        assert!(header.shared_word().is_merged());
        assert_eq!(header.shared_word().count(), 0);
    }

    #[test]
    fn immortal_is_a_no_op() {
        let header = make_header();
        set_immortal(&header);
        inc(&header);
        inc(&header);
        assert_eq!(dec(&header), DecOutcome::Alive);
        assert_eq!(total_count(&header), 1);
    }

    #[test]
    fn inc_if_nonzero_fails_once_merged_zero() {
        let header = make_header();
        assert_eq!(dec(&header), DecOutcome::Deallocate);
        assert!(!inc_if_nonzero(&header));
    }

    #[test]
    fn inc_if_nonzero_succeeds_while_alive() {
        let header = make_header();
        merge_to_shared(&header);
        assert!(inc_if_nonzero(&header));
        assert_eq!(header.shared_word().count(), 2);
    }
}
