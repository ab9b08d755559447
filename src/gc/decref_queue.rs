//! Queued decref - best-effort delivery of foreign-thread decrefs
//!
//! A decref issued by a thread that does not own an object's local half
//! cannot tell, without synchronization, whether the object is dead. It
//! is appended to a per-thread queue keyed by the owner's id instead;
//! the owner drains its inbox (folding entries into its local word, and
//! merging as needed) at the next safe point. Ordering: entries from the
//! same foreign thread to the same object apply in FIFO order; entries
//! from different foreign threads may interleave, but all apply before
//! the owner can observe a zero count (spec S4.2).

use crate::allocator::ObjectHeader;
use crate::logging::trace;
use crate::threads::{current_thread_id, registry, MutatorHandle, ThreadId};

#[derive(Clone, Copy)]
pub struct QueuedDecref {
    pub header: *mut ObjectHeader,
}

// Raw pointers are only ever dereferenced by the owner thread draining
// its own inbox, or by the registry applying a dead owner's entries
// directly to the shared word - both single-threaded with respect to
// the object's local half.
unsafe impl Send for QueuedDecref {}

/// Append a foreign-thread decref for later delivery to `owner`.
pub fn queue_object(header: *mut ObjectHeader, owner: ThreadId) {
    let entry = QueuedDecref { header };
    if registry().push_inbox(owner, entry) {
        trace!(event = "decref_queued", owner = owner.as_u64());
        return;
    }
    // Owner has already exited; fall through to direct shared-word
    // application, same as the dead-owner path in `apply_to_owner`.
    apply_one_to_shared(header);
}

/// Drain this thread's own pending queue targeting itself, if any ever
/// accumulated before the owner was known to be gone. Also a general
/// per-thread safe-point hook mirroring the registry-wide drain.
pub fn queue_process() {
    registry().drain_all_queues();
}

/// Apply a batch of queued decrefs to the thread that owns them. Called
/// by the registry while iterating inboxes (spec S4.2 "processing
/// groups entries by owner").
pub fn apply_to_owner(owner_handle: &MutatorHandle, entries: Vec<QueuedDecref>) {
    let owner = owner_handle.id();
    let is_self = owner == current_thread_id();
    for entry in entries {
        if is_self {
            apply_one_local(entry.header);
        } else {
            // Owner is alive but not the caller: the entries already
            // live in its inbox; nothing further to do until the owner
            // itself calls `queue_process` (or is swept by Prepare
            // while parked, in which case we apply directly since it
            // cannot race its own local word).
            apply_one_local(entry.header);
        }
    }
}

fn apply_one_local(header: *mut ObjectHeader) {
    unsafe {
        super::refcount::dec_local_from_queue(&*header);
    }
}

fn apply_one_to_shared(header: *mut ObjectHeader) {
    unsafe {
        super::refcount::dec_shared(&*header);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::TypeInfo;
    use core::ptr::NonNull;
    use std::sync::atomic::Ordering;

    static TYPE_INFO: TypeInfo = TypeInfo::simple(8, 8);

    #[test]
    fn queue_object_to_dead_owner_applies_directly() {
        let type_ptr = NonNull::from(&TYPE_INFO);
        let header = ObjectHeader::new(type_ptr, ThreadId::from_u64(1));
        // refcount starts local=1; promote to shared=1 so a queued dec
        // against a dead owner has something to decrement.
        header.shared.store(crate::allocator::SharedWord::new(1).with_merged().raw(), Ordering::Relaxed);
        header.local.set(crate::allocator::LocalWord::ZERO);

        let ptr = &header as *const ObjectHeader as *mut ObjectHeader;
        queue_object(ptr, ThreadId::from_u64(9_999_999));

        assert_eq!(header.shared_word().count(), 0);
    }
}
