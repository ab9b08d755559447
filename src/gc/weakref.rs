//! Weak reference graph - a per-referent ring of weakrefs (spec S4.6)
//!
//! Grounded on CPython's `weakrefobject.c`: every referent that has ever
//! had a weakref taken on it gets a "root" weakref holding the ring.
//! Creating the root is a CAS race (losers retry-read); inserting a
//! second weakref into an existing ring, and tearing the ring down when
//! the referent dies, both go through the root's mutex. The ring itself
//! is a `Vec<Arc<WeakrefNode>>` behind that mutex rather than an
//! intrusive `prev`/`next` list - every mutation already holds the
//! mutex, so there is no lock-free traversal to support and a `Vec`
//! gives batch draining for free. Callbacks run outside the mutex so a
//! callback that creates another weakref cannot deadlock.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::allocator::ObjectHeader;
use crate::logging::log_weakref_callback;

/// What kind of weak handle a node represents (spec S4.6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WeakrefKind {
    Plain,
    Proxy,
    CallableProxy,
}

/// Sentinel stored in a referent's slot once it has been torn down, so
/// a racing upgrade observes "dead" rather than a stale pointer.
const DEAD_SENTINEL: *mut ObjectHeader = 1 as *mut ObjectHeader;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct WeakrefNode {
    kind: WeakrefKind,
    callback: Option<Callback>,
}

/// The root of a referent's weakref ring. Holds the mutex that guards
/// every insertion and teardown for that referent.
struct WeakrefRoot {
    referent: AtomicPtr<ObjectHeader>,
    ring: Mutex<Vec<Arc<WeakrefNode>>>,
    /// A single shared no-callback proxy, reused across callers (spec
    /// S4.6: "reuses a single shared proxy instance per referent").
    shared_proxy: Mutex<Option<Arc<WeakrefNode>>>,
}

static ROOTS: Lazy<DashMap<usize, Arc<WeakrefRoot>>> = Lazy::new(DashMap::new);

fn key_of(header: *mut ObjectHeader) -> usize {
    header as usize
}

/// Get the existing root for `header`, or publish a freshly created one
/// via CAS-style `entry` (spec S4.6: "losers discard their candidate").
fn get_or_create_root(header: *mut ObjectHeader) -> Arc<WeakrefRoot> {
    ROOTS
        .entry(key_of(header))
        .or_insert_with(|| {
            Arc::new(WeakrefRoot {
                referent: AtomicPtr::new(header),
                ring: Mutex::new(Vec::new()),
                shared_proxy: Mutex::new(None),
            })
        })
        .clone()
}

/// A handle a caller holds; dropping it detaches the node from its
/// referent's ring.
pub struct WeakrefHandle {
    header: *mut ObjectHeader,
    node: Arc<WeakrefNode>,
}

unsafe impl Send for WeakrefHandle {}

impl WeakrefHandle {
    /// Attempt to upgrade to a strong reference. Returns `None` if the
    /// referent has already been torn down (spec S4.6 "dead object"
    /// sentinel).
    pub fn upgrade(&self) -> Option<*mut ObjectHeader> {
        let root = ROOTS.get(&key_of(self.header))?;
        let _guard = root.ring.lock();
        let current = root.referent.load(Ordering::Acquire);
        if current.is_null() || current == DEAD_SENTINEL {
            return None;
        }
        let header = unsafe { &*current };
        if super::refcount::inc_if_nonzero(header) {
            Some(current)
        } else {
            None
        }
    }

    pub fn kind(&self) -> WeakrefKind {
        self.node.kind
    }
}

/// Create a weakref of `kind` on `header`, with an optional callback.
/// A `Proxy`/`CallableProxy` request with no callback shares the
/// referent's single proxy node instead of allocating a new one.
pub fn create_weakref(
    header: *mut ObjectHeader,
    kind: WeakrefKind,
    callback: Option<Callback>,
) -> WeakrefHandle {
    let root = get_or_create_root(header);

    if callback.is_none() && kind != WeakrefKind::Plain {
        let mut shared = root.shared_proxy.lock();
        if let Some(existing) = shared.as_ref() {
            return WeakrefHandle {
                header,
                node: existing.clone(),
            };
        }
        let node = Arc::new(WeakrefNode {
            kind,
            callback: None,
        });
        *shared = Some(node.clone());
        root.ring.lock().push(node.clone());
        return WeakrefHandle { header, node };
    }

    let node = Arc::new(WeakrefNode {
        kind,
        callback,
    });
    root.ring.lock().push(node.clone());
    WeakrefHandle { header, node }
}

pub fn is_tracked(header: *mut ObjectHeader) -> bool {
    ROOTS.contains_key(&key_of(header))
}

/// Tear down every weakref on `header`'s ring: publish the dead
/// sentinel, then walk the ring in batches of up to 16, invoking
/// callbacks outside the root mutex (spec S4.6).
pub fn clear_referent(header: *mut ObjectHeader) {
    let Some(root) = ROOTS.get(&key_of(header)).map(|e| e.clone()) else {
        return;
    };

    let nodes: Vec<Arc<WeakrefNode>> = {
        let mut ring = root.ring.lock();
        root.referent.store(DEAD_SENTINEL, Ordering::Release);
        ring.drain(..).collect()
    };

    for batch in nodes.chunks(16) {
        for node in batch {
            if let Some(cb) = &node.callback {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb()));
                match result {
                    Ok(()) => log_weakref_callback(true),
                    Err(payload) => {
                        log_weakref_callback(false);
                        crate::errors::report_unraisable(crate::errors::UnraisableError::from_panic_payload(
                            "weakref callback",
                            payload,
                        ));
                    }
                }
            }
        }
    }

    ROOTS.remove(&key_of(header));
}
