//! Minimal `Traversable` demo types
//!
//! Not part of the public surface in spirit - there is no dict, list or
//! tuple implementation here, only the smallest shapes that exercise
//! the collector's cycle-forming and leaf cases. Used by this crate's
//! own tests and by the end-to-end scenario tests in `tests/`.

use std::cell::RefCell;

use crate::gc::refcount::GcRef;
use crate::gc::traversable::{FinalizeOutcome, Traversable, VisitControl};
use crate::allocator::ObjectHeader;

/// A leaf with no outgoing references.
pub struct Leaf {
    pub value: i64,
}

impl Traversable for Leaf {
    fn traverse(&self, _visit: &mut dyn FnMut(*mut ObjectHeader) -> VisitControl) {}
    fn clear(&mut self) {}
}

/// A node that can point at another node, forming cycles when two
/// `Pair`s reference each other.
pub struct Pair {
    pub other: RefCell<Option<GcRef<Pair>>>,
    pub finalized: RefCell<bool>,
    pub resurrect_on_finalize: bool,
    pub legacy_finalizer: bool,
}

impl Pair {
    pub fn new() -> Self {
        Self {
            other: RefCell::new(None),
            finalized: RefCell::new(false),
            resurrect_on_finalize: false,
            legacy_finalizer: false,
        }
    }

    pub fn link(&self, other: GcRef<Pair>) {
        *self.other.borrow_mut() = Some(other);
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new()
    }
}

impl Traversable for Pair {
    fn traverse(&self, visit: &mut dyn FnMut(*mut ObjectHeader) -> VisitControl) {
        if let Some(other) = self.other.borrow().as_ref() {
            let header = unsafe { ObjectHeader::from_object(other.as_ptr() as *mut u8) };
            visit(header);
        }
    }

    fn clear(&mut self) {
        *self.other.borrow_mut() = None;
    }

    fn finalize(&mut self) -> FinalizeOutcome {
        *self.finalized.borrow_mut() = true;
        if self.resurrect_on_finalize {
            FinalizeOutcome::Resurrected
        } else {
            FinalizeOutcome::NoResurrection
        }
    }

    fn has_legacy_finalizer(&self) -> bool {
        self.legacy_finalizer
    }
}
