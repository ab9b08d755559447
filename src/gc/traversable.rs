//! Type contract: what a collectable type must supply (spec S6)
//!
//! Design Notes S9 calls for modeling per-type `traverse`/`clear`/
//! `finalize` function pointers as a trait object rather than a C-style
//! vtable switch; `VisitControl` mirrors `traverse`'s "stop if visit
//! returns non-zero" without reviving a raw integer return code.

use crate::allocator::ObjectHeader;

/// Returned by a traversal visitor to request the traversal continue or
/// stop early.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VisitControl {
    Continue,
    Stop,
}

/// Outcome of running a type's `finalize`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FinalizeOutcome {
    /// The object did not resurrect itself.
    NoResurrection,
    /// The object stored a new strong reference to itself somewhere
    /// reachable (e.g. a module global), reviving it.
    Resurrected,
}

/// Per-type behavior the collector needs. A type with no traversal is
/// treated as a leaf (spec S4.7 tie-break): implement only what applies.
pub trait Traversable {
    /// Call `visit` once for every strong outgoing reference. Stop
    /// early if `visit` returns `VisitControl::Stop`.
    fn traverse(&self, visit: &mut dyn FnMut(*mut ObjectHeader) -> VisitControl);

    /// Drop every strong outgoing reference, leaving the object valid
    /// but empty. Called once per object by the collector's clear
    /// phase (spec S4.7 step 9).
    fn clear(&mut self);

    /// Optional modern finalizer; may resurrect. Default: a no-op that
    /// never resurrects.
    fn finalize(&mut self) -> FinalizeOutcome {
        FinalizeOutcome::NoResurrection
    }

    /// Presence of a legacy `tp_del`-style finalizer marks the object
    /// uncollectable in cycles (spec S4.7 step 4, S6). Default: false.
    fn has_legacy_finalizer(&self) -> bool {
        false
    }
}

/// Visit every strong outgoing reference reachable from `header` via
/// its type's registered `Traversable` vtable, or treat it as a leaf if
/// none is registered.
pub(crate) fn traverse_header(
    header: *mut ObjectHeader,
    visit: &mut dyn FnMut(*mut ObjectHeader) -> VisitControl,
) {
    let vtable = unsafe { (*header).type_info().type_id().vtable() };
    if let Some(vt) = vtable {
        unsafe { (vt.traverse)(ObjectHeader::data_ptr(header), visit) };
    }
}

pub(crate) fn clear_header(header: *mut ObjectHeader) {
    let vtable = unsafe { (*header).type_info().type_id().vtable() };
    if let Some(vt) = vtable {
        unsafe { (vt.clear)(ObjectHeader::data_ptr(header)) };
    }
}

pub(crate) fn finalize_header(header: *mut ObjectHeader) -> FinalizeOutcome {
    let vtable = unsafe { (*header).type_info().type_id().vtable() };
    match vtable {
        Some(vt) => unsafe { (vt.finalize)(ObjectHeader::data_ptr(header)) },
        None => FinalizeOutcome::NoResurrection,
    }
}

pub(crate) fn has_legacy_finalizer_header(header: *mut ObjectHeader) -> bool {
    let vtable = unsafe { (*header).type_info().type_id().vtable() };
    match vtable {
        Some(vt) => unsafe { (vt.has_legacy_finalizer)(ObjectHeader::data_ptr(header)) },
        None => false,
    }
}

/// Type-erased entry point table installed per type-id, bridging the
/// raw heap representation to a `Traversable` implementation. Built by
/// the `register_type!` helper a type author calls once at startup.
pub struct TraverseVtable {
    pub traverse: unsafe fn(*mut u8, &mut dyn FnMut(*mut ObjectHeader) -> VisitControl),
    pub clear: unsafe fn(*mut u8),
    pub finalize: unsafe fn(*mut u8) -> FinalizeOutcome,
    pub has_legacy_finalizer: unsafe fn(*mut u8) -> bool,
}

/// Build a `TraverseVtable` for a concrete `T: Traversable` whose
/// instances live at the object's data pointer.
pub const fn vtable_for<T: Traversable>() -> TraverseVtable {
    unsafe fn traverse_impl<T: Traversable>(
        ptr: *mut u8,
        visit: &mut dyn FnMut(*mut ObjectHeader) -> VisitControl,
    ) {
        (*(ptr as *mut T)).traverse(visit)
    }
    unsafe fn clear_impl<T: Traversable>(ptr: *mut u8) {
        (*(ptr as *mut T)).clear()
    }
    unsafe fn finalize_impl<T: Traversable>(ptr: *mut u8) -> FinalizeOutcome {
        (*(ptr as *mut T)).finalize()
    }
    unsafe fn has_legacy_finalizer_impl<T: Traversable>(ptr: *mut u8) -> bool {
        (*(ptr as *mut T)).has_legacy_finalizer()
    }

    TraverseVtable {
        traverse: traverse_impl::<T>,
        clear: clear_impl::<T>,
        finalize: finalize_impl::<T>,
        has_legacy_finalizer: has_legacy_finalizer_impl::<T>,
    }
}
