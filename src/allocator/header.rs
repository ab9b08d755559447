//! Object header layout - the bits every heap allocation carries
//!
//! Design: a fixed-size, 8-byte-aligned header prefixed to every object.
//! The refcount is split into a thread-local half (`local`, a plain
//! `Cell`, touched only by the owning thread) and a shared half
//! (`shared`, an `AtomicU32`, touched by any thread). `owner` names the
//! thread whose `local` half this is; the cycle collector keeps its own
//! `gc_refs` scratch space off to the side rather than borrowing this
//! field, since a collection's finalizer phase runs with the world
//! restarted and mutators may still need to read `owner` correctly.

use core::cell::Cell;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::threads::ThreadId;

/// Local refcount word: bits 4.. count, bit 0 immortal, bit 1 deferred.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LocalWord(u32);

const LOCAL_IMMORTAL_BIT: u32 = 1 << 0;
const LOCAL_DEFERRED_BIT: u32 = 1 << 1;
const LOCAL_COUNT_SHIFT: u32 = 4;

impl LocalWord {
    pub const ZERO: LocalWord = LocalWord(0);

    #[inline]
    pub const fn new(count: u32) -> Self {
        LocalWord(count << LOCAL_COUNT_SHIFT)
    }

    #[inline]
    pub fn count(self) -> u32 {
        self.0 >> LOCAL_COUNT_SHIFT
    }

    #[inline]
    pub fn is_immortal(self) -> bool {
        self.0 & LOCAL_IMMORTAL_BIT != 0
    }

    #[inline]
    pub fn is_deferred(self) -> bool {
        self.0 & LOCAL_DEFERRED_BIT != 0
    }

    #[inline]
    #[must_use]
    pub fn with_immortal(self) -> Self {
        LocalWord(self.0 | LOCAL_IMMORTAL_BIT)
    }

    #[inline]
    #[must_use]
    pub fn with_deferred(self) -> Self {
        LocalWord(self.0 | LOCAL_DEFERRED_BIT)
    }

    #[inline]
    #[must_use]
    pub fn incremented(self) -> Self {
        LocalWord(self.0 + (1 << LOCAL_COUNT_SHIFT))
    }

    #[inline]
    #[must_use]
    pub fn decremented(self) -> Self {
        debug_assert!(self.count() > 0, "local refcount underflow");
        LocalWord(self.0 - (1 << LOCAL_COUNT_SHIFT))
    }
}

/// Shared refcount word: bits 2.. count, bit 0 merged, bit 1 queued.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SharedWord(u32);

const SHARED_MERGED_BIT: u32 = 1 << 0;
const SHARED_QUEUED_BIT: u32 = 1 << 1;
const SHARED_COUNT_SHIFT: u32 = 2;

impl SharedWord {
    #[inline]
    pub const fn new(count: u32) -> Self {
        SharedWord(count << SHARED_COUNT_SHIFT)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        SharedWord(raw)
    }

    #[inline]
    pub fn count(self) -> u32 {
        self.0 >> SHARED_COUNT_SHIFT
    }

    #[inline]
    pub fn is_merged(self) -> bool {
        self.0 & SHARED_MERGED_BIT != 0
    }

    #[inline]
    pub fn is_queued(self) -> bool {
        self.0 & SHARED_QUEUED_BIT != 0
    }

    #[inline]
    #[must_use]
    pub fn with_merged(self) -> Self {
        SharedWord(self.0 | SHARED_MERGED_BIT)
    }

    #[inline]
    #[must_use]
    pub fn with_queued(self) -> Self {
        SharedWord(self.0 | SHARED_QUEUED_BIT)
    }

    #[inline]
    #[must_use]
    pub fn plus(self, delta: i64) -> Self {
        let new_count = (self.count() as i64 + delta).max(0) as u32;
        SharedWord((new_count << SHARED_COUNT_SHIFT) | (self.0 & (SHARED_MERGED_BIT | SHARED_QUEUED_BIT)))
    }

    /// A merged, zero-count word: the sentinel a deallocator must publish
    /// before freeing so `inc_if_nonzero` on a foreign thread fails
    /// instead of resurrecting a freed block.
    #[inline]
    pub fn is_merged_zero(self) -> bool {
        self.is_merged() && self.count() == 0
    }
}

/// The three per-object GC flags: tracked, unreachable, finalized.
///
/// Hand-rolled rather than pulled in from a crate: it's three bits on a
/// byte, not worth a dependency.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct GcBits(u8);

impl GcBits {
    pub const EMPTY: GcBits = GcBits(0);
    pub const TRACKED: GcBits = GcBits(1 << 0);
    pub const UNREACHABLE: GcBits = GcBits(1 << 1);
    pub const FINALIZED: GcBits = GcBits(1 << 2);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        GcBits(bits)
    }

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub fn inserted(self, other: Self) -> Self {
        GcBits(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub fn removed(self, other: Self) -> Self {
        GcBits(self.0 & !other.0)
    }
}

/// Per-type metadata shared by every instance of a type.
///
/// `traverse`/`clear`/`finalize` are resolved through the `Traversable`
/// trait object registered for the type (see `gc::traversable`); this
/// struct carries only the plain-data fields the allocator and
/// collector need without going through dynamic dispatch on every
/// field access.
#[repr(C)]
pub struct TypeInfo {
    pub size: usize,
    pub align: usize,
    pub type_id: AtomicU32,
    pub drop: Option<unsafe fn(*mut u8)>,
    /// Aggregate refcount for the type object itself, folded in from
    /// per-thread side-tables (spec S4.5) rather than touched directly
    /// by every instance's type lookup.
    pub agg_refs: AtomicI64,
}

impl TypeInfo {
    pub const fn simple(size: usize, align: usize) -> Self {
        Self {
            size,
            align,
            type_id: AtomicU32::new(0),
            drop: None,
            agg_refs: AtomicI64::new(0),
        }
    }

    pub const fn with_drop(size: usize, align: usize, drop: unsafe fn(*mut u8)) -> Self {
        Self {
            size,
            align,
            type_id: AtomicU32::new(0),
            drop: Some(drop),
            agg_refs: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn type_id(&self) -> crate::gc::typeid::TypeId {
        crate::gc::typeid::TypeId::from_raw(self.type_id.load(Ordering::Relaxed))
    }
}

/// Object header, prefixed before every heap object's data.
///
/// Invariants (spec S3): exactly one thread owns `local` at a time;
/// decrefs from that thread touch `local` unsynchronized; decrefs from
/// any other thread touch `shared` atomically or land in a decref
/// queue.
#[repr(C, align(8))]
pub struct ObjectHeader {
    pub type_info: NonNull<TypeInfo>,
    pub local: Cell<LocalWord>,
    pub shared: AtomicU32,
    pub owner: AtomicU64,
    pub gc_bits: AtomicU8,
}

// The header is read from arbitrary threads under the synchronization
// rules documented above (owner-exclusive for `local`, atomic for the
// rest); it is never aliased mutably outside those rules.
unsafe impl Sync for ObjectHeader {}

impl ObjectHeader {
    #[inline]
    pub fn new(type_info: NonNull<TypeInfo>, owner: ThreadId) -> Self {
        Self {
            type_info,
            local: Cell::new(LocalWord::new(1)),
            shared: AtomicU32::new(SharedWord::new(0).raw()),
            owner: AtomicU64::new(owner.as_u64()),
            gc_bits: AtomicU8::new(0),
        }
    }

    /// Header address for an object pointer (the header sits
    /// immediately before the object's data).
    #[inline]
    pub unsafe fn from_object(obj: *mut u8) -> *mut Self {
        obj.sub(core::mem::size_of::<ObjectHeader>()) as *mut Self
    }

    #[inline]
    pub fn data_ptr(header: *mut Self) -> *mut u8 {
        unsafe { (header as *mut u8).add(core::mem::size_of::<ObjectHeader>()) }
    }

    #[inline]
    pub fn owner_thread(&self) -> ThreadId {
        ThreadId::from_u64(self.owner.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn shared_word(&self) -> SharedWord {
        SharedWord::from_raw(self.shared.load(Ordering::Acquire))
    }

    #[inline]
    pub fn gc_bits(&self) -> GcBits {
        GcBits::from_bits(self.gc_bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_gc_bits(&self, bits: GcBits) {
        self.gc_bits.store(bits.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn insert_gc_bits(&self, bits: GcBits) {
        self.gc_bits.fetch_or(bits.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn remove_gc_bits(&self, bits: GcBits) {
        self.gc_bits.fetch_and(!bits.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn type_info(&self) -> &TypeInfo {
        unsafe { self.type_info.as_ref() }
    }
}
