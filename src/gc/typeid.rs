//! Type-id pool - dense integer ids for heap types (spec S4.5)
//!
//! Grounded on `Include/internal/pycore_typeid.h` (`PyTypeIdPool`,
//! `PyTypeIdEntry`): a resizable table where an allocated entry holds a
//! type pointer and a free entry threads a next-pointer, with slot 0
//! reserved to mean "no id". A mutex serializes allocation, release and
//! resize; release pushes onto a LIFO free-list for reuse.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::allocator::TypeInfo;
use crate::gc::traversable::TraverseVtable;
use crate::threads::ThreadId;

/// A small dense id for a heap type. `0` means "no id assigned".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeId(u32);

impl TypeId {
    pub const NONE: TypeId = TypeId(0);

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        TypeId(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn vtable(self) -> Option<&'static TraverseVtable> {
        if self.0 == 0 {
            return None;
        }
        VTABLES.get(&self.0).map(|e| *e.value())
    }
}

enum Entry {
    Allocated(*const TypeInfo),
    Free(Option<u32>),
}

// Entries only ever read under the pool mutex; the TypeInfo pointers
// they hold are to `'static` type descriptors.
unsafe impl Send for Entry {}

struct TypeIdPool {
    table: Mutex<Vec<Entry>>,
    free_head: Mutex<Option<u32>>,
}

static POOL: Lazy<TypeIdPool> = Lazy::new(|| TypeIdPool {
    table: Mutex::new(vec![Entry::Free(None)]), // slot 0 reserved
    free_head: Mutex::new(None),
});

static VTABLES: Lazy<DashMap<u32, &'static TraverseVtable>> = Lazy::new(DashMap::new);

/// Allocate the next id from the pool for `type_info`, registering the
/// vtable its traversal calls dispatch through.
pub fn allocate(type_info: &'static TypeInfo, vtable: &'static TraverseVtable) -> TypeId {
    let mut free_head = POOL.free_head.lock();
    let mut table = POOL.table.lock();

    let id = if let Some(slot) = *free_head {
        let next = match table[slot as usize] {
            Entry::Free(next) => next,
            Entry::Allocated(_) => unreachable!("free-list corrupted"),
        };
        *free_head = next;
        table[slot as usize] = Entry::Allocated(type_info as *const TypeInfo);
        slot
    } else {
        let slot = table.len() as u32;
        table.push(Entry::Allocated(type_info as *const TypeInfo));
        slot
    };

    type_info.type_id.store(id, Ordering::Release);
    VTABLES.insert(id, vtable);
    TypeId(id)
}

/// Release a type id back to the pool's LIFO free-list (spec S4.5).
pub fn release(id: TypeId) {
    if id.0 == 0 {
        return;
    }
    let mut free_head = POOL.free_head.lock();
    let mut table = POOL.table.lock();
    table[id.0 as usize] = Entry::Free(*free_head);
    *free_head = Some(id.0);
    VTABLES.remove(&id.0);
}

/// Per-thread side-table of refcount deltas keyed by type id, avoiding
/// contention on a hot type's shared refcount (spec S4.5).
pub struct TypeRefSideTable {
    deltas: std::cell::RefCell<Vec<AtomicI64>>,
}

impl TypeRefSideTable {
    pub fn new() -> Self {
        Self {
            deltas: std::cell::RefCell::new(Vec::new()),
        }
    }

    fn ensure_len(&self, id: usize) {
        let mut deltas = self.deltas.borrow_mut();
        while deltas.len() <= id {
            deltas.push(AtomicI64::new(0));
        }
    }

    #[inline]
    pub fn incref(&self, id: TypeId) {
        self.ensure_len(id.0 as usize);
        self.deltas.borrow()[id.0 as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decref(&self, id: TypeId) {
        self.ensure_len(id.0 as usize);
        self.deltas.borrow()[id.0 as usize].fetch_sub(1, Ordering::Relaxed);
    }

    /// Merge every non-zero slot into its type's shared refcount and
    /// clear the slot. Called at safe points and thread exit.
    pub fn merge_all(&self, _owner: ThreadId) {
        let table = POOL.table.lock();
        let deltas = self.deltas.borrow();
        for (id, delta) in deltas.iter().enumerate() {
            let d = delta.swap(0, Ordering::AcqRel);
            if d == 0 {
                continue;
            }
            if let Some(Entry::Allocated(type_info)) = table.get(id) {
                let type_info: &TypeInfo = unsafe { &**type_info };
                type_info.agg_refs.fetch_add(d, Ordering::Relaxed);
            }
        }
    }
}

impl Default for TypeRefSideTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TYPE_INFO: TypeInfo = TypeInfo::simple(8, 8);
    const VT: TraverseVtable = crate::gc::traversable::vtable_for::<crate::fixtures::Leaf>();

    #[test]
    fn allocate_then_release_reuses_slot() {
        let id1 = allocate(&TYPE_INFO, &VT);
        release(id1);
        let id2 = allocate(&TYPE_INFO, &VT);
        assert_eq!(id1, id2);
    }

    #[test]
    fn slot_zero_never_allocated() {
        let id = allocate(&TYPE_INFO, &VT);
        assert_ne!(id.raw(), 0);
        release(id);
    }
}
