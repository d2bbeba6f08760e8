//! Process-wide table of live heaps keyed by arena range.
//!
//! The context stack only knows the heaps a thread has pushed. A pointer that
//! outlives its scope (a `Vec` allocated inside a [`crate::HeapScope`] and
//! dropped after it) is found here instead of being handed to the system
//! allocator.
//!
//! Every heap is registered; the table grows as needed. It is only touched
//! with the thread inside the allocator, so its own buffer comes from the
//! system allocator. Nothing is freed while the write lock is held: a free
//! routes back through [`find_owner`] on the same thread.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use parking_lot::{const_rwlock, RwLock};

use super::Heap;
use crate::routing;

const INITIAL_CAPACITY: usize = 16;

struct Entry {
    start: usize,
    end: usize,
    heap: Weak<Heap>,
}

impl Entry {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

static REGISTRY: RwLock<Vec<Entry>> = const_rwlock(Vec::new());

pub(crate) fn register(heap: &Arc<Heap>) {
    let _reentry = routing::enter_router();
    let entry = Entry {
        start: heap.base_addr(),
        end: heap.base_addr() + heap.capacity(),
        heap: Arc::downgrade(heap),
    };

    let mut table = REGISTRY.write();
    let retired = if table.len() == table.capacity() {
        let mut grown = Vec::with_capacity((table.capacity() * 2).max(INITIAL_CAPACITY));
        grown.append(&mut table);
        Some(std::mem::replace(&mut *table, grown))
    } else {
        None
    };
    table.push(entry);
    drop(table);

    drop(retired);
}

/// Removes `heap`. Called from `Heap::drop`, after the last strong
/// reference is gone, so no lookup can hand the heap out again.
pub(crate) fn unregister(heap: &Heap) {
    let addr: *const Heap = heap;
    let removed = {
        let mut table = REGISTRY.write();
        table
            .iter()
            .position(|entry| std::ptr::eq(entry.heap.as_ptr(), addr))
            .map(|index| table.swap_remove(index))
    };
    drop(removed);
}

/// The innermost live heap whose arena contains `ptr`.
///
/// The lock is released before returning, so dropping the returned `Arc`
/// (even as the last reference) is safe.
pub(crate) fn find_owner(ptr: NonNull<u8>) -> Option<Arc<Heap>> {
    let addr = ptr.as_ptr() as usize;
    let table = REGISTRY.read();
    table
        .iter()
        .filter(|entry| (entry.start..entry.end).contains(&addr))
        .filter_map(|entry| entry.heap.upgrade().map(|heap| (entry.len(), heap)))
        .min_by_key(|(len, _)| *len)
        .map(|(_, heap)| heap)
}
