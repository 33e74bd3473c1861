//! Read-copy-update list for callback tables.
//!
//! User code may bind or unbind from inside a callback that is itself being
//! dispatched. Readers therefore take an immutable snapshot and iterate
//! that; writers build a fresh vector under the lock and swap it in.

use std::sync::Arc;

use parking_lot::RwLock;

/// A concurrently readable, barrier-writable list.
pub struct SyncList<T> {
    items: RwLock<Arc<Vec<T>>>,
}

impl<T: Clone> SyncList<T> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// A stable snapshot for iteration; unaffected by later mutations.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.items.read())
    }

    /// Appends an item.
    pub fn push(&self, item: T) {
        let mut guard = self.items.write();
        let mut next = (**guard).clone();
        next.push(item);
        *guard = Arc::new(next);
    }

    /// Keeps only items matching the predicate.
    pub fn retain(&self, keep: impl Fn(&T) -> bool) {
        let mut guard = self.items.write();
        let mut next = (**guard).clone();
        next.retain(|item| keep(item));
        *guard = Arc::new(next);
    }

    /// Removes every item.
    pub fn clear(&self) {
        *self.items.write() = Arc::new(Vec::new());
    }

    /// Number of items currently present.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl<T: Clone> Default for SyncList<T> {
    fn default() -> Self {
        Self::new()
    }
}
