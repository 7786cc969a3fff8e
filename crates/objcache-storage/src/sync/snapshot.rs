//! Versioned snapshot cell
//!
//! Publishes an immutable value to any number of reader threads. The cell
//! holds one `Arc<T>` slot guarded by a [`SpinLock`]; the lock covers only
//! the reference clone or swap, so readers never wait on a writer's work
//! and never wait on each other for longer than a pointer copy.
//!
//! A displaced value is never dropped inside the critical section. Its
//! lifetime is that of its longest current holder: readers that obtained
//! it earlier keep it alive, and the last one out frees it.

use super::spin::SpinLock;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// RCU-style cell holding the currently published `Arc<T>`
pub struct SnapshotCell<T> {
    slot: SpinLock<Option<Arc<T>>>,
}

impl<T> SnapshotCell<T> {
    /// Create a cell with nothing published
    pub const fn empty() -> Self {
        Self {
            slot: SpinLock::new(None),
        }
    }

    /// Create a cell publishing `value`
    pub fn new(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Create a cell publishing an existing reference
    pub fn from_arc(value: Arc<T>) -> Self {
        Self {
            slot: SpinLock::new(Some(value)),
        }
    }

    /// Take over whatever `source` publishes, leaving `source` empty
    pub fn transfer(source: &Self) -> Self {
        Self {
            slot: SpinLock::new(source.release()),
        }
    }

    /// The currently published value, or `None` if the cell is empty
    pub fn read(&self) -> Option<Arc<T>> {
        let current = self.slot.lock().clone();
        trace!(published = current.is_some(), "snapshot_cell_read");
        current
    }

    /// Publish a new value, replacing the previous one
    pub fn update(&self, value: T) {
        self.update_arc(Arc::new(value));
    }

    /// Publish an existing reference, replacing the previous one
    pub fn update_arc(&self, value: Arc<T>) {
        let previous = self.slot.lock().replace(value);
        trace!(replaced = previous.is_some(), "snapshot_cell_update");
        // Lock already released; an expensive destructor runs out here
        drop(previous);
    }

    /// Take the published value out of the cell, leaving it empty
    pub fn release(&self) -> Option<Arc<T>> {
        let taken = self.slot.lock().take();
        trace!(released = taken.is_some(), "snapshot_cell_release");
        taken
    }

    /// Check whether nothing is published
    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl<T> Clone for SnapshotCell<T> {
    /// Publishes a new reference to the same value; `T` is not copied
    fn clone(&self) -> Self {
        Self {
            slot: SpinLock::new(self.read()),
        }
    }
}

impl<T> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for SnapshotCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCell")
            .field("value", &self.read())
            .finish()
    }
}
