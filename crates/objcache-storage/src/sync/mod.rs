//! Synchronization primitives for publishing shared state
//!
//! - [`SpinLock`]: busy-wait mutual exclusion for critical sections that
//!   only swap a pointer
//! - [`SnapshotCell`]: RCU-style cell publishing an immutable `Arc<T>`

mod snapshot;
mod spin;

pub use snapshot::SnapshotCell;
pub use spin::{SpinLock, SpinLockGuard};
