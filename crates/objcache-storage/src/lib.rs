//! objcache Storage - Persistent index and space allocation
//!
//! This crate implements the on-disk core of an objcache volume:
//! - Dual A/B metadata slots with torn-write detection
//! - A range index mapping cache keys to on-disk spans
//! - A circular write cursor whose laps evict old data implicitly
//! - Raw volume I/O (O_DIRECT on Linux)
//! - Spin lock and RCU-style snapshot cell for publishing the index

pub mod allocator;
pub mod cursor;
pub mod layout;
pub mod metadata;
pub mod raw_io;
pub mod slots;
pub mod sync;
pub mod table;
pub mod volume;

// Re-exports
pub use allocator::{Allocation, CircularAllocator};
pub use cursor::{WRITE_CURSOR_SIZE, WriteCursor};
pub use layout::{CONTROL_BLOCK_SIZE, ControlBlock, FormatVersion, MAGIC, compare_serials};
pub use metadata::{InvalidReason, SlotState, VolumeMetadata, check_slot, select_slot};
pub use raw_io::{AlignedBuffer, RawFile};
pub use slots::{FileSlots, MemorySlots, SlotReader, SlotWriter};
pub use sync::{SnapshotCell, SpinLock, SpinLockGuard};
pub use table::{AddOutcome, RANGE_ENTRY_SIZE, RangeEntry, RangeSpan, RangeTable};
pub use volume::{IndexSnapshot, Volume};
