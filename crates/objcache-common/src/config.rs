//! Volume configuration and geometry
//!
//! `VolumeConfig` is what an operator writes (TOML). `VolumeGeometry` is
//! the validated, derived layout the storage core works against:
//!
//! ```text
//! +------------------+  0
//! |   (reserved)     |
//! +------------------+  metadata_offset
//! | Metadata slot A  |  slot_size
//! +------------------+
//! | Metadata slot B  |  slot_size
//! +------------------+  data_start
//! |   Data region    |  circular, appended at the write cursor
//! +------------------+  capacity
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Alignment of every region boundary (4KB)
pub const ALIGNMENT: u64 = 4096;

/// Number of redundant metadata slots per volume
pub const SLOT_COUNT: usize = 2;

/// Align a value up to the nearest multiple of ALIGNMENT
#[inline]
#[must_use]
pub const fn align_up(value: u64) -> u64 {
    value.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Operator-facing volume configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Total size of the volume file or device in bytes
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Byte offset of the first metadata slot
    #[serde(default = "default_metadata_offset")]
    pub metadata_offset: u64,
    /// Worst-case number of range entries; sizes the metadata slots
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    /// Use direct I/O (O_DIRECT on Linux)
    #[serde(default)]
    pub direct_io: bool,
}

fn default_capacity() -> u64 {
    256 * 1024 * 1024
}

fn default_metadata_offset() -> u64 {
    ALIGNMENT
}

fn default_max_entries() -> u32 {
    16 * 1024
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            metadata_offset: default_metadata_offset(),
            max_entries: default_max_entries(),
            direct_io: false,
        }
    }
}

impl VolumeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::configuration(format!("invalid volume config: {e}")))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}

/// Validated on-disk geometry of a volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeGeometry {
    capacity: u64,
    metadata_offset: u64,
    slot_size: u64,
    data_start: u64,
}

impl VolumeGeometry {
    /// Derive the geometry for a volume whose metadata never exceeds
    /// `max_metadata_size` bytes
    pub fn new(capacity: u64, metadata_offset: u64, max_metadata_size: u64) -> Result<Self> {
        if metadata_offset % ALIGNMENT != 0 {
            return Err(Error::configuration(format!(
                "metadata offset {metadata_offset} is not aligned to {ALIGNMENT}"
            )));
        }
        if max_metadata_size == 0 {
            return Err(Error::configuration("metadata size must be non-zero"));
        }

        let slot_size = align_up(max_metadata_size);
        let data_start = align_up(metadata_offset + slot_size * SLOT_COUNT as u64);
        if data_start >= capacity {
            return Err(Error::configuration(format!(
                "capacity {capacity} leaves no data region (data starts at {data_start})"
            )));
        }

        Ok(Self {
            capacity,
            metadata_offset,
            slot_size,
            data_start,
        })
    }

    /// Total size of the volume in bytes
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Size of one metadata slot (aligned)
    #[must_use]
    pub const fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Byte offset of a metadata slot
    ///
    /// # Panics
    /// Panics if `slot` is not a valid slot index.
    #[must_use]
    pub fn slot_offset(&self, slot: usize) -> u64 {
        assert!(slot < SLOT_COUNT, "slot index {slot} out of range");
        self.metadata_offset + self.slot_size * slot as u64
    }

    /// Reserved start offset for append data
    #[must_use]
    pub const fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Bytes available to the circular data region
    #[must_use]
    pub const fn data_capacity(&self) -> u64 {
        self.capacity - self.data_start
    }
}
