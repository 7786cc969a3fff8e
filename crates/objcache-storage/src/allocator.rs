//! Circular data-region allocator
//!
//! Appends go to the write cursor. When an append would run past the end
//! of the volume the cursor wraps to the start of the data region and the
//! lap counter advances, implicitly evicting whatever the new lap
//! overwrites.

use crate::metadata::VolumeMetadata;
use objcache_common::{Error, Result, VolumeGeometry};
use tracing::debug;

/// Disk space handed out for one append
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Byte offset on the volume
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Lap the bytes are written on
    pub write_lap: u32,
    /// Whether the cursor wrapped to make room
    pub wrapped: bool,
}

impl Allocation {
    /// First byte past the allocation
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Allocates data-region space by advancing the metadata's write cursor
#[derive(Clone, Copy, Debug)]
pub struct CircularAllocator {
    geometry: VolumeGeometry,
}

impl CircularAllocator {
    #[must_use]
    pub fn new(geometry: VolumeGeometry) -> Self {
        Self { geometry }
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Reserve `length` bytes and advance the cursor past them
    pub fn allocate(&self, meta: &mut VolumeMetadata, length: u64) -> Result<Allocation> {
        if length == 0 {
            return Err(Error::invalid_argument("allocation length must be non-zero"));
        }
        let available = self.geometry.data_capacity();
        if length > available {
            return Err(Error::InsufficientSpace {
                required: length,
                available,
            });
        }

        let mut wrapped = false;
        let pos = meta.cursor().write_pos;
        if pos < self.geometry.data_start() || pos + length > self.geometry.capacity() {
            meta.wrap_write_pos(self.geometry.data_start());
            wrapped = true;
        }

        let cursor = *meta.cursor();
        meta.inc_write_pos(length);
        debug!(
            offset = cursor.write_pos,
            length,
            write_lap = cursor.write_lap,
            wrapped,
            "allocated data region"
        );

        Ok(Allocation {
            offset: cursor.write_pos,
            length,
            write_lap: cursor.write_lap,
            wrapped,
        })
    }

    /// Bytes left before the cursor has to wrap
    #[must_use]
    pub fn remaining_in_lap(&self, meta: &VolumeMetadata) -> u64 {
        self.geometry.capacity().saturating_sub(meta.cursor().write_pos)
    }
}
