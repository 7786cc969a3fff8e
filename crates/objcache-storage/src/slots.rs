//! Metadata slot collaborators
//!
//! The metadata aggregate never touches a device itself. It reads and
//! writes whole slots through [`SlotReader`] and [`SlotWriter`]; any error
//! they return is passed to the caller unchanged.

use crate::raw_io::{AlignedBuffer, RawFile};
use bytes::Bytes;
use objcache_common::config::SLOT_COUNT;
use objcache_common::{Error, Result, VolumeGeometry};
use std::path::Path;
use tracing::debug;

/// Reads one metadata slot
pub trait SlotReader {
    /// Read the full contents of `slot`
    fn read_slot(&self, slot: usize) -> Result<Bytes>;
}

/// Writes one metadata slot
pub trait SlotWriter {
    /// Size of a slot; encoded metadata must not exceed it
    fn slot_size(&self) -> u64;

    /// Replace the contents of `slot` with `data`, zero-padded
    fn write_slot(&mut self, slot: usize, data: &[u8]) -> Result<()>;
}

fn check_slot_index(slot: usize) -> Result<()> {
    if slot >= SLOT_COUNT {
        return Err(Error::invalid_argument(format!(
            "slot index {slot} out of range (max {})",
            SLOT_COUNT - 1
        )));
    }
    Ok(())
}

/// Slots stored in a volume file or device
pub struct FileSlots {
    file: RawFile,
    geometry: VolumeGeometry,
}

impl FileSlots {
    /// Create a new volume file laid out by `geometry`
    pub fn create(path: impl AsRef<Path>, geometry: VolumeGeometry, direct_io: bool) -> Result<Self> {
        let file = RawFile::create(path, geometry.capacity(), direct_io)?;
        Self::with_file(file, geometry)
    }

    /// Open an existing volume file laid out by `geometry`
    pub fn open(path: impl AsRef<Path>, geometry: VolumeGeometry, direct_io: bool) -> Result<Self> {
        let file = RawFile::open(path, direct_io)?;
        Self::with_file(file, geometry)
    }

    /// Wrap an already opened file
    pub fn with_file(file: RawFile, geometry: VolumeGeometry) -> Result<Self> {
        if file.size() < geometry.capacity() {
            return Err(Error::configuration(format!(
                "{} holds {} bytes, volume capacity is {}",
                file.path(),
                file.size(),
                geometry.capacity()
            )));
        }
        Ok(Self { file, geometry })
    }

    /// Volume geometry
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Underlying file
    pub fn file(&self) -> &RawFile {
        &self.file
    }
}

impl SlotReader for FileSlots {
    fn read_slot(&self, slot: usize) -> Result<Bytes> {
        check_slot_index(slot)?;
        let mut buf = AlignedBuffer::new(self.geometry.slot_size() as usize);
        self.file.read_at(self.geometry.slot_offset(slot), buf.as_mut_slice())?;
        Ok(Bytes::copy_from_slice(buf.as_slice()))
    }
}

impl SlotWriter for FileSlots {
    fn slot_size(&self) -> u64 {
        self.geometry.slot_size()
    }

    fn write_slot(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        check_slot_index(slot)?;
        if data.len() as u64 > self.geometry.slot_size() {
            return Err(Error::MetadataTooLarge {
                size: data.len() as u64,
                slot_size: self.geometry.slot_size(),
            });
        }

        let mut buf = AlignedBuffer::new(self.geometry.slot_size() as usize);
        buf.copy_from(data);
        let offset = self.geometry.slot_offset(slot);
        self.file.write_at(offset, buf.as_slice())?;
        self.file.sync_data()?;
        debug!(slot, offset, bytes = data.len(), "wrote metadata slot");
        Ok(())
    }
}

/// Slots held in memory
#[derive(Clone, Debug)]
pub struct MemorySlots {
    slots: [Vec<u8>; SLOT_COUNT],
    writes: usize,
}

impl MemorySlots {
    /// Two zero-filled slots of `slot_size` bytes
    #[must_use]
    pub fn new(slot_size: usize) -> Self {
        Self {
            slots: [vec![0u8; slot_size], vec![0u8; slot_size]],
            writes: 0,
        }
    }

    /// Raw contents of a slot
    #[must_use]
    pub fn slot(&self, slot: usize) -> &[u8] {
        &self.slots[slot]
    }

    /// Mutable raw contents of a slot
    pub fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.slots[slot]
    }

    /// Number of successful slot writes
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl SlotReader for MemorySlots {
    fn read_slot(&self, slot: usize) -> Result<Bytes> {
        check_slot_index(slot)?;
        Ok(Bytes::copy_from_slice(&self.slots[slot]))
    }
}

impl SlotWriter for MemorySlots {
    fn slot_size(&self) -> u64 {
        self.slots[0].len() as u64
    }

    fn write_slot(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        check_slot_index(slot)?;
        let target = &mut self.slots[slot];
        if data.len() > target.len() {
            return Err(Error::MetadataTooLarge {
                size: data.len() as u64,
                slot_size: target.len() as u64,
            });
        }
        target[..data.len()].copy_from_slice(data);
        target[data.len()..].fill(0);
        self.writes += 1;
        Ok(())
    }
}
