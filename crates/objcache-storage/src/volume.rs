//! Cache volume: metadata, allocator and published index snapshots
//!
//! A [`Volume`] is owned by a single worker which serializes every
//! mutation. Readers on other threads see the index through
//! [`IndexSnapshot`]s published into a shared [`SnapshotCell`]; a reader
//! keeps using the snapshot it grabbed even while newer ones are
//! published.

use crate::allocator::{Allocation, CircularAllocator};
use crate::cursor::WriteCursor;
use crate::metadata::VolumeMetadata;
use crate::slots::{SlotReader, SlotWriter};
use crate::sync::SnapshotCell;
use crate::table::{AddOutcome, RangeEntry, RangeSpan};
use objcache_common::{CacheKey, Error, Result, VolumeGeometry, VolumeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable view of the live index at one point in time
#[derive(Clone, Debug, Default)]
pub struct IndexSnapshot {
    volume: VolumeId,
    sync_serial: u32,
    cursor: WriteCursor,
    entries: BTreeMap<CacheKey, Vec<RangeEntry>>,
    len: usize,
}

impl IndexSnapshot {
    fn capture(meta: &VolumeMetadata) -> Self {
        let mut entries: BTreeMap<CacheKey, Vec<RangeEntry>> = BTreeMap::new();
        let mut len = 0;
        for entry in meta.live_entries() {
            entries.entry(entry.key).or_default().push(*entry);
            len += 1;
        }
        Self {
            volume: meta.volume_id(),
            sync_serial: meta.sync_serial(),
            cursor: *meta.cursor(),
            entries,
            len,
        }
    }

    /// Live entries of `key`, ordered by object offset
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> &[RangeEntry] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Entry of `key` covering `object_offset`
    #[must_use]
    pub fn find(&self, key: &CacheKey, object_offset: u64) -> Option<&RangeEntry> {
        self.lookup(key)
            .iter()
            .find(|e| e.span.contains(object_offset))
    }

    #[must_use]
    pub fn volume_id(&self) -> VolumeId {
        self.volume
    }

    #[must_use]
    pub fn sync_serial(&self) -> u32 {
        self.sync_serial
    }

    #[must_use]
    pub fn cursor(&self) -> &WriteCursor {
        &self.cursor
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of keys with live entries
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}

/// A cache volume backed by two metadata slots
pub struct Volume<S> {
    slots: S,
    metadata: VolumeMetadata,
    allocator: CircularAllocator,
    snapshots: Arc<SnapshotCell<IndexSnapshot>>,
}

impl<S: SlotReader + SlotWriter> Volume<S> {
    /// Open a volume, recovering its metadata or formatting it if no
    /// slot holds usable metadata
    ///
    /// A recovered index with more live entries than `max_entries` is
    /// refused with a configuration error and left on disk untouched.
    pub fn open(mut slots: S, geometry: VolumeGeometry, max_entries: u32) -> Result<Self> {
        let required = VolumeMetadata::worst_case_size(max_entries);
        if slots.slot_size() < required {
            return Err(Error::configuration(format!(
                "metadata slot of {} bytes cannot hold {max_entries} entries ({required} bytes)",
                slots.slot_size()
            )));
        }

        let mut metadata = VolumeMetadata::new(max_entries);
        let mut format = !metadata.load(&slots)?;

        if !format {
            let pos = metadata.cursor().write_pos;
            if pos < geometry.data_start() || pos > geometry.capacity() {
                warn!(
                    write_pos = pos,
                    data_start = geometry.data_start(),
                    capacity = geometry.capacity(),
                    "write cursor outside data region, reformatting"
                );
                format = true;
            } else if metadata.table().len() > max_entries as usize {
                metadata.sweep_all();
                if metadata.table().len() > max_entries as usize {
                    return Err(Error::configuration(format!(
                        "volume holds {} live entries, more than max_entries {max_entries}",
                        metadata.table().len()
                    )));
                }
            }
        }

        if format {
            metadata.clean_init(geometry.data_start());
            metadata.flush(&mut slots)?;
        }

        info!(
            volume = %metadata.volume_id(),
            serial = metadata.sync_serial(),
            entries = metadata.table().len(),
            formatted = format,
            "volume opened"
        );

        let volume = Self {
            slots,
            metadata,
            allocator: CircularAllocator::new(geometry),
            snapshots: Arc::new(SnapshotCell::empty()),
        };
        volume.publish();
        Ok(volume)
    }

    /// Allocate space for `length` bytes of `key` at `object_offset` and
    /// index it, replacing any overlapping spans
    pub fn write(&mut self, key: CacheKey, object_offset: u64, length: u64) -> Result<Allocation> {
        let (allocation, _) = self.write_with(key, object_offset, length, |_, _| true)?;
        Ok(allocation)
    }

    /// Like [`write`](Self::write) with a caller-supplied overwrite policy
    ///
    /// When the policy rejects the write the allocated space is left
    /// unindexed and the caller should not write the data.
    pub fn write_with<F>(
        &mut self,
        key: CacheKey,
        object_offset: u64,
        length: u64,
        overwrite: F,
    ) -> Result<(Allocation, AddOutcome)>
    where
        F: FnMut(&RangeEntry, &RangeEntry) -> bool,
    {
        let max_entries = self.metadata.max_entries() as usize;
        if self.metadata.table().len() >= max_entries {
            self.metadata.sweep_all();
        }
        if self.metadata.table().len() >= max_entries {
            return Err(Error::storage(format!(
                "range index full ({max_entries} live entries)"
            )));
        }

        let allocation = self.allocator.allocate(&mut self.metadata, length)?;
        let span = RangeSpan::new(object_offset, allocation.offset, length);
        let outcome = self.metadata.add_table_entry(key, span, overwrite);
        Ok((allocation, outcome))
    }

    /// Live entries of `key` in the working index
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Vec<RangeEntry> {
        let mut found = Vec::new();
        self.metadata.read_table_entries(key, |e| found.push(*e));
        found
    }

    /// Count a hit on every live entry of `key`
    pub fn touch(&mut self, key: &CacheKey) -> bool {
        self.metadata
            .modify_table_entries(key, |e| e.hits = e.hits.saturating_add(1))
    }

    /// Drop every entry of `key`; returns how many were live
    pub fn evict(&mut self, key: &CacheKey) -> usize {
        let removed = self.metadata.rem_table_entries(key, |_| true).unwrap_or(0);
        debug!(%key, removed, "evicted key");
        removed
    }

    /// Drop the entry of `key` recorded for exactly `span`
    pub fn evict_span(&mut self, key: &CacheKey, span: &RangeSpan) -> bool {
        self.metadata.rem_table_entry(key, span)
    }

    /// Persist pending changes and publish a fresh snapshot
    ///
    /// Returns whether anything was written.
    pub fn sync(&mut self) -> Result<bool> {
        if !self.metadata.is_dirty() {
            return Ok(false);
        }
        self.metadata.flush(&mut self.slots)?;
        self.publish();
        Ok(true)
    }

    /// Publish the current live index to readers
    pub fn publish(&self) -> Arc<IndexSnapshot> {
        let snapshot = Arc::new(IndexSnapshot::capture(&self.metadata));
        self.snapshots.update_arc(Arc::clone(&snapshot));
        snapshot
    }

    /// Cell readers poll for the latest published snapshot
    #[must_use]
    pub fn snapshots(&self) -> Arc<SnapshotCell<IndexSnapshot>> {
        Arc::clone(&self.snapshots)
    }

    #[must_use]
    pub fn metadata(&self) -> &VolumeMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        self.allocator.geometry()
    }

    #[must_use]
    pub fn slots(&self) -> &S {
        &self.slots
    }

    /// Close the volume without syncing, returning the slot store
    pub fn into_slots(self) -> S {
        self.slots
    }
}
