//! Volume metadata aggregate
//!
//! Combines the control block, the write cursor and the range index into
//! the unit that is persisted to one of the two metadata slots.
//!
//! # Recovery
//! 1. Read slot A and slot B (an I/O error aborts the load)
//! 2. A slot is structurally valid iff its header and footer are
//!    byte-identical and the header carries this build's magic/version
//! 3. Valid slots are tried freshest-first by sync serial (wraparound
//!    aware); the first whose range table decodes is loaded
//! 4. No loadable slot is not an error: `load` returns `false` and the
//!    caller re-initializes the volume
//!
//! # Save
//! The image is always written to the slot *not* loaded from (or last
//! saved to), so a crash mid-write leaves the previous copy intact.
//!
//! The aggregate is not synchronized. One worker owns it per volume and
//! serializes every call.

use crate::cursor::{WRITE_CURSOR_SIZE, WriteCursor};
use crate::layout::{CONTROL_BLOCK_SIZE, ControlBlock, compare_serials, serial_is_fresher};
use crate::slots::{SlotReader, SlotWriter};
use crate::table::{AddOutcome, RANGE_ENTRY_SIZE, RangeEntry, RangeSpan, RangeTable};
use bytes::{Bytes, BytesMut};
use objcache_common::config::SLOT_COUNT;
use objcache_common::{CacheKey, Error, Result, VolumeConfig, VolumeGeometry, VolumeId};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, info, warn};

/// Offset of the write cursor within a slot
const CURSOR_OFFSET: usize = CONTROL_BLOCK_SIZE;

/// Offset of the range table within a slot
const TABLE_OFFSET: usize = CURSOR_OFFSET + WRITE_CURSOR_SIZE;

/// Size of a slot image holding an empty table
pub const EMPTY_IMAGE_SIZE: usize = TABLE_OFFSET + RangeTable::encoded_size(0) + CONTROL_BLOCK_SIZE;

/// Why a slot failed structural validation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidReason {
    /// Too short to hold even an empty image
    Truncated,
    /// The entry count places the footer beyond the slot
    FooterOutOfRange,
    /// Header and footer differ (torn or partial write)
    HeaderFooterMismatch,
    /// Wrong magic or format version
    NotCurrent,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Truncated => "slot truncated",
            Self::FooterOutOfRange => "footer out of range",
            Self::HeaderFooterMismatch => "header and footer differ",
            Self::NotCurrent => "bad magic or version",
        };
        f.write_str(text)
    }
}

/// Result of structurally validating one slot image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Valid {
        header: ControlBlock,
        cursor: WriteCursor,
        entries: usize,
    },
    Invalid(InvalidReason),
}

impl SlotState {
    /// Sync serial of a valid slot
    #[must_use]
    pub fn sync_serial(&self) -> Option<u32> {
        match self {
            Self::Valid { header, .. } => Some(header.sync_serial),
            Self::Invalid(_) => None,
        }
    }

    /// Check whether the slot passed validation
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Structurally validate a slot image (header, footer, version)
#[must_use]
pub fn check_slot(data: &[u8]) -> SlotState {
    if data.len() < EMPTY_IMAGE_SIZE {
        return SlotState::Invalid(InvalidReason::Truncated);
    }
    let Ok(count) = RangeTable::peek_len(&data[TABLE_OFFSET..]) else {
        return SlotState::Invalid(InvalidReason::Truncated);
    };

    let footer_offset = TABLE_OFFSET + RangeTable::encoded_size(count);
    let Some(footer) = data.get(footer_offset..footer_offset + CONTROL_BLOCK_SIZE) else {
        return SlotState::Invalid(InvalidReason::FooterOutOfRange);
    };
    if data[..CONTROL_BLOCK_SIZE] != *footer {
        return SlotState::Invalid(InvalidReason::HeaderFooterMismatch);
    }

    let (Ok(header), Ok(cursor)) = (
        ControlBlock::decode(&data[..CONTROL_BLOCK_SIZE]),
        WriteCursor::decode(&data[CURSOR_OFFSET..TABLE_OFFSET]),
    ) else {
        return SlotState::Invalid(InvalidReason::Truncated);
    };
    if !header.is_current() {
        return SlotState::Invalid(InvalidReason::NotCurrent);
    }

    SlotState::Valid {
        header,
        cursor,
        entries: count,
    }
}

/// Valid slots ordered freshest first; equal serials favour slot A
#[must_use]
pub fn slots_by_freshness(states: &[SlotState]) -> Vec<usize> {
    let mut valid: Vec<(usize, u32)> = states
        .iter()
        .enumerate()
        .filter_map(|(slot, state)| state.sync_serial().map(|serial| (slot, serial)))
        .collect();
    valid.sort_by(|(slot_a, serial_a), (slot_b, serial_b)| {
        match compare_serials(*serial_b, *serial_a) {
            Ordering::Equal => slot_a.cmp(slot_b),
            other => other,
        }
    });
    valid.into_iter().map(|(slot, _)| slot).collect()
}

/// Pick the slot to recover from, or `None` if no slot is valid
#[must_use]
pub fn select_slot(states: &[SlotState]) -> Option<usize> {
    slots_by_freshness(states).first().copied()
}

/// Header, write cursor and range index of one volume
#[derive(Debug)]
pub struct VolumeMetadata {
    header: ControlBlock,
    cursor: WriteCursor,
    table: RangeTable,
    max_entries: u32,
    dirty: bool,
    current_slot: Option<usize>,
    /// Serial of the image in `current_slot`
    saved_serial: Option<u32>,
}

impl VolumeMetadata {
    /// Uninitialized metadata for a volume holding at most `max_entries`
    /// range entries; follow with [`load`](Self::load) or
    /// [`clean_init`](Self::clean_init)
    #[must_use]
    pub fn new(max_entries: u32) -> Self {
        Self {
            header: ControlBlock::zeroed(),
            cursor: WriteCursor::default(),
            table: RangeTable::new(),
            max_entries,
            dirty: false,
            current_slot: None,
            saved_serial: None,
        }
    }

    /// Encoded size of metadata holding `max_entries` entries
    #[must_use]
    pub const fn worst_case_size(max_entries: u32) -> u64 {
        (EMPTY_IMAGE_SIZE + max_entries as usize * RANGE_ENTRY_SIZE) as u64
    }

    /// Geometry of a volume with slots sized for `config.max_entries`
    pub fn geometry(config: &VolumeConfig) -> Result<VolumeGeometry> {
        VolumeGeometry::new(
            config.capacity,
            config.metadata_offset,
            Self::worst_case_size(config.max_entries),
        )
    }

    /// Reset to a brand-new volume: fresh uuid, serial 0, empty table,
    /// cursor at `initial_write_offset` on lap 0
    pub fn clean_init(&mut self, initial_write_offset: u64) {
        self.header = ControlBlock::new();
        self.cursor = WriteCursor::new(initial_write_offset);
        self.table.clear();
        self.dirty = false;
        self.current_slot = None;
        self.saved_serial = None;
        info!(
            volume = %self.header.uuid,
            write_pos = initial_write_offset,
            "initialized clean volume metadata"
        );
    }

    /// Recover from the freshest valid slot
    ///
    /// Returns `Ok(false)` when no slot holds usable metadata; the state
    /// is then left untouched. Reader errors are returned as they are.
    pub fn load<R: SlotReader + ?Sized>(&mut self, reader: &R) -> Result<bool> {
        let images: [Bytes; SLOT_COUNT] = [reader.read_slot(0)?, reader.read_slot(1)?];
        let states: Vec<SlotState> = images.iter().map(|image| check_slot(image)).collect();

        for (slot, state) in states.iter().enumerate() {
            if let SlotState::Invalid(reason) = state {
                warn!(slot, %reason, "metadata slot failed validation");
            }
        }

        for slot in slots_by_freshness(&states) {
            let SlotState::Valid { header, cursor, .. } = states[slot] else {
                continue;
            };
            match RangeTable::decode(&images[slot][TABLE_OFFSET..]) {
                Ok(table) => {
                    self.header = header;
                    self.cursor = cursor;
                    self.table = table;
                    self.dirty = false;
                    self.current_slot = Some(slot);
                    self.saved_serial = Some(header.sync_serial);
                    info!(
                        slot,
                        volume = %header.uuid,
                        serial = header.sync_serial,
                        entries = self.table.len(),
                        write_pos = cursor.write_pos,
                        write_lap = cursor.write_lap,
                        "loaded volume metadata"
                    );
                    return Ok(true);
                }
                Err(e) => warn!(slot, error = %e, "metadata slot table unreadable"),
            }
        }

        warn!("no loadable metadata slot");
        Ok(false)
    }

    /// Write the metadata to the slot not currently in use
    ///
    /// Lapped entries are dropped first. The new copy always carries a
    /// serial fresher than the copy it supersedes; if the serial has not
    /// been advanced since the last load or save it is bumped here.
    /// `dirty` is cleared only after the writer succeeds.
    pub fn save<W: SlotWriter + ?Sized>(&mut self, writer: &mut W) -> Result<()> {
        self.sweep_all();
        let size = self.size_on_disk();
        if size > writer.slot_size() {
            return Err(Error::MetadataTooLarge {
                size,
                slot_size: writer.slot_size(),
            });
        }

        let requested_serial = self.header.sync_serial;
        if let Some(saved) = self.saved_serial
            && !serial_is_fresher(requested_serial, saved)
        {
            self.header.sync_serial = saved.wrapping_add(1);
        }

        let target = self.next_slot();
        let image = self.encode();
        if let Err(e) = writer.write_slot(target, &image) {
            self.header.sync_serial = requested_serial;
            return Err(e);
        }

        self.current_slot = Some(target);
        self.saved_serial = Some(self.header.sync_serial);
        self.dirty = false;
        debug!(
            slot = target,
            serial = self.header.sync_serial,
            entries = self.table.len(),
            bytes = image.len(),
            "saved volume metadata"
        );
        Ok(())
    }

    /// Bump the sync serial and save; the bump is undone if saving fails
    pub fn flush<W: SlotWriter + ?Sized>(&mut self, writer: &mut W) -> Result<()> {
        self.inc_sync_serial();
        if let Err(e) = self.save(writer) {
            self.dec_sync_serial();
            return Err(e);
        }
        Ok(())
    }

    /// Encode the full slot image
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_disk() as usize);
        self.header.encode(&mut buf);
        self.cursor.encode(&mut buf);
        self.table.encode(&mut buf);
        self.header.encode(&mut buf);
        buf.freeze()
    }

    /// Slot the next save will write
    #[must_use]
    pub fn next_slot(&self) -> usize {
        match self.current_slot {
            Some(slot) => (slot + 1) % SLOT_COUNT,
            None => 0,
        }
    }

    /// Exact size of the current image
    #[must_use]
    pub fn size_on_disk(&self) -> u64 {
        (EMPTY_IMAGE_SIZE + self.table.len() * RANGE_ENTRY_SIZE) as u64
    }

    /// Size of the image at `max_entries` entries
    #[must_use]
    pub fn max_size_on_disk(&self) -> u64 {
        Self::worst_case_size(self.max_entries)
    }

    /// Record a span of `key` written at the current cursor lap
    ///
    /// `overwrite(old, new)` is asked about every live entry of the key
    /// that overlaps `span`. The metadata is marked dirty even when the
    /// policy rejects the insert.
    pub fn add_table_entry<F>(&mut self, key: CacheKey, span: RangeSpan, overwrite: F) -> AddOutcome
    where
        F: FnMut(&RangeEntry, &RangeEntry) -> bool,
    {
        self.dirty = true;
        self.sweep(&key);
        let outcome = self
            .table
            .insert(RangeEntry::new(key, span, self.cursor.write_lap), overwrite);
        debug!(%key, ?span, ?outcome, "add table entry");
        outcome
    }

    /// Remove the live entries of `key` selected by `remover`
    ///
    /// Returns `None` if the key has no live entries, otherwise the number
    /// removed (possibly zero). Always marks the metadata dirty.
    pub fn rem_table_entries<F>(&mut self, key: &CacheKey, mut remover: F) -> Option<usize>
    where
        F: FnMut(&RangeEntry) -> bool,
    {
        self.dirty = true;
        self.sweep(key);
        let removed = self.table.retain_key(key, |e| !remover(e));
        debug!(%key, ?removed, "remove table entries");
        removed
    }

    /// Remove the live entry of `key` recorded for exactly `span`
    pub fn rem_table_entry(&mut self, key: &CacheKey, span: &RangeSpan) -> bool {
        self.sweep(key);
        let removed = self.table.remove_exact(key, span);
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Visit the live entries of `key`; `false` if there are none
    pub fn read_table_entries<F>(&self, key: &CacheKey, mut visitor: F) -> bool
    where
        F: FnMut(&RangeEntry),
    {
        let Some(list) = self.table.get(key) else {
            return false;
        };
        let mut found = false;
        for entry in list.iter().filter(|e| self.is_live(e)) {
            visitor(entry);
            found = true;
        }
        found
    }

    /// Update soft state (e.g. hit counts) of the live entries of `key`
    ///
    /// Does not mark the metadata dirty. Key, span and lap are restored
    /// after the visitor runs; only soft fields can change.
    pub fn modify_table_entries<F>(&mut self, key: &CacheKey, mut visitor: F) -> bool
    where
        F: FnMut(&mut RangeEntry),
    {
        self.sweep(key);
        let Some(list) = self.table.get_mut(key) else {
            return false;
        };
        for entry in list {
            let (key, span, write_lap) = (entry.key, entry.span, entry.write_lap);
            visitor(entry);
            entry.key = key;
            entry.span = span;
            entry.write_lap = write_lap;
        }
        true
    }

    /// Drop every entry the cursor has lapped; returns the number removed
    ///
    /// Does not mark the metadata dirty: lapped entries are already absent.
    pub fn sweep_all(&mut self) -> usize {
        let cursor = self.cursor;
        let swept = self
            .table
            .retain(|e| cursor.is_live(e.write_lap, e.span.disk_offset));
        if swept > 0 {
            debug!(swept, "swept overwritten entries from index");
        }
        swept
    }

    /// Drop the entries of `key` that the cursor has lapped
    fn sweep(&mut self, key: &CacheKey) {
        let cursor = self.cursor;
        let swept = self
            .table
            .retain_key(key, |e| cursor.is_live(e.write_lap, e.span.disk_offset))
            .unwrap_or(0);
        if swept > 0 {
            debug!(%key, swept, "swept overwritten entries");
        }
    }

    /// Check whether an entry's bytes are still on disk
    #[must_use]
    pub fn is_live(&self, entry: &RangeEntry) -> bool {
        self.cursor.is_live(entry.write_lap, entry.span.disk_offset)
    }

    /// Iterate all live entries
    pub fn live_entries(&self) -> impl Iterator<Item = &RangeEntry> {
        self.table.iter().filter(|e| self.is_live(e))
    }

    /// Advance the sync serial (wrapping)
    pub fn inc_sync_serial(&mut self) {
        self.header.sync_serial = self.header.sync_serial.wrapping_add(1);
    }

    /// Undo a provisional [`inc_sync_serial`](Self::inc_sync_serial)
    pub fn dec_sync_serial(&mut self) {
        self.header.sync_serial = self.header.sync_serial.wrapping_sub(1);
    }

    /// Move the cursor past `n` appended bytes
    ///
    /// The caller guarantees the append did not cross the volume end.
    pub fn inc_write_pos(&mut self, n: u64) {
        self.cursor.advance(n);
        self.dirty = true;
    }

    /// Restart the cursor at `new_offset` on the next lap
    pub fn wrap_write_pos(&mut self, new_offset: u64) {
        self.cursor.wrap(new_offset);
        self.dirty = true;
        debug!(
            write_pos = new_offset,
            write_lap = self.cursor.write_lap,
            "write cursor wrapped"
        );
    }

    /// Control block
    #[must_use]
    pub fn header(&self) -> &ControlBlock {
        &self.header
    }

    /// Volume identity
    #[must_use]
    pub fn volume_id(&self) -> VolumeId {
        self.header.uuid
    }

    /// Current sync serial
    #[must_use]
    pub fn sync_serial(&self) -> u32 {
        self.header.sync_serial
    }

    /// Write cursor
    #[must_use]
    pub fn cursor(&self) -> &WriteCursor {
        &self.cursor
    }

    /// Range index, including entries not yet swept
    #[must_use]
    pub fn table(&self) -> &RangeTable {
        &self.table
    }

    /// Maximum number of entries the slots are sized for
    #[must_use]
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Check for changes not yet saved
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Slot last loaded from or saved to
    #[must_use]
    pub fn current_slot(&self) -> Option<usize> {
        self.current_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::MemorySlots;

    const SLOT_SIZE: usize = 8192;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_bytes([n; 16])
    }

    fn fresh() -> (VolumeMetadata, MemorySlots) {
        let mut meta = VolumeMetadata::new(64);
        meta.clean_init(1024);
        (meta, MemorySlots::new(SLOT_SIZE))
    }

    struct FailingSlots;

    impl SlotReader for FailingSlots {
        fn read_slot(&self, _slot: usize) -> Result<Bytes> {
            Err(std::io::Error::other("device gone").into())
        }
    }

    impl SlotWriter for FailingSlots {
        fn slot_size(&self) -> u64 {
            SLOT_SIZE as u64
        }

        fn write_slot(&mut self, _slot: usize, _data: &[u8]) -> Result<()> {
            Err(std::io::Error::other("device gone").into())
        }
    }

    #[test]
    fn test_clean_init() {
        let (meta, _) = fresh();
        assert!(meta.header().is_current());
        assert_eq!(meta.sync_serial(), 0);
        assert_eq!(*meta.cursor(), WriteCursor::new(1024));
        assert!(meta.table().is_empty());
        assert!(!meta.is_dirty());
        assert_eq!(meta.current_slot(), None);
        assert_eq!(meta.next_slot(), 0);
    }

    #[test]
    fn test_sizes() {
        let (mut meta, _) = fresh();
        assert_eq!(meta.size_on_disk(), EMPTY_IMAGE_SIZE as u64);
        assert_eq!(EMPTY_IMAGE_SIZE, 160);
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 10), |_, _| true);
        assert_eq!(meta.size_on_disk(), 160 + 48);
        assert_eq!(meta.encode().len() as u64, meta.size_on_disk());
        assert_eq!(meta.max_size_on_disk(), 160 + 64 * 48);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (mut meta, mut slots) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 512), |_, _| true);
        meta.add_table_entry(key(1), RangeSpan::new(512, 1536, 512), |_, _| true);
        meta.add_table_entry(key(2), RangeSpan::new(0, 2048, 100), |_, _| true);
        meta.inc_write_pos(1124);
        meta.inc_sync_serial();
        meta.save(&mut slots).unwrap();
        assert!(!meta.is_dirty());

        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert_eq!(loaded.header(), meta.header());
        assert_eq!(loaded.cursor(), meta.cursor());
        assert_eq!(loaded.table(), meta.table());
        assert_eq!(loaded.current_slot(), Some(0));
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_save_alternates_slots() {
        let (mut meta, mut slots) = fresh();
        meta.flush(&mut slots).unwrap();
        assert_eq!(meta.current_slot(), Some(0));
        meta.flush(&mut slots).unwrap();
        assert_eq!(meta.current_slot(), Some(1));
        meta.flush(&mut slots).unwrap();
        assert_eq!(meta.current_slot(), Some(0));

        // After loading from a slot, the next save targets the other one
        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert_eq!(loaded.current_slot(), Some(0));
        assert_eq!(loaded.sync_serial(), 3);
        assert_eq!(loaded.next_slot(), 1);
    }

    #[test]
    fn test_repeated_save_supersedes_previous_copy() {
        let (mut meta, mut slots) = fresh();
        meta.save(&mut slots).unwrap();
        assert_eq!(meta.current_slot(), Some(0));

        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 16), |_, _| true);
        meta.inc_write_pos(16);
        meta.save(&mut slots).unwrap();
        assert_eq!(meta.current_slot(), Some(1));
        assert_eq!(meta.sync_serial(), 1);

        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert_eq!(loaded.current_slot(), Some(1));
        assert_eq!(loaded.table(), meta.table());
        assert_eq!(loaded.cursor(), meta.cursor());

        // Same again starting from the loaded state
        loaded.add_table_entry(key(2), RangeSpan::new(0, 1040, 16), |_, _| true);
        loaded.inc_write_pos(16);
        loaded.save(&mut slots).unwrap();
        let mut reloaded = VolumeMetadata::new(64);
        assert!(reloaded.load(&slots).unwrap());
        assert_eq!(reloaded.current_slot(), Some(0));
        assert_eq!(reloaded.sync_serial(), 2);
        assert_eq!(reloaded.table().len(), 2);
    }

    #[test]
    fn test_save_restores_serial_on_write_error() {
        let (mut meta, mut slots) = fresh();
        meta.save(&mut slots).unwrap();
        assert!(meta.save(&mut FailingSlots).unwrap_err().is_io());
        assert_eq!(meta.sync_serial(), 0);
        meta.save(&mut slots).unwrap();
        assert_eq!(meta.sync_serial(), 1);
    }

    #[test]
    fn test_sweep_all_drops_lapped_entries() {
        let (mut meta, mut slots) = fresh();
        for n in 0..4u8 {
            let offset = 1024 + u64::from(n) * 100;
            meta.add_table_entry(key(n), RangeSpan::new(0, offset, 100), |_, _| true);
            meta.inc_write_pos(100);
        }
        meta.save(&mut slots).unwrap();

        // New lap overwrites the first two spans
        meta.wrap_write_pos(1024);
        meta.inc_write_pos(150);
        assert_eq!(meta.table().len(), 4);
        assert_eq!(meta.live_entries().count(), 2);

        assert!(meta.is_dirty());
        assert_eq!(meta.sweep_all(), 2);
        assert_eq!(meta.table().len(), 2);
        assert!(meta.table().get(&key(0)).is_none());
        assert_eq!(meta.sweep_all(), 0);
    }

    #[test]
    fn test_save_does_not_persist_lapped_entries() {
        let (mut meta, mut slots) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 100), |_, _| true);
        meta.inc_write_pos(100);
        meta.wrap_write_pos(1024);
        meta.inc_write_pos(100);
        meta.flush(&mut slots).unwrap();
        assert_eq!(meta.size_on_disk(), EMPTY_IMAGE_SIZE as u64);

        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert!(loaded.table().is_empty());
    }

    #[test]
    fn test_load_picks_wrapped_serial() {
        let (mut meta, mut slots) = fresh();
        meta.dec_sync_serial();
        assert_eq!(meta.sync_serial(), u32::MAX);
        meta.save(&mut slots).unwrap();

        meta.inc_sync_serial();
        assert_eq!(meta.sync_serial(), 0);
        meta.add_table_entry(key(7), RangeSpan::new(0, 1024, 1), |_, _| true);
        meta.inc_write_pos(1);
        meta.save(&mut slots).unwrap();

        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert_eq!(loaded.current_slot(), Some(1));
        assert_eq!(loaded.sync_serial(), 0);
        assert_eq!(loaded.table().len(), 1);
    }

    #[test]
    fn test_torn_write_falls_back_to_older_slot() {
        let (mut meta, mut slots) = fresh();
        meta.flush(&mut slots).unwrap(); // slot 0, serial 1
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 1), |_, _| true);
        meta.inc_write_pos(1);
        meta.flush(&mut slots).unwrap(); // slot 1, serial 2

        // Footer of slot 1 never made it to disk
        let footer = EMPTY_IMAGE_SIZE + RANGE_ENTRY_SIZE - CONTROL_BLOCK_SIZE;
        slots.slot_mut(1)[footer..footer + CONTROL_BLOCK_SIZE].fill(0);
        assert_eq!(
            check_slot(slots.slot(1)),
            SlotState::Invalid(InvalidReason::HeaderFooterMismatch)
        );

        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert_eq!(loaded.current_slot(), Some(0));
        assert_eq!(loaded.sync_serial(), 1);
        assert!(loaded.table().is_empty());
    }

    #[test]
    fn test_bad_magic_never_selected() {
        let (mut meta, mut slots) = fresh();
        meta.flush(&mut slots).unwrap(); // slot 0, serial 1
        meta.flush(&mut slots).unwrap(); // slot 1, serial 2

        // Same flip in header and footer: they still match, magic is wrong
        let footer = EMPTY_IMAGE_SIZE - CONTROL_BLOCK_SIZE;
        slots.slot_mut(1)[0] ^= 0x01;
        slots.slot_mut(1)[footer] ^= 0x01;
        assert_eq!(check_slot(slots.slot(1)), SlotState::Invalid(InvalidReason::NotCurrent));

        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert_eq!(loaded.current_slot(), Some(0));
    }

    #[test]
    fn test_table_damage_falls_back() {
        let (mut meta, mut slots) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 1), |_, _| true);
        meta.inc_write_pos(1);
        meta.flush(&mut slots).unwrap();
        meta.add_table_entry(key(2), RangeSpan::new(0, 1025, 1), |_, _| true);
        meta.inc_write_pos(1);
        meta.flush(&mut slots).unwrap();

        slots.slot_mut(1)[TABLE_OFFSET + 16 + 20] ^= 0xFF;
        assert!(check_slot(slots.slot(1)).is_valid());

        let mut loaded = VolumeMetadata::new(64);
        assert!(loaded.load(&slots).unwrap());
        assert_eq!(loaded.current_slot(), Some(0));
        assert_eq!(loaded.table().len(), 1);
    }

    #[test]
    fn test_load_without_valid_slot() {
        let slots = MemorySlots::new(SLOT_SIZE);
        let mut meta = VolumeMetadata::new(64);
        assert!(!meta.load(&slots).unwrap());
        assert!(!meta.header().is_current());
        assert_eq!(meta.current_slot(), None);

        let short = MemorySlots::new(100);
        assert!(!meta.load(&short).unwrap());
    }

    #[test]
    fn test_check_slot_footer_out_of_range() {
        let (meta, _) = fresh();
        let mut image = meta.encode().to_vec();
        image[TABLE_OFFSET..TABLE_OFFSET + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(check_slot(&image), SlotState::Invalid(InvalidReason::FooterOutOfRange));
    }

    #[test]
    fn test_select_slot() {
        let valid = |serial| SlotState::Valid {
            header: ControlBlock {
                sync_serial: serial,
                ..ControlBlock::new()
            },
            cursor: WriteCursor::default(),
            entries: 0,
        };
        let bad = SlotState::Invalid(InvalidReason::NotCurrent);

        assert_eq!(select_slot(&[valid(4), valid(5)]), Some(1));
        assert_eq!(select_slot(&[valid(0), valid(u32::MAX)]), Some(0));
        assert_eq!(select_slot(&[valid(u32::MAX), valid(0)]), Some(1));
        assert_eq!(select_slot(&[bad, valid(1)]), Some(1));
        assert_eq!(select_slot(&[valid(9), bad]), Some(0));
        assert_eq!(select_slot(&[valid(3), valid(3)]), Some(0));
        assert_eq!(select_slot(&[bad, bad]), None);
    }

    #[test]
    fn test_io_errors_propagate() {
        let mut meta = VolumeMetadata::new(64);
        assert!(meta.load(&FailingSlots).unwrap_err().is_io());

        let (mut meta, _) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 1), |_, _| true);
        let err = meta.flush(&mut FailingSlots).unwrap_err();
        assert!(err.is_io());
        assert!(meta.is_dirty());
        assert_eq!(meta.sync_serial(), 0);
        assert_eq!(meta.current_slot(), None);
    }

    #[test]
    fn test_save_rejects_oversized_image() {
        let mut meta = VolumeMetadata::new(1000);
        meta.clean_init(0);
        meta.inc_write_pos(1000);
        for n in 0..10u64 {
            meta.add_table_entry(key(1), RangeSpan::new(n * 10, n * 10, 10), |_, _| true);
        }
        let mut slots = MemorySlots::new(256);
        assert!(matches!(
            meta.save(&mut slots),
            Err(Error::MetadataTooLarge { .. })
        ));
        assert!(meta.is_dirty());
        assert_eq!(slots.writes(), 0);
    }

    #[test]
    fn test_dirty_tracking() {
        let (mut meta, mut slots) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 10), |_, _| true);
        meta.inc_write_pos(10);
        meta.save(&mut slots).unwrap();

        assert!(meta.read_table_entries(&key(1), |_| {}));
        assert!(!meta.is_dirty());
        assert!(meta.modify_table_entries(&key(1), |e| e.hits += 1));
        assert!(!meta.is_dirty());

        // Rejected add still dirties
        let outcome = meta.add_table_entry(key(1), RangeSpan::new(5, 4096, 10), |_, _| false);
        assert_eq!(outcome, AddOutcome::Rejected);
        assert!(meta.is_dirty());

        meta.save(&mut slots).unwrap();
        // Removing from an unknown key still dirties
        assert_eq!(meta.rem_table_entries(&key(9), |_| true), None);
        assert!(meta.is_dirty());

        meta.save(&mut slots).unwrap();
        assert_eq!(meta.rem_table_entries(&key(1), |_| false), Some(0));
        assert!(meta.is_dirty());

        meta.save(&mut slots).unwrap();
        assert!(!meta.rem_table_entry(&key(1), &RangeSpan::new(0, 0, 1)));
        assert!(!meta.is_dirty());
        assert!(meta.rem_table_entry(&key(1), &RangeSpan::new(0, 1024, 10)));
        assert!(meta.is_dirty());
    }

    #[test]
    fn test_read_and_modify_missing_key() {
        let (mut meta, _) = fresh();
        assert!(!meta.read_table_entries(&key(3), |_| panic!("no entries")));
        assert!(!meta.modify_table_entries(&key(3), |_| panic!("no entries")));
    }

    #[test]
    fn test_modify_keeps_structure() {
        let (mut meta, _) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 10), |_, _| true);
        meta.inc_write_pos(10);

        assert!(meta.modify_table_entries(&key(1), |e| {
            e.hits = 42;
            e.span.disk_offset = 999_999;
            e.write_lap = 77;
        }));

        let mut seen = Vec::new();
        assert!(meta.read_table_entries(&key(1), |e| seen.push(*e)));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].hits, 42);
        assert_eq!(seen[0].span, RangeSpan::new(0, 1024, 10));
        assert_eq!(seen[0].write_lap, 0);
    }

    #[test]
    fn test_remover_policy_selects_entries() {
        let (mut meta, _) = fresh();
        for n in 0..4u64 {
            meta.add_table_entry(key(1), RangeSpan::new(n * 100, 1024 + n * 100, 100), |_, _| true);
        }
        meta.inc_write_pos(400);

        let removed = meta.rem_table_entries(&key(1), |e| e.span.object_offset >= 200);
        assert_eq!(removed, Some(2));
        let mut count = 0;
        meta.read_table_entries(&key(1), |_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_lapped_entries_are_swept() {
        let (mut meta, _) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 100), |_, _| true);
        meta.inc_write_pos(100);
        meta.add_table_entry(key(2), RangeSpan::new(0, 1124, 100), |_, _| true);
        meta.inc_write_pos(100);

        // Wrap and overwrite part of the first span
        meta.wrap_write_pos(1024);
        meta.inc_write_pos(50);

        assert!(!meta.read_table_entries(&key(1), |_| {}));
        assert!(meta.read_table_entries(&key(2), |_| {}));
        assert_eq!(meta.live_entries().count(), 1);
        // Still present until touched
        assert_eq!(meta.table().len(), 2);

        assert!(!meta.modify_table_entries(&key(1), |_| {}));
        assert_eq!(meta.table().len(), 1);
        assert_eq!(meta.rem_table_entries(&key(1), |_| true), None);
    }

    #[test]
    fn test_add_ignores_lapped_conflicts() {
        let (mut meta, _) = fresh();
        meta.add_table_entry(key(1), RangeSpan::new(0, 1024, 100), |_, _| true);
        meta.inc_write_pos(100);
        meta.wrap_write_pos(1024);
        meta.inc_write_pos(200);

        // The old span is gone, so this is a plain insert
        let outcome = meta.add_table_entry(key(1), RangeSpan::new(0, 1224, 100), |_, _| false);
        assert_eq!(outcome, AddOutcome::Inserted);
        assert_eq!(meta.table().get(&key(1)).unwrap()[0].write_lap, 1);
    }

    #[test]
    fn test_geometry_from_config() {
        let config = VolumeConfig {
            capacity: 1024 * 1024,
            max_entries: 100,
            ..VolumeConfig::default()
        };
        let geometry = VolumeMetadata::geometry(&config).unwrap();
        assert!(geometry.slot_size() >= VolumeMetadata::worst_case_size(100));
        assert_eq!(geometry.slot_size() % 4096, 0);
    }
}
