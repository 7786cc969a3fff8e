//! Range index
//!
//! Maps an object key to the spans of that object currently on disk.
//! Objects may be cached partially, so one key can own several spans,
//! kept ordered by their offset within the object. Spans of one key that
//! overlap in object space conflict; the caller's overwrite policy decides
//! whether a new span displaces the old ones.
//!
//! The table itself knows nothing about the write cursor. Dropping spans
//! that the cursor has lapped is done by the owner through
//! [`RangeTable::retain_key`].

use bytes::{Buf, BufMut, BytesMut};
use objcache_common::{CacheKey, Error, Result, compute_crc32c, verify_crc32c};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Size of the encoded table header
pub const TABLE_HEADER_SIZE: usize = 16;

/// Size of one encoded range entry
pub const RANGE_ENTRY_SIZE: usize = 48;

/// One contiguous span of an object's bytes on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RangeSpan {
    /// Offset of the span within the object
    pub object_offset: u64,
    /// Offset of the span on the volume
    pub disk_offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl RangeSpan {
    /// Create a new span
    #[must_use]
    pub const fn new(object_offset: u64, disk_offset: u64, length: u64) -> Self {
        Self {
            object_offset,
            disk_offset,
            length,
        }
    }

    /// End of the span within the object (exclusive)
    #[must_use]
    pub const fn object_end(&self) -> u64 {
        self.object_offset + self.length
    }

    /// End of the span on disk (exclusive)
    #[must_use]
    pub const fn disk_end(&self) -> u64 {
        self.disk_offset + self.length
    }

    /// Check whether two spans cover common object bytes
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.object_offset < other.object_end() && other.object_offset < self.object_end()
    }

    /// Check whether the span covers an object offset
    #[must_use]
    pub const fn contains(&self, object_offset: u64) -> bool {
        object_offset >= self.object_offset && object_offset < self.object_end()
    }
}

/// A recorded span plus the cursor lap it was written in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeEntry {
    /// Object the span belongs to
    pub key: CacheKey,
    /// Where the bytes live
    pub span: RangeSpan,
    /// Write cursor lap at the time of the write
    pub write_lap: u32,
    /// Access counter; soft state, updated without dirtying the metadata
    pub hits: u32,
}

impl RangeEntry {
    /// Create an entry with no recorded accesses
    #[must_use]
    pub const fn new(key: CacheKey, span: RangeSpan, write_lap: u32) -> Self {
        Self {
            key,
            span,
            write_lap,
            hits: 0,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.key.as_bytes());
        buf.put_u64_le(self.span.object_offset);
        buf.put_u64_le(self.span.disk_offset);
        buf.put_u64_le(self.span.length);
        buf.put_u32_le(self.write_lap);
        buf.put_u32_le(self.hits);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let mut key = [0u8; CacheKey::SIZE];
        buf.copy_to_slice(&mut key);
        let object_offset = buf.get_u64_le();
        let disk_offset = buf.get_u64_le();
        let length = buf.get_u64_le();
        let write_lap = buf.get_u32_le();
        let hits = buf.get_u32_le();
        Self {
            key: CacheKey::from_bytes(key),
            span: RangeSpan::new(object_offset, disk_offset, length),
            write_lap,
            hits,
        }
    }
}

/// Result of inserting an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// No conflicting entry existed
    Inserted,
    /// Conflicting entries were displaced by the new one
    Replaced,
    /// The overwrite policy kept the existing entries
    Rejected,
}

/// Key to ordered span list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeTable {
    entries: BTreeMap<CacheKey, Vec<RangeEntry>>,
    len: usize,
}

impl RangeTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the table holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Entries of a key, ordered by object offset
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<&[RangeEntry]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Mutable entries of a key
    ///
    /// Spans must not be changed through this; only soft state.
    pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut [RangeEntry]> {
        self.entries.get_mut(key).map(Vec::as_mut_slice)
    }

    /// Iterate all entries, ordered by key then object offset
    pub fn iter(&self) -> impl Iterator<Item = &RangeEntry> {
        self.entries.values().flatten()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    /// Insert an entry, consulting `overwrite(old, new)` for every
    /// existing entry of the same key whose span overlaps the new one
    ///
    /// The insert happens only if the policy accepts all conflicts; the
    /// conflicting entries are then removed.
    pub fn insert<F>(&mut self, entry: RangeEntry, mut overwrite: F) -> AddOutcome
    where
        F: FnMut(&RangeEntry, &RangeEntry) -> bool,
    {
        let list = self.entries.entry(entry.key).or_default();

        let mut conflicts = list.iter().filter(|old| old.span.overlaps(&entry.span)).peekable();
        let outcome = if conflicts.peek().is_none() {
            AddOutcome::Inserted
        } else if conflicts.all(|old| overwrite(old, &entry)) {
            AddOutcome::Replaced
        } else {
            AddOutcome::Rejected
        };

        if outcome != AddOutcome::Rejected {
            let before = list.len();
            list.retain(|old| !old.span.overlaps(&entry.span));
            let removed = before - list.len();
            let pos = list.partition_point(|e| e.span.object_offset <= entry.span.object_offset);
            list.insert(pos, entry);
            self.len = self.len + 1 - removed;
        }
        outcome
    }

    /// Keep only the entries of `key` for which `keep` returns true
    ///
    /// Returns the number removed, or `None` if the key had no entries.
    pub fn retain_key<F>(&mut self, key: &CacheKey, mut keep: F) -> Option<usize>
    where
        F: FnMut(&RangeEntry) -> bool,
    {
        let Entry::Occupied(mut slot) = self.entries.entry(*key) else {
            return None;
        };

        let list = slot.get_mut();
        let before = list.len();
        list.retain(|e| keep(e));
        let removed = before - list.len();
        if list.is_empty() {
            slot.remove();
        }
        self.len -= removed;
        Some(removed)
    }

    /// Keep only the entries for which `keep` returns true, across every
    /// key; returns the number removed
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&RangeEntry) -> bool,
    {
        let before = self.len;
        self.entries.retain(|_, list| {
            list.retain(|e| keep(e));
            !list.is_empty()
        });
        self.len = self.entries.values().map(Vec::len).sum();
        before - self.len
    }

    /// Remove the entry of `key` recorded for exactly `span`
    pub fn remove_exact(&mut self, key: &CacheKey, span: &RangeSpan) -> bool {
        let mut found = false;
        self.retain_key(key, |e| {
            if !found && e.span == *span {
                found = true;
                false
            } else {
                true
            }
        });
        found
    }

    /// Encoded size of a table with `entries` entries
    #[must_use]
    pub const fn encoded_size(entries: usize) -> usize {
        TABLE_HEADER_SIZE + entries * RANGE_ENTRY_SIZE
    }

    /// Encoded size of this table
    #[must_use]
    pub fn size_on_disk(&self) -> usize {
        Self::encoded_size(self.len)
    }

    /// Append the encoded table to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(self.len * RANGE_ENTRY_SIZE);
        for entry in self.iter() {
            entry.encode(&mut body);
        }

        buf.put_u32_le(self.len as u32);
        buf.put_u32_le(compute_crc32c(&body));
        buf.put_u64_le(0);
        buf.put_slice(&body);
    }

    /// Read the entry count from an encoded table header
    pub fn peek_len(data: &[u8]) -> Result<usize> {
        if data.len() < TABLE_HEADER_SIZE {
            return Err(Error::corruption("table header truncated"));
        }
        Ok((&data[..4]).get_u32_le() as usize)
    }

    /// Parse an encoded table, verifying its checksum
    pub fn decode(data: &[u8]) -> Result<Self> {
        let count = Self::peek_len(data)?;
        let expected_crc = (&data[4..8]).get_u32_le();

        let end = Self::encoded_size(count);
        if data.len() < end {
            return Err(Error::corruption(format!(
                "table of {count} entries needs {end} bytes, got {}",
                data.len()
            )));
        }

        let body = &data[TABLE_HEADER_SIZE..end];
        if !verify_crc32c(body, expected_crc) {
            return Err(Error::corruption(format!(
                "table checksum mismatch: expected {expected_crc:08x}"
            )));
        }

        let mut table = Self::new();
        for chunk in body.chunks_exact(RANGE_ENTRY_SIZE) {
            let entry = RangeEntry::decode(chunk);
            table.entries.entry(entry.key).or_default().push(entry);
        }
        table.len = count;
        for list in table.entries.values_mut() {
            list.sort_by_key(|e| e.span.object_offset);
        }
        Ok(table)
    }
}
