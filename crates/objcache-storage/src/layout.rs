//! Metadata slot layout
//!
//! Each volume carries two metadata slots (A and B). A slot holds one
//! complete copy of the volume metadata:
//!
//! ```text
//! +------------------+  0
//! |  Control block   |  64 bytes - magic, version, uuid, sync serial
//! +------------------+  64
//! |  Write cursor    |  16 bytes - write position and lap
//! +------------------+  80
//! |  Table header    |  16 bytes - entry count, entry CRC32C
//! +------------------+  96
//! |  Range entries   |  48 bytes each
//! +------------------+
//! |  Control block   |  64 bytes - byte-identical copy (footer)
//! +------------------+
//! ```
//!
//! All integers are little-endian. The header and footer are written
//! together with the slot; a write torn anywhere in between leaves them
//! different and the slot is rejected on load.

use bytes::{Buf, BufMut};
use objcache_common::{Error, Result, VolumeId};
use std::cmp::Ordering;

/// Magic number identifying an objcache control block ("OCVB")
pub const MAGIC: u32 = 0x4F43_5642;

/// Size of an encoded control block
pub const CONTROL_BLOCK_SIZE: usize = 64;

/// Bytes of the control block carrying fields:
/// magic(4) + major(2) + minor(2) + uuid(16) + create_time(8) + sync_serial(4)
/// = 36 bytes; the rest is zero padding
const CONTROL_BLOCK_USED: usize = 36;

/// On-disk format version
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    /// Version written by this build
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Create a version
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Compare two sync serials with wraparound
///
/// `a` is fresher than `b` iff `a - b (mod 2^32)` lies in the lower half
/// of the range. Serials exactly half the range apart are unordered.
#[must_use]
pub fn compare_serials(a: u32, b: u32) -> Ordering {
    let diff = a.wrapping_sub(b);
    if diff == 0 {
        Ordering::Equal
    } else if diff < 0x8000_0000 {
        Ordering::Greater
    } else if diff > 0x8000_0000 {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Check whether serial `a` is strictly fresher than serial `b`
#[must_use]
pub fn serial_is_fresher(a: u32, b: u32) -> bool {
    compare_serials(a, b) == Ordering::Greater
}

/// Volume control block, stored as both slot header and slot footer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlBlock {
    /// Magic number for format identification
    pub magic: u32,
    /// On-disk format version
    pub version: FormatVersion,
    /// Stable volume identity
    pub uuid: VolumeId,
    /// Creation timestamp (Unix epoch seconds), informational only
    pub create_time: u64,
    /// Generation counter; picks the fresher of the two slots
    pub sync_serial: u32,
}

impl ControlBlock {
    /// A fresh control block for a newly created volume
    #[must_use]
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            magic: MAGIC,
            version: FormatVersion::CURRENT,
            uuid: VolumeId::new(),
            create_time: now,
            sync_serial: 0,
        }
    }

    /// The all-zero block of a volume that was never initialized
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            magic: 0,
            version: FormatVersion::new(0, 0),
            uuid: VolumeId::nil(),
            create_time: 0,
            sync_serial: 0,
        }
    }

    /// Check magic and version against this build
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.magic == MAGIC && self.version == FormatVersion::CURRENT
    }

    /// Append the encoded block to `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.magic);
        buf.put_u16_le(self.version.major);
        buf.put_u16_le(self.version.minor);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u64_le(self.create_time);
        buf.put_u32_le(self.sync_serial);
        buf.put_bytes(0, CONTROL_BLOCK_SIZE - CONTROL_BLOCK_USED);
    }

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CONTROL_BLOCK_SIZE] {
        let mut buf = [0u8; CONTROL_BLOCK_SIZE];
        self.encode(&mut &mut buf[..]);
        buf
    }

    /// Parse from bytes
    ///
    /// Only the length is checked here; whether the block is usable is
    /// decided by [`is_current`](Self::is_current).
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CONTROL_BLOCK_SIZE {
            return Err(Error::corruption(format!(
                "control block needs {CONTROL_BLOCK_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let mut buf = &data[..CONTROL_BLOCK_SIZE];
        let magic = buf.get_u32_le();
        let major = buf.get_u16_le();
        let minor = buf.get_u16_le();
        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let create_time = buf.get_u64_le();
        let sync_serial = buf.get_u32_le();

        Ok(Self {
            magic,
            version: FormatVersion::new(major, minor),
            uuid: VolumeId::from_bytes(uuid),
            create_time,
            sync_serial,
        })
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::zeroed()
    }
}
