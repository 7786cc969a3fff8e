//! Write cursor of the circular data region
//!
//! Appends always land at `write_pos`. When an append would run past the
//! end of the volume the caller wraps the cursor back to the start of the
//! data region and `write_lap` goes up by one. Data is never freed
//! explicitly: whatever the cursor passes over on its next lap is gone,
//! and liveness of a recorded span is a pure function of its
//! `(lap, offset)` against the cursor's.

use bytes::{Buf, BufMut};
use objcache_common::{Error, Result};

/// Size of an encoded write cursor
pub const WRITE_CURSOR_SIZE: usize = 16;

/// Append position and wrap counter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteCursor {
    /// Next byte offset to append at
    pub write_pos: u64,
    /// Number of times the cursor has wrapped
    pub write_lap: u32,
}

impl WriteCursor {
    /// A cursor at `write_pos` on lap 0
    #[must_use]
    pub const fn new(write_pos: u64) -> Self {
        Self {
            write_pos,
            write_lap: 0,
        }
    }

    /// Move past `n` freshly appended bytes
    pub fn advance(&mut self, n: u64) {
        self.write_pos += n;
    }

    /// Restart at `new_offset` on the next lap
    pub fn wrap(&mut self, new_offset: u64) {
        self.write_pos = new_offset;
        self.write_lap = self.write_lap.wrapping_add(1);
    }

    /// Check whether data written at `offset` during `lap` is still on disk
    ///
    /// Current-lap data is live behind the cursor. Previous-lap data is
    /// live strictly ahead of it: the byte at the cursor is the next one
    /// to be overwritten, so a span starting exactly there is treated as
    /// already gone. Anything older has been lapped.
    #[must_use]
    pub fn is_live(&self, lap: u32, offset: u64) -> bool {
        if lap == self.write_lap {
            offset < self.write_pos
        } else if lap.wrapping_add(1) == self.write_lap {
            offset > self.write_pos
        } else {
            false
        }
    }

    /// Append the encoded cursor to `buf`
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.write_pos);
        buf.put_u32_le(self.write_lap);
        buf.put_u32_le(0);
    }

    /// Parse from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < WRITE_CURSOR_SIZE {
            return Err(Error::corruption("write cursor truncated"));
        }
        let mut buf = &data[..WRITE_CURSOR_SIZE];
        let write_pos = buf.get_u64_le();
        let write_lap = buf.get_u32_le();
        Ok(Self {
            write_pos,
            write_lap,
        })
    }
}
