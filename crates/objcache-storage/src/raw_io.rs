//! Raw volume file I/O
//!
//! A volume is a regular file or a block device. With direct I/O enabled
//! the page cache is bypassed (O_DIRECT on Linux) and every transfer must
//! use aligned offsets, lengths and buffers.

use objcache_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O
pub const ALIGNMENT: usize = 4096;

/// Volume file handle
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    direct_io: bool,
}

impl RawFile {
    /// Open an existing volume file or device
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        Self::apply_direct_io(&mut options, direct_io);

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open {path_str}: {e}")))?;
        let size = Self::probe_size(&file, &path_str)?;

        Ok(Self {
            file,
            path: path_str,
            size,
            direct_io,
        })
    }

    /// Create a volume file of the given size
    ///
    /// Block devices are opened as they are; their size is the device's.
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }
        Self::apply_direct_io(&mut options, direct_io);

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to create {path_str}: {e}")))?;

        let actual_size = if is_block_device {
            Self::probe_size(&file, &path_str)?
        } else {
            file.set_len(size)
                .map_err(|e| Error::storage(format!("failed to set size for {path_str}: {e}")))?;
            size
        };

        let raw = Self {
            file,
            path: path_str,
            size: actual_size,
            direct_io,
        };
        if !is_block_device {
            raw.sync()?;
        }
        Ok(raw)
    }

    fn apply_direct_io(options: &mut OpenOptions, direct_io: bool) {
        #[cfg(target_os = "linux")]
        {
            if direct_io {
                options.custom_flags(libc::O_DIRECT);
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = (options, direct_io);
    }

    /// Size of a file or device, found by seeking to its end
    fn probe_size(file: &File, path: &str) -> Result<u64> {
        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::storage(format!("failed to get size of {path}: {e}")))?;
        f.seek(SeekFrom::Start(0))
            .map_err(|e| Error::storage(format!("failed to seek {path}: {e}")))?;
        Ok(size)
    }

    /// Get the file size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check whether the page cache is bypassed
    pub fn direct_io(&self) -> bool {
        self.direct_io
    }

    /// Fill `buf` from `offset`
    ///
    /// I/O failures surface as [`Error::DiskIo`] with the OS error intact.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Sync data and metadata to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn check_alignment(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.direct_io {
            return Ok(());
        }
        if offset % ALIGNMENT as u64 != 0 {
            return Err(Error::invalid_argument(format!(
                "offset {offset} is not aligned to {ALIGNMENT}"
            )));
        }
        if buf.len() % ALIGNMENT != 0 {
            return Err(Error::invalid_argument(format!(
                "size {} is not aligned to {ALIGNMENT}",
                buf.len()
            )));
        }
        if buf.as_ptr() as usize % ALIGNMENT != 0 {
            return Err(Error::invalid_argument("buffer is not aligned for direct I/O"));
        }
        Ok(())
    }
}

/// Zero-filled buffer whose start is aligned for direct I/O
///
/// Over-allocates by one alignment unit and exposes the aligned window.
#[derive(Debug)]
pub struct AlignedBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Create a buffer of `size` bytes rounded up to ALIGNMENT
    pub fn new(size: usize) -> Self {
        let len = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        let data = vec![0u8; len + ALIGNMENT];
        let start = data.as_ptr().align_offset(ALIGNMENT);
        Self { data, start, len }
    }

    /// Get the buffer as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    /// Get the buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    /// Get the buffer size
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy data into the buffer (pads with zeros if source is smaller)
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        let copy_len = src.len().min(dst.len());
        dst[..copy_len].copy_from_slice(&src[..copy_len]);
        dst[copy_len..].fill(0);
    }
}
