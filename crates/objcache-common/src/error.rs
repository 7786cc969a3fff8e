//! Error types for objcache
//!
//! Only genuine faults are errors. Structural corruption found during
//! recovery, policy rejections and missing keys are reported through
//! the return values of the storage operations instead.

use thiserror::Error;

/// Common result type for objcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for objcache
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("insufficient space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("metadata of {size} bytes does not fit a {slot_size} byte slot")]
    MetadataTooLarge { size: u64, slot_size: u64 },

    #[error("corrupted metadata: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this error came from the underlying device
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::DiskIo(_))
    }

    /// Check if this error reports damaged on-disk data
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}
