//! objcache Common - Shared types and utilities
//!
//! This crate provides the error type, identifiers and volume
//! configuration shared by the storage core and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{compute_crc32c, verify_crc32c};
pub use config::{VolumeConfig, VolumeGeometry};
pub use error::{Error, Result};
pub use types::*;
