//! Checksum and digest helpers

use sha2::{Digest, Sha256};

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// 16-byte digest of arbitrary data (SHA-256, truncated)
#[must_use]
pub fn digest16(data: &[u8]) -> [u8; 16] {
    let hash = Sha256::digest(data);
    let mut result = [0u8; 16];
    result.copy_from_slice(&hash[..16]);
    result
}
