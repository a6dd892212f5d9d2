//! Checksum utilities for Shardstore
//!
//! SHA-256 is the normative content checksum (objects and shards);
//! CRC32C rides along for cheap sidecar verification.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Checksum values computed for a block of data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// SHA-256 hash
    pub sha256: [u8; 32],
}

impl Checksum {
    /// Compute both checksums from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            sha256: Sha256::digest(data).into(),
        }
    }

    /// Rebuild a checksum from its wire representation
    ///
    /// Returns `None` when the hex digest does not parse to 32 bytes.
    #[must_use]
    pub fn from_parts(crc32c: u32, sha256_hex: &str) -> Option<Self> {
        let bytes = hex::decode(sha256_hex).ok()?;
        let sha256: [u8; 32] = bytes.try_into().ok()?;
        Some(Self { crc32c, sha256 })
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against this checksum (full check)
    #[must_use]
    pub fn verify_full(&self, data: &[u8]) -> bool {
        if !self.verify_fast(data) {
            return false;
        }
        let actual: [u8; 32] = Sha256::digest(data).into();
        actual == self.sha256
    }

    /// SHA-256 rendered as lowercase hex
    #[must_use]
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// Streaming checksum calculator
///
/// Used by the shard node to hash upload bodies as they stream to disk.
pub struct ChecksumCalculator {
    crc32c: u32,
    sha256: Sha256,
    bytes: u64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            sha256: Sha256::new(),
            bytes: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.sha256.update(data);
        self.bytes += data.len() as u64;
    }

    /// Total bytes fed in so far
    #[must_use]
    pub const fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            sha256: self.sha256.finalize().into(),
        }
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot SHA-256 rendered as lowercase hex
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verify() {
        let data = b"hello, world!";
        let checksum = Checksum::compute(data);

        assert!(checksum.verify_fast(data));
        assert!(checksum.verify_full(data));

        let corrupted = b"hello, world?";
        assert!(!checksum.verify_fast(corrupted));
        assert!(!checksum.verify_full(corrupted));
    }

    #[test]
    fn test_streaming_calculator() {
        let data = b"hello, world!";
        let expected = Checksum::compute(data);

        let mut calc = ChecksumCalculator::new();
        calc.update(b"hello, ");
        calc.update(b"world!");
        assert_eq!(calc.bytes_seen(), data.len() as u64);
        assert_eq!(calc.finalize(), expected);
    }

    #[test]
    fn test_from_parts_round_trip() {
        let data = b"hello, world!";
        let checksum = Checksum::compute(data);

        let rebuilt = Checksum::from_parts(checksum.crc32c, &checksum.sha256_hex()).unwrap();
        assert_eq!(rebuilt, checksum);
        assert!(rebuilt.verify_full(data));

        assert!(Checksum::from_parts(0, "not hex").is_none());
        assert!(Checksum::from_parts(0, "abcd").is_none()); // too short
    }

    #[test]
    fn test_sha256_hex() {
        // Known digest of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
