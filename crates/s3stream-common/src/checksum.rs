//! Checksum utilities for s3stream
//!
//! Object data blocks carry a CRC32C for inline verification and an
//! xxHash64 for cheap whole-block comparison.

use serde::{Deserialize, Serialize};

/// Checksum values computed for a block of data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for comparison)
    pub xxhash64: u64,
}

impl Checksum {
    #[must_use]
    pub const fn new(crc32c: u32, xxhash64: u64) -> Self {
        Self { crc32c, xxhash64 }
    }

    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this checksum (CRC32C only)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against both hashes
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        self.verify_fast(data) && xxhash_rust::xxh64::xxh64(data, 0) == self.xxhash64
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
}

impl ChecksumCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
        }
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_checksum_verify() {
        let data = b"stream 233 batch";
        let checksum = Checksum::compute(data);

        assert!(checksum.verify_fast(data));
        assert!(checksum.verify(data));

        let corrupted = b"stream 233 batcH";
        assert!(!checksum.verify_fast(corrupted));
        assert!(!checksum.verify(corrupted));
    }

    #[test]
    fn test_streaming_calculator() {
        let mut data = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut data);

        let expected = Checksum::compute(&data);

        let mut calc = ChecksumCalculator::new();
        for chunk in data.chunks(1000) {
            calc.update(chunk);
        }
        assert_eq!(calc.finalize(), expected);
    }

    #[test]
    fn test_crc32c_helpers() {
        let crc = compute_crc32c(b"abc");
        assert!(verify_crc32c(b"abc", crc));
        assert!(!verify_crc32c(b"abd", crc));
    }
}
