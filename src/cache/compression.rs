//! Payload Compression
//!
//! LZ4 compression above a size threshold, with fail-open fallback: when the
//! codec errors or does not shrink the payload, the payload is stored as-is.
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::{CompressionAlgorithm, PayloadCompressor};
//!
//! let compressor = PayloadCompressor::new();
//!
//! let data = "cache me ".repeat(200);
//! let (stored, algorithm) = compressor.compress(data.as_bytes(), true);
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let restored = compressor.decompress(&stored, algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data.as_bytes());
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};

/// Payloads at or below this size are never compressed
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Largest payload an LZ4 block may declare
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024 * 1024;

/// Upper bound of the LZ4 block expansion ratio
const LZ4_MAX_RATIO: usize = 255;

const LZ4_SIZE_PREFIX: usize = 4;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    #[default]
    None,
    /// LZ4 block format with prepended length
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Whether the payload went through a codec
    pub fn is_compressed(&self) -> bool {
        *self != CompressionAlgorithm::None
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create new LZ4 compressor with default settings
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let declared = declared_size(data)?;
        lz4::block::decompress(&data[LZ4_SIZE_PREFIX..], Some(declared as i32)).map_err(|e| {
            Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            }
        })
    }
}

/// Size recorded in the block's little-endian prefix, checked against what the
/// remaining bytes could possibly expand to
fn declared_size(data: &[u8]) -> Result<usize> {
    let invalid = |reason: String| Error::DecompressionFailed {
        algorithm: "LZ4".into(),
        reason,
    };

    let mut prefix = [0u8; LZ4_SIZE_PREFIX];
    prefix.copy_from_slice(
        data.get(..LZ4_SIZE_PREFIX)
            .ok_or_else(|| invalid(format!("block of {} bytes has no size prefix", data.len())))?,
    );
    let declared = u32::from_le_bytes(prefix) as usize;

    let body = data.len() - LZ4_SIZE_PREFIX;
    let limit = body
        .saturating_mul(LZ4_MAX_RATIO)
        .saturating_add(1024)
        .min(MAX_DECOMPRESSED_SIZE);
    if declared > limit {
        return Err(invalid(format!(
            "declared size {} exceeds limit {} for a {} byte block",
            declared, limit, body
        )));
    }
    Ok(declared)
}

// =============================================================================
// Payload Compressor
// =============================================================================

/// Threshold-gated compressor used by the cache manager
pub struct PayloadCompressor {
    threshold: usize,
    codec: Box<dyn Compressor>,
}

impl PayloadCompressor {
    /// LZ4 with the default 1 KiB threshold
    pub fn new() -> Self {
        Self::with_codec(DEFAULT_COMPRESSION_THRESHOLD, Box::new(Lz4Compressor::new()))
    }

    /// Custom threshold and codec
    pub fn with_codec(threshold: usize, codec: Box<dyn Compressor>) -> Self {
        Self { threshold, codec }
    }

    /// Compress `data` when `requested` and larger than the threshold.
    ///
    /// Returns the bytes to store and the algorithm actually applied. Never
    /// fails: codec errors and non-shrinking output fall back to the input.
    pub fn compress(&self, data: &[u8], requested: bool) -> (Bytes, CompressionAlgorithm) {
        if !requested || data.len() <= self.threshold {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.codec.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), self.codec.algorithm())
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::debug!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Reverse [`compress`](PayloadCompressor::compress)
    pub fn decompress(&self, data: &Bytes, algorithm: CompressionAlgorithm) -> Result<Bytes> {
        if !algorithm.is_compressed() {
            return Ok(data.clone());
        }
        if algorithm != self.codec.algorithm() {
            return Err(Error::DecompressionFailed {
                algorithm: algorithm.name().into(),
                reason: format!("codec {} not configured", algorithm),
            });
        }
        self.codec.decompress(data).map(Bytes::from)
    }

    /// Size threshold in bytes
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Default for PayloadCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    struct FailingCompressor;

    impl Compressor for FailingCompressor {
        fn algorithm(&self) -> CompressionAlgorithm {
            CompressionAlgorithm::Lz4
        }

        fn compress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Err(Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: "codec missing".into(),
            })
        }

        fn decompress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Err(Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: "codec missing".into(),
            })
        }
    }

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor::new();

        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len());

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_below_threshold_passes_through() {
        let compressor = PayloadCompressor::new();
        let (stored, algorithm) = compressor.compress(TEST_DATA, true);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), TEST_DATA);
    }

    #[test]
    fn test_exactly_threshold_is_not_compressed() {
        let compressor = PayloadCompressor::new();
        let data = vec![b'a'; DEFAULT_COMPRESSION_THRESHOLD];
        let (_, algorithm) = compressor.compress(&data, true);
        assert_eq!(algorithm, CompressionAlgorithm::None);
    }

    #[test]
    fn test_not_requested_passes_through() {
        let compressor = PayloadCompressor::new();
        let data = vec![b'a'; 10_000];
        let (stored, algorithm) = compressor.compress(&data, false);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.len(), data.len());
    }

    #[test]
    fn test_large_repetitive_payload_compresses() {
        let compressor = PayloadCompressor::new();
        let data = TEST_DATA.repeat(40);
        let (stored, algorithm) = compressor.compress(&data, true);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < data.len());
        assert_eq!(compressor.decompress(&stored, algorithm).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_codec_failure_fails_open() {
        let compressor = PayloadCompressor::with_codec(16, Box::new(FailingCompressor));
        let (stored, algorithm) = compressor.compress(TEST_DATA, true);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), TEST_DATA);
    }

    #[test]
    fn test_decompress_garbage_is_an_error() {
        let compressor = PayloadCompressor::new();
        let garbage = Bytes::from_static(&[0x05, 0, 0, 0, 0xff, 0xff]);
        assert!(compressor
            .decompress(&garbage, CompressionAlgorithm::Lz4)
            .is_err());
    }

    #[test]
    fn test_implausible_declared_size_is_rejected() {
        let codec = Lz4Compressor::new();

        // ~2 GiB declared by a six byte block
        let huge = [0xff, 0xff, 0xff, 0x7f, 0x11, 0x22];
        assert_matches!(
            codec.decompress(&huge),
            Err(Error::DecompressionFailed { reason, .. }) if reason.contains("exceeds limit")
        );

        // within the absolute cap, beyond what 10 bytes can expand to
        let mut block = (1024u32 * 1024).to_le_bytes().to_vec();
        block.extend_from_slice(&[0u8; 10]);
        assert!(codec.decompress(&block).is_err());

        assert!(codec.decompress(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn test_highly_repetitive_payload_within_limit() {
        let codec = Lz4Compressor::new();
        let data = vec![0u8; 1 << 20];
        let compressed = codec.compress(&data).unwrap();
        assert_eq!(codec.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Lz4.to_string(), "lz4");
        assert!(!CompressionAlgorithm::None.is_compressed());
    }
}
