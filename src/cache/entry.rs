//! Cache Entry Types
//!
//! [`CacheEntry`] is the unit held by the local memory tier. [`Envelope`] is the
//! byte layout every tier stores: a header carrying the compression tag and the
//! logical expiry, followed by the (possibly compressed) body.
//!
//! ```text
//! ┌──────────┬──────────────────────────┬─────────────────────┐
//! │ tag (1B) │ expires_at ms (8B, BE)   │ body                │
//! └──────────┴──────────────────────────┴─────────────────────┘
//! ```
//!
//! The logical expiry travels with the payload so a durable or shared backend
//! that retains bytes longer than requested (TTL clamping) never serves a value
//! the caller asked to expire.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use super::compression::CompressionAlgorithm;
use super::key::NormalizedKey;
use crate::error::{Error, Result};

/// Header length in bytes
pub const ENVELOPE_HEADER_LEN: usize = 9;

const TAG_RAW: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;

/// Framed payload as stored in every tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Compression applied to `body`
    pub algorithm: CompressionAlgorithm,
    /// Logical expiry of the value
    pub expires_at: DateTime<Utc>,
    /// Body bytes (compressed when `algorithm` is not `None`)
    pub body: Bytes,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(algorithm: CompressionAlgorithm, expires_at: DateTime<Utc>, body: Bytes) -> Self {
        Self {
            algorithm,
            expires_at,
            body,
        }
    }

    /// Serialize header + body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + self.body.len());
        buf.put_u8(match self.algorithm {
            CompressionAlgorithm::None => TAG_RAW,
            CompressionAlgorithm::Lz4 => TAG_LZ4,
        });
        buf.put_i64(self.expires_at.timestamp_millis());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Parse bytes produced by [`encode`](Envelope::encode)
    pub fn decode(data: &Bytes) -> Result<Self> {
        if data.len() < ENVELOPE_HEADER_LEN {
            return Err(Error::CorruptEnvelope(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                ENVELOPE_HEADER_LEN
            )));
        }

        let algorithm = match data[0] {
            TAG_RAW => CompressionAlgorithm::None,
            TAG_LZ4 => CompressionAlgorithm::Lz4,
            other => {
                return Err(Error::CorruptEnvelope(format!(
                    "unknown compression tag 0x{:02x}",
                    other
                )))
            }
        };

        let mut millis = [0u8; 8];
        millis.copy_from_slice(&data[1..ENVELOPE_HEADER_LEN]);
        let millis = i64::from_be_bytes(millis);
        let expires_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| Error::CorruptEnvelope(format!("invalid expiry {}", millis)))?;

        Ok(Self {
            algorithm,
            expires_at,
            body: data.slice(ENVELOPE_HEADER_LEN..),
        })
    }

    /// True once `now` has reached the logical expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Entry held by the local memory tier
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: NormalizedKey,
    payload: Bytes,
    expires_at: DateTime<Utc>,
    size_bytes: u64,
}

impl CacheEntry {
    /// Create an entry; `size_bytes` is fixed to the payload length here
    pub fn new(key: NormalizedKey, payload: Bytes, expires_at: DateTime<Utc>) -> Self {
        let size_bytes = payload.len() as u64;
        Self {
            key,
            payload,
            expires_at,
            size_bytes,
        }
    }

    /// Normalized key
    #[inline]
    pub fn key(&self) -> &NormalizedKey {
        &self.key
    }

    /// Stored payload
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Absolute expiry
    #[inline]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Size used for budget accounting
    #[inline]
    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// Tests
// =============================================================================
