//! Error types for tiercache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache tiers and their configuration.
///
/// None of these cross the public [`CacheManager`](crate::cache::CacheManager)
/// API for lookups: tier adapters return them and the manager logs and absorbs
/// them.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization of a cached value failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// Backing store of a tier is unreachable or failed
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// Backing store of a tier did not answer in time
    #[error("{tier} tier timed out after {timeout_ms}ms")]
    TierTimeout { tier: String, timeout_ms: u64 },

    /// Stored bytes do not form a valid envelope
    #[error("Corrupt cache envelope: {0}")]
    CorruptEnvelope(String),

    /// Invalid key pattern for bulk deletion
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::TierUnavailable`] from any displayable cause
    pub fn tier_unavailable(tier: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that mean "treat as a miss" rather than a bug
    pub fn is_tier_failure(&self) -> bool {
        matches!(
            self,
            Error::TierUnavailable { .. } | Error::TierTimeout { .. } | Error::Io(_)
        )
    }
}
