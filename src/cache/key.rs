//! Key Normalization
//!
//! Raw caller keys are arbitrary strings. Every tier stores them as
//! `<group-prefix><hash>` where the prefix is derived from the group name
//! only, so a whole group can be addressed by prefix.
//!
//! Layout: `{group}:{32 hex chars of sha256(raw key)}`. Group names are
//! restricted to `[A-Za-z0-9_.-]` (anything else becomes `_`). A group name
//! too long for [`MAX_KEY_LEN`] is truncated and suffixed with `~` and eight
//! hex chars of its own hash, so the result is deterministic and two long
//! group names sharing a head still get distinct prefixes.

use std::fmt;

use sha2::{Digest, Sha256};

/// Maximum length of a normalized key
pub const MAX_KEY_LEN: usize = 172;

/// Hex characters of the raw-key hash kept in the key
const KEY_HASH_LEN: usize = 32;

/// Hex characters of the group hash used when truncating a long group name
const GROUP_HASH_LEN: usize = 8;

/// Separator between group prefix and key hash
const SEPARATOR: char = ':';

/// Longest group prefix (including the separator) that still fits the cap
const MAX_PREFIX_LEN: usize = MAX_KEY_LEN - KEY_HASH_LEN;

/// A storage key derived from `(raw key, group)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    /// Normalize `raw` within `group`
    pub fn new(group: &str, raw: &str) -> Self {
        let mut key = group_prefix(group);
        key.push_str(&hex_digest(raw.as_bytes(), KEY_HASH_LEN));
        Self(key)
    }

    /// Wrap an already-normalized key (e.g. read back from a backend listing)
    pub fn from_normalized(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as stored
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Group prefix part of the key, including the separator
    pub fn prefix(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[..=idx],
            None => "",
        }
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Prefix shared by every key of `group` (ends with `:`)
pub fn group_prefix(group: &str) -> String {
    let mut sanitized: String = group
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.len() + 1 > MAX_PREFIX_LEN {
        // sanitized is pure ASCII, so byte truncation is char-safe
        let keep = MAX_PREFIX_LEN - 1 - 1 - GROUP_HASH_LEN;
        sanitized.truncate(keep);
        sanitized.push('~');
        sanitized.push_str(&hex_digest(group.as_bytes(), GROUP_HASH_LEN));
    }

    sanitized.push(SEPARATOR);
    sanitized
}

fn hex_digest(data: &[u8], len: usize) -> String {
    let digest = Sha256::digest(data);
    let mut out = hex::encode(digest);
    out.truncate(len);
    out
}
