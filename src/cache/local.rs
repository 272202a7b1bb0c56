//! Local Memory Tier
//!
//! Process-local, byte-budgeted store of [`CacheEntry`] values.
//!
//! # Eviction
//!
//! When the stored bytes exceed the budget, the 25% of entries closest to
//! expiry are removed (sorted by `expires_at` ascending), repeated until the
//! total is back under budget. This approximates "least time remaining"
//! rather than LRU, which suits short-TTL workloads where the soonest-to-expire
//! values are the least valuable.
//!
//! # Write generations
//!
//! `set`, `delete` and prefix deletes advance a write generation covering the
//! key. A reader that copies a slower tier's value in through
//! [`LocalMemoryCache::set_if_unchanged`] only succeeds when no such write
//! happened since it took its [`WriteGeneration`] snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::clock::SharedClock;
use super::entry::CacheEntry;
use super::key::NormalizedKey;
use super::shard::ShardedMap;
use crate::config::DEFAULT_MEMORY_BUDGET;

/// Share of entries removed per eviction round
const EVICTION_FRACTION: f64 = super::LOCAL_EVICTION_PERCENT as f64 / 100.0;

/// Local tier configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Byte budget
    pub memory_budget: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET,
        }
    }
}

/// Snapshot of the writes that have touched a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteGeneration {
    epoch: u64,
    key: u64,
}

/// Local memory tier
pub struct LocalMemoryCache {
    storage: ShardedMap,
    config: LocalConfig,
    clock: SharedClock,
    /// Advanced by prefix deletes and `clear`
    epoch: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalMemoryCache {
    /// Create a local tier
    pub fn new(config: LocalConfig, clock: SharedClock) -> Self {
        Self {
            storage: ShardedMap::new(),
            config,
            clock,
            epoch: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Get an entry; expired entries are removed and reported as absent
    pub fn get(&self, key: &NormalizedKey) -> Option<CacheEntry> {
        let entry = self.storage.get(key)?;
        let now = self.clock.now();
        if entry.is_expired(now) {
            // only drop it if a concurrent set has not replaced it meanwhile
            if self
                .storage
                .remove_if(key, |current| current.is_expired(now))
                .is_some()
            {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }
        Some(entry)
    }

    /// Store `payload` until `expires_at`.
    ///
    /// Returns false when the payload alone exceeds the budget.
    pub fn set(&self, key: NormalizedKey, payload: Bytes, expires_at: DateTime<Utc>) -> bool {
        let entry = CacheEntry::new(key, payload, expires_at);
        if entry.size() > self.config.memory_budget {
            debug!(
                key = %entry.key(),
                size = entry.size(),
                "Entry larger than local memory budget, skipping"
            );
            return false;
        }

        self.storage.insert(entry);

        if self.storage.size_bytes() > self.config.memory_budget {
            self.evict();
        }
        true
    }

    /// Current write generation of `key`
    pub fn generation(&self, key: &NormalizedKey) -> WriteGeneration {
        WriteGeneration {
            epoch: self.epoch.load(Ordering::SeqCst),
            key: self.storage.generation(key),
        }
    }

    /// Record a write to `key` made without storing it locally
    pub fn touch(&self, key: &NormalizedKey) {
        self.storage.bump(key);
    }

    /// Store `payload` unless `key` was written since `seen` was taken.
    ///
    /// Returns `None` when a newer write won, otherwise whether it was stored.
    pub fn set_if_unchanged(
        &self,
        key: NormalizedKey,
        payload: Bytes,
        expires_at: DateTime<Utc>,
        seen: WriteGeneration,
    ) -> Option<bool> {
        let entry = CacheEntry::new(key, payload, expires_at);
        if entry.size() > self.config.memory_budget {
            return Some(false);
        }

        let stored = self.storage.insert_if(entry, |current| {
            current == seen.key && self.epoch.load(Ordering::SeqCst) == seen.epoch
        });
        if !stored {
            return None;
        }

        if self.storage.size_bytes() > self.config.memory_budget {
            self.evict();
        }
        Some(true)
    }

    /// Remove one key
    pub fn delete(&self, key: &NormalizedKey) -> bool {
        self.storage.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`, returning the count
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.storage
            .drain_where(|e| e.key().as_str().starts_with(prefix))
            .len()
    }

    /// Remove every expired entry, returning the count
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = self.storage.drain_where(|e| e.is_expired(now)).len();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Evict soonest-to-expire entries until under budget
    fn evict(&self) {
        while self.storage.size_bytes() > self.config.memory_budget {
            let mut candidates = self.storage.entries();
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by_key(|e| e.expires_at());

            let batch = ((candidates.len() as f64) * EVICTION_FRACTION).ceil() as usize;
            let mut evicted = 0u64;
            for entry in candidates.into_iter().take(batch.max(1)) {
                let expires_at = entry.expires_at();
                if self
                    .storage
                    .remove_if(entry.key(), |current| current.expires_at() == expires_at)
                    .is_some()
                {
                    evicted += 1;
                }
            }

            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            if evicted == 0 {
                break;
            }
            debug!(
                evicted,
                remaining_bytes = self.storage.size_bytes(),
                budget = self.config.memory_budget,
                "Local memory eviction round"
            );
        }
    }

    /// Current stored bytes
    pub fn size(&self) -> u64 {
        self.storage.size_bytes()
    }

    /// Byte budget
    pub fn capacity(&self) -> u64 {
        self.config.memory_budget
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Whether `key` is present and unexpired
    pub fn contains(&self, key: &NormalizedKey) -> bool {
        self.storage
            .get(key)
            .map(|e| !e.is_expired(self.clock.now()))
            .unwrap_or(false)
    }

    /// Entries removed by budget pressure
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries removed because they expired
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Clear the tier
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.storage.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
