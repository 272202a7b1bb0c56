//! Sharded Entry Map
//!
//! Concurrent map used by the local memory tier.
//!
//! # Design
//!
//! - Each shard has its own RwLock: concurrent readers, exclusive writers
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Byte accounting lives under the same lock as the map, so a shard's
//!   `bytes` always equals the sum of its entry sizes
//! - Each shard keeps striped write generations. `insert` and `remove` bump
//!   the key's stripe under the write lock, so `insert_if` can refuse a
//!   write that raced with them

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use super::entry::CacheEntry;
use super::key::NormalizedKey;

/// Write generation stripes per shard
const GENERATION_STRIPES: usize = 32;

#[derive(Default)]
struct ShardInner {
    map: HashMap<NormalizedKey, CacheEntry>,
    bytes: u64,
    generations: [u64; GENERATION_STRIPES],
}

impl ShardInner {
    fn bump(&mut self, stripe: usize) {
        self.generations[stripe] = self.generations[stripe].wrapping_add(1);
    }

    fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.bytes += entry.size();
        let old = self.map.insert(entry.key().clone(), entry);
        if let Some(old) = &old {
            self.bytes -= old.size();
        }
        old
    }
}

/// Single shard holding entries and their byte total
#[derive(Default)]
pub struct Shard {
    inner: RwLock<ShardInner>,
}

impl Shard {
    /// Get a copy of the entry for `key`
    pub fn get(&self, key: &NormalizedKey) -> Option<CacheEntry> {
        self.inner.read().map.get(key).cloned()
    }

    /// Write generation of `stripe`
    pub fn generation(&self, stripe: usize) -> u64 {
        self.inner.read().generations[stripe]
    }

    /// Bump the write generation of `stripe`
    pub fn bump(&self, stripe: usize) {
        self.inner.write().bump(stripe);
    }

    /// Insert as a new write, returning the replaced entry
    pub fn insert(&self, entry: CacheEntry, stripe: usize) -> Option<CacheEntry> {
        let mut guard = self.inner.write();
        guard.bump(stripe);
        guard.put(entry)
    }

    /// Insert only if `pred` accepts the stripe's current generation.
    ///
    /// Does not bump the generation.
    pub fn insert_if<F>(&self, entry: CacheEntry, stripe: usize, pred: F) -> bool
    where
        F: FnOnce(u64) -> bool,
    {
        let mut guard = self.inner.write();
        if !pred(guard.generations[stripe]) {
            return false;
        }
        guard.put(entry);
        true
    }

    /// Remove `key` as a new write
    pub fn remove(&self, key: &NormalizedKey, stripe: usize) -> Option<CacheEntry> {
        let mut guard = self.inner.write();
        guard.bump(stripe);
        let removed = guard.map.remove(key);
        if let Some(entry) = &removed {
            guard.bytes -= entry.size();
        }
        removed
    }

    /// Remove `key` only if `pred` holds for its current entry
    pub fn remove_if<F>(&self, key: &NormalizedKey, pred: F) -> Option<CacheEntry>
    where
        F: FnOnce(&CacheEntry) -> bool,
    {
        let mut guard = self.inner.write();
        if !guard.map.get(key).map(pred).unwrap_or(false) {
            return None;
        }
        let removed = guard.map.remove(key);
        if let Some(entry) = &removed {
            guard.bytes -= entry.size();
        }
        removed
    }

    /// Remove every entry matching `pred`, returning them
    pub fn drain_where<F>(&self, mut pred: F) -> Vec<CacheEntry>
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut guard = self.inner.write();
        let doomed: Vec<NormalizedKey> = guard
            .map
            .values()
            .filter(|e| pred(e))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(entry) = guard.map.remove(&key) {
                guard.bytes -= entry.size();
                removed.push(entry);
            }
        }
        removed
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.inner.read().map.values().cloned().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of entries
    pub fn size_bytes(&self) -> u64 {
        self.inner.read().bytes
    }

    /// Clear all entries
    pub fn clear(&self) {
        let mut guard = self.inner.write();
        guard.map.clear();
        guard.bytes = 0;
    }
}

/// Map split into `N` independently locked shards
pub struct ShardedMap<const N: usize = 16> {
    shards: Vec<Shard>,
}

impl<const N: usize> Default for ShardedMap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ShardedMap<N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two());
        Self {
            shards: (0..N).map(|_| Shard::default()).collect(),
        }
    }

    #[inline]
    fn shard_for(&self, key: &NormalizedKey) -> &Shard {
        self.locate(key).0
    }

    /// Shard and generation stripe of `key`
    #[inline]
    fn locate(&self, key: &NormalizedKey) -> (&Shard, usize) {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as usize;
        let stripe = (hash >> N.trailing_zeros()) % GENERATION_STRIPES;
        (&self.shards[hash & (N - 1)], stripe)
    }

    /// Get the shard count
    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    /// Get an entry
    pub fn get(&self, key: &NormalizedKey) -> Option<CacheEntry> {
        self.shard_for(key).get(key)
    }

    /// Write generation covering `key`
    pub fn generation(&self, key: &NormalizedKey) -> u64 {
        let (shard, stripe) = self.locate(key);
        shard.generation(stripe)
    }

    /// Bump the write generation covering `key`
    pub fn bump(&self, key: &NormalizedKey) {
        let (shard, stripe) = self.locate(key);
        shard.bump(stripe);
    }

    /// Insert an entry as a new write
    pub fn insert(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let (shard, stripe) = self.locate(entry.key());
        shard.insert(entry, stripe)
    }

    /// Insert an entry only if `pred` accepts the current write generation
    pub fn insert_if<F>(&self, entry: CacheEntry, pred: F) -> bool
    where
        F: FnOnce(u64) -> bool,
    {
        let (shard, stripe) = self.locate(entry.key());
        shard.insert_if(entry, stripe, pred)
    }

    /// Remove an entry as a new write
    pub fn remove(&self, key: &NormalizedKey) -> Option<CacheEntry> {
        let (shard, stripe) = self.locate(key);
        shard.remove(key, stripe)
    }

    /// Remove an entry only if `pred` holds
    pub fn remove_if<F>(&self, key: &NormalizedKey, pred: F) -> Option<CacheEntry>
    where
        F: FnOnce(&CacheEntry) -> bool,
    {
        self.shard_for(key).remove_if(key, pred)
    }

    /// Remove every matching entry across all shards
    pub fn drain_where<F>(&self, mut pred: F) -> Vec<CacheEntry>
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        self.shards
            .iter()
            .flat_map(|shard| shard.drain_where(&mut pred))
            .collect()
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.shards.iter().flat_map(Shard::entries).collect()
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Shard::is_empty)
    }

    /// Get total size in bytes across all shards
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(Shard::size_bytes).sum()
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;

    fn entry(group: &str, key: &str, size: usize) -> CacheEntry {
        CacheEntry::new(
            NormalizedKey::new(group, key),
            Bytes::from(vec![0u8; size]),
            Utc::now(),
        )
    }

    #[test]
    fn test_insert_replace_tracks_bytes() {
        let map: ShardedMap<4> = ShardedMap::new();
        assert!(map.insert(entry("g", "a", 100)).is_none());
        assert_eq!(map.size_bytes(), 100);

        let old = map.insert(entry("g", "a", 40)).unwrap();
        assert_eq!(old.size(), 100);
        assert_eq!(map.size_bytes(), 40);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove() {
        let map: ShardedMap<4> = ShardedMap::new();
        map.insert(entry("g", "a", 10));
        let key = NormalizedKey::new("g", "a");
        assert!(map.remove(&key).is_some());
        assert!(map.remove(&key).is_none());
        assert_eq!(map.size_bytes(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_remove_if() {
        let map: ShardedMap<4> = ShardedMap::new();
        map.insert(entry("g", "a", 10));
        let key = NormalizedKey::new("g", "a");
        assert!(map.remove_if(&key, |e| e.size() > 10).is_none());
        assert!(map.remove_if(&key, |e| e.size() == 10).is_some());
    }

    #[test]
    fn test_writes_bump_generation() {
        let map: ShardedMap<4> = ShardedMap::new();
        let key = NormalizedKey::new("g", "a");
        let g0 = map.generation(&key);

        map.insert(entry("g", "a", 10));
        let g1 = map.generation(&key);
        assert_ne!(g0, g1);

        map.remove(&key);
        assert_ne!(map.generation(&key), g1);
    }

    #[test]
    fn test_insert_if_checks_generation() {
        let map: ShardedMap<4> = ShardedMap::new();
        let key = NormalizedKey::new("g", "a");
        let seen = map.generation(&key);

        map.bump(&key);
        assert!(!map.insert_if(entry("g", "a", 10), |g| g == seen));
        assert!(map.is_empty());

        let seen = map.generation(&key);
        assert!(map.insert_if(entry("g", "a", 10), |g| g == seen));
        assert_eq!(map.generation(&key), seen);
        assert_eq!(map.size_bytes(), 10);
    }

    #[test]
    fn test_drain_where_across_shards() {
        let map: ShardedMap<8> = ShardedMap::new();
        for i in 0..50 {
            map.insert(entry("keep", &i.to_string(), 1));
            map.insert(entry("drop", &i.to_string(), 2));
        }
        let removed = map.drain_where(|e| e.key().as_str().starts_with("drop:"));
        assert_eq!(removed.len(), 50);
        assert_eq!(map.len(), 50);
        assert_eq!(map.size_bytes(), 50);
    }

    #[test]
    fn test_clear() {
        let map: ShardedMap = ShardedMap::new();
        for i in 0..10 {
            map.insert(entry("g", &i.to_string(), 8));
        }
        assert_eq!(map.shard_count(), 16);
        map.clear();
        assert_eq!(map.len(), 0);
        assert_eq!(map.size_bytes(), 0);
    }
}
