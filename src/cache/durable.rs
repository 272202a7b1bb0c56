//! Durable Tier
//!
//! Persistence-backed key/value store that outlives the process.
//!
//! # Design
//!
//! - Pluggable [`DurableBackend`] (file directory, in-memory for tests)
//! - Storage TTL clamped to [1 minute, 1 week] before reaching the backend
//! - Every call bounded by the tier timeout; a slow store becomes a miss
//! - Keys-per-group secondary index so group invalidation deletes exact keys
//!   instead of scanning the store
//!
//! The index only knows keys written by this process. Keys left over from a
//! previous run are reclaimed by storage TTL, or by the administrative
//! [`DurableCache::delete_by_pattern`] scan. Index entries carry the sequence
//! number of the write that added them; entries found missing from the store
//! (a read miss, or absent after a purge) are dropped unless a newer write
//! re-indexed them meanwhile.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use super::clock::{expiry_after, SharedClock};
use super::key::NormalizedKey;
use crate::error::{Error, Result};

/// Shortest storage TTL handed to a durable backend
pub const MIN_DURABLE_TTL: Duration = Duration::from_secs(60);

/// Longest storage TTL handed to a durable backend
pub const MAX_DURABLE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Clamp a requested TTL into the durable bounds
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_DURABLE_TTL, MAX_DURABLE_TTL)
}

/// Run a backend call under `timeout`, mapping elapsed time to [`Error::TierTimeout`]
pub(crate) async fn bounded<T, F>(tier: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::TierTimeout {
            tier: tier.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Durable storage backend trait
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Get stored bytes, `None` when absent or past storage TTL
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store bytes for `ttl`
    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List every stored key (full scan)
    async fn keys(&self) -> Result<Vec<String>>;

    /// Drop entries past their storage TTL
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Get storage statistics
    fn stats(&self) -> BackendStats;
}

/// Backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Objects currently stored (best known)
    pub object_count: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl OpCounters {
    fn snapshot(&self, object_count: u64) -> BackendStats {
        BackendStats {
            object_count,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory durable backend for tests and ephemeral deployments
pub struct InMemoryDurableBackend {
    storage: DashMap<String, (Bytes, DateTime<Utc>)>,
    clock: SharedClock,
    available: AtomicBool,
    ops: OpCounters,
}

impl InMemoryDurableBackend {
    /// Create a new in-memory backend
    pub fn new(clock: SharedClock) -> Self {
        Self {
            storage: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
            ops: OpCounters::default(),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::tier_unavailable("durable", "backend offline"))
        }
    }
}

#[async_trait]
impl DurableBackend for InMemoryDurableBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        self.ops.reads.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let found = self
            .storage
            .get(key)
            .map(|item| (item.0.clone(), item.1 <= now));
        match found {
            Some((_, true)) => {
                self.storage.remove_if(key, |_, (_, exp)| *exp <= now);
                Ok(None)
            }
            Some((data, false)) => Ok(Some(data)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        let expires_at = expiry_after(self.clock.now(), ttl);
        self.storage.insert(key.to_string(), (data, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.storage.iter().map(|item| item.key().clone()).collect())
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.check_available()?;
        let now = self.clock.now();
        let before = self.storage.len();
        self.storage.retain(|_, (_, exp)| *exp > now);
        Ok(before.saturating_sub(self.storage.len()))
    }

    fn stats(&self) -> BackendStats {
        self.ops.snapshot(self.storage.len() as u64)
    }
}

// =============================================================================
// File backend
// =============================================================================

/// One file per key under a directory.
///
/// File layout: 8-byte big-endian storage expiry (epoch ms) followed by the
/// stored bytes. Writes go to a temporary file that is renamed into place.
pub struct FileDurableBackend {
    dir: PathBuf,
    clock: SharedClock,
    tmp_seq: AtomicU64,
    ops: OpCounters,
}

const FILE_EXT: &str = "bin";
const HEADER_LEN: usize = 8;
const TMP_PREFIX: &str = ".tmp-";

/// Temporary files older than this belong to an abandoned write
const STALE_TMP_AGE: Duration = Duration::from_secs(600);

impl FileDurableBackend {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>, clock: SharedClock) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            clock,
            tmp_seq: AtomicU64::new(0),
            ops: OpCounters::default(),
        })
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ':' separates group and hash in keys; '@' never appears in a normalized key
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.replace(':', "@"), FILE_EXT))
    }

    fn key_for(file_name: &str) -> Option<String> {
        file_name
            .strip_suffix(&format!(".{}", FILE_EXT))
            .map(|stem| stem.replace('@', ":"))
    }

    fn decode(&self, raw: Vec<u8>) -> Result<(DateTime<Utc>, Bytes)> {
        if raw.len() < HEADER_LEN {
            return Err(Error::CorruptEnvelope(format!(
                "durable file of {} bytes has no header",
                raw.len()
            )));
        }
        let mut millis = [0u8; HEADER_LEN];
        millis.copy_from_slice(&raw[..HEADER_LEN]);
        let millis = i64::from_be_bytes(millis);
        let expires_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| Error::CorruptEnvelope(format!("invalid expiry {}", millis)))?;
        let data = Bytes::from(raw).slice(HEADER_LEN..);
        Ok((expires_at, data))
    }

    /// Remove temporary files left by writes that never reached the rename
    async fn remove_stale_tmp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_tmp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TMP_PREFIX))
                .unwrap_or(false);
            if !is_tmp {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            if age.map(|age| age >= STALE_TMP_AGE).unwrap_or(false)
                && Self::remove_file(&entry.path()).await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_file(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DurableBackend for FileDurableBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ops.reads.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (expires_at, data) = match self.decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(path = %path.display(), "Removing unreadable durable entry: {}", e);
                Self::remove_file(&path).await?;
                return Ok(None);
            }
        };

        if expires_at <= self.clock.now() {
            Self::remove_file(&path).await?;
            return Ok(None);
        }
        Ok(Some(data))
    }

    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        self.ops.writes.fetch_add(1, Ordering::Relaxed);
        let expires_at = expiry_after(self.clock.now(), ttl);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
        buf.put_i64(expires_at.timestamp_millis());
        buf.extend_from_slice(&data);

        let path = self.path_for(key);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!("{}{}-{}", TMP_PREFIX, std::process::id(), seq));
        tokio::fs::write(&tmp, &buf).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ops.deletes.fetch_add(1, Ordering::Relaxed);
        Self::remove_file(&self.path_for(key)).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = entry.file_name().to_str().and_then(Self::key_for) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut purged = 0;
        for key in self.keys().await? {
            let path = self.path_for(&key);
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let expired = self
                .decode(raw)
                .map(|(expires_at, _)| expires_at <= now)
                .unwrap_or(true);
            if expired && Self::remove_file(&path).await? {
                purged += 1;
            }
        }

        let stale = self.remove_stale_tmp_files().await?;
        if stale > 0 {
            debug!(dir = %self.dir.display(), stale, "Removed abandoned temporary files");
        }
        Ok(purged)
    }

    fn stats(&self) -> BackendStats {
        let writes = self.ops.writes.load(Ordering::Relaxed);
        let deletes = self.ops.deletes.load(Ordering::Relaxed);
        // object count is not tracked without a directory scan
        self.ops.snapshot(writes.saturating_sub(deletes))
    }
}

// =============================================================================
// Durable tier adapter
// =============================================================================

/// Keys of one group prefix, each with the sequence of its indexing write
type GroupKeys = DashMap<String, u64>;

/// Durable tier: timeouts, TTL clamping and the per-group key index
pub struct DurableCache {
    backend: Arc<dyn DurableBackend>,
    timeout: Duration,
    index: DashMap<String, GroupKeys>,
    write_seq: AtomicU64,
}

impl DurableCache {
    /// Wrap a backend
    pub fn new(backend: Arc<dyn DurableBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            index: DashMap::new(),
            write_seq: AtomicU64::new(0),
        }
    }

    /// Get stored bytes
    pub async fn get(&self, key: &NormalizedKey) -> Result<Option<Bytes>> {
        let seen = self.indexed_seq(key.prefix(), key.as_str());
        let found = bounded("durable", self.timeout, self.backend.get(key.as_str())).await?;
        if found.is_none() {
            if let Some(seq) = seen {
                self.forget_if_unchanged(key.prefix(), key.as_str(), seq);
            }
        }
        Ok(found)
    }

    /// Store bytes; the TTL is clamped to the durable bounds
    pub async fn set(&self, key: &NormalizedKey, data: Bytes, ttl: Duration) -> Result<()> {
        let ttl = clamp_ttl(ttl);
        bounded("durable", self.timeout, self.backend.set(key.as_str(), data, ttl)).await?;
        self.remember_key(key.prefix(), key.as_str().to_string());
        Ok(())
    }

    /// Delete a key
    pub async fn delete(&self, key: &NormalizedKey) -> Result<bool> {
        let seen = self.indexed_seq(key.prefix(), key.as_str());
        let deleted = bounded("durable", self.timeout, self.backend.delete(key.as_str())).await?;
        if let Some(seq) = seen {
            self.forget_if_unchanged(key.prefix(), key.as_str(), seq);
        }
        Ok(deleted)
    }

    fn remember_key(&self, prefix: &str, key: String) {
        let seq = self.write_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.index
            .entry(prefix.to_string())
            .or_default()
            .insert(key, seq);
    }

    fn indexed_seq(&self, prefix: &str, key: &str) -> Option<u64> {
        self.index
            .get(prefix)
            .and_then(|keys| keys.get(key).map(|seq| *seq))
    }

    /// Drop `key` from the index unless it was re-indexed after `seq`
    fn forget_if_unchanged(&self, prefix: &str, key: &str, seq: u64) -> bool {
        self.index
            .get(prefix)
            .map(|keys| keys.remove_if(key, |_, current| *current == seq).is_some())
            .unwrap_or(false)
    }

    /// Delete every indexed key of a group prefix, returning how many existed.
    ///
    /// Keys whose deletion fails stay indexed so a later invalidation retries them.
    pub async fn delete_by_prefix(&self, prefix: &str) -> usize {
        let Some((_, keys)) = self.index.remove(prefix) else {
            return 0;
        };

        let mut deleted = 0;
        let mut retry = Vec::new();
        for (key, _) in keys.into_iter() {
            match bounded("durable", self.timeout, self.backend.delete(&key)).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, "Durable delete failed during invalidation: {}", e);
                    retry.push(key);
                }
            }
        }

        for key in retry {
            self.remember_key(prefix, key);
        }
        deleted
    }

    /// Delete every stored key matching a glob `pattern` (`*` wildcard).
    ///
    /// Scans the whole backend: administrative use only.
    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<usize> {
        let matcher = glob_to_regex(pattern)?;
        let keys = self.backend.keys().await?;

        let mut deleted = 0;
        for key in keys.iter().filter(|k| matcher.is_match(k)) {
            match bounded("durable", self.timeout, self.backend.delete(key)).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %key, "Durable delete failed during pattern scan: {}", e),
            }
            let stored = NormalizedKey::from_normalized(key.as_str());
            if let Some(indexed) = self.index.get(stored.prefix()) {
                indexed.remove(key.as_str());
            }
            self.index.remove_if(stored.prefix(), |_, keys| keys.is_empty());
        }
        debug!(pattern, scanned = keys.len(), deleted, "Durable pattern delete");
        Ok(deleted)
    }

    /// Drop entries past their storage TTL, then prune index entries whose
    /// keys the backend no longer holds
    pub async fn purge_expired(&self) -> Result<usize> {
        let purged = self.backend.purge_expired().await?;
        let pruned = self.prune_index().await?;
        debug!(purged, pruned, "Durable purge complete");
        Ok(purged)
    }

    async fn prune_index(&self) -> Result<usize> {
        if self.index.is_empty() {
            return Ok(0);
        }

        // taken before the scan so keys indexed during it are left alone
        let indexed: Vec<(String, String, u64)> = self
            .index
            .iter()
            .flat_map(|group| {
                let prefix = group.key().clone();
                group
                    .value()
                    .iter()
                    .map(|entry| (prefix.clone(), entry.key().clone(), *entry.value()))
                    .collect::<Vec<_>>()
            })
            .collect();
        let live: HashSet<String> = self.backend.keys().await?.into_iter().collect();

        let mut pruned = 0;
        for (prefix, key, seq) in indexed {
            if !live.contains(&key) && self.forget_if_unchanged(&prefix, &key, seq) {
                pruned += 1;
            }
        }
        self.index.retain(|_, keys| !keys.is_empty());
        Ok(pruned)
    }

    /// Number of keys tracked for `prefix`
    pub fn indexed_keys(&self, prefix: &str) -> usize {
        self.index.get(prefix).map(|keys| keys.len()).unwrap_or(0)
    }

    /// Number of keys tracked across every group
    pub fn indexed_total(&self) -> usize {
        self.index.iter().map(|keys| keys.len()).sum()
    }

    /// Backend statistics
    pub fn backend_stats(&self) -> BackendStats {
        self.backend.stats()
    }

    /// Call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Compile a `*`-glob into an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    if pattern.is_empty() {
        return Err(Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "empty pattern".to_string(),
        });
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body)).map_err(|e| Error::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
