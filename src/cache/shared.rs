//! Shared Tier
//!
//! Networked cache visible to every process of a deployment. The crate ships
//! an in-process backend; real deployments plug their own client in through
//! [`SharedBackend`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::clock::{expiry_after, SharedClock};
use super::durable::{bounded, clamp_ttl, BackendStats};
use super::key::NormalizedKey;
use crate::error::{Error, Result};

/// Shared cache backend trait
#[async_trait]
pub trait SharedBackend: Send + Sync {
    /// Get stored bytes
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store bytes for `ttl`
    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Drop every key starting with `prefix`.
    ///
    /// `Ok(None)` means the backend cannot address keys by prefix.
    async fn flush_group(&self, _prefix: &str) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Get statistics
    fn stats(&self) -> BackendStats;
}

/// In-process shared backend.
///
/// Clone the `Arc` into several managers to simulate processes sharing one
/// store.
pub struct InMemorySharedBackend {
    storage: DashMap<String, (Bytes, DateTime<Utc>)>,
    clock: SharedClock,
    online: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemorySharedBackend {
    /// Create a new backend
    pub fn new(clock: SharedClock) -> Self {
        Self {
            storage: DashMap::new(),
            clock,
            online: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Number of stored keys, expired ones included
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::tier_unavailable("shared", "connection refused"))
        }
    }
}

#[async_trait]
impl SharedBackend for InMemorySharedBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_online()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let hit = self
            .storage
            .get(key)
            .filter(|item| item.1 > now)
            .map(|item| item.0.clone());
        if hit.is_none() {
            self.storage.remove_if(key, |_, (_, exp)| *exp <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        self.ensure_online()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let expires_at = expiry_after(self.clock.now(), ttl);
        self.storage.insert(key.to_string(), (data, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_online()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn flush_group(&self, prefix: &str) -> Result<Option<usize>> {
        self.ensure_online()?;
        let before = self.storage.len();
        self.storage.retain(|key, _| !key.starts_with(prefix));
        Ok(Some(before.saturating_sub(self.storage.len())))
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            object_count: self.storage.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Shared tier adapter: bounds every call by the tier timeout
pub struct SharedCache {
    backend: Arc<dyn SharedBackend>,
    timeout: Duration,
}

impl SharedCache {
    /// Wrap a backend
    pub fn new(backend: Arc<dyn SharedBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Get stored bytes
    pub async fn get(&self, key: &NormalizedKey) -> Result<Option<Bytes>> {
        bounded("shared", self.timeout, self.backend.get(key.as_str())).await
    }

    /// Store bytes; the TTL is clamped to the durable bounds
    pub async fn set(&self, key: &NormalizedKey, data: Bytes, ttl: Duration) -> Result<()> {
        bounded(
            "shared",
            self.timeout,
            self.backend.set(key.as_str(), data, clamp_ttl(ttl)),
        )
        .await
    }

    /// Delete a key
    pub async fn delete(&self, key: &NormalizedKey) -> Result<bool> {
        bounded("shared", self.timeout, self.backend.delete(key.as_str())).await
    }

    /// Flush a group prefix where supported
    pub async fn flush_group(&self, prefix: &str) -> Result<Option<usize>> {
        bounded("shared", self.timeout, self.backend.flush_group(prefix)).await
    }

    /// Backend statistics
    pub fn backend_stats(&self) -> BackendStats {
        self.backend.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    struct NoFlushBackend;

    #[async_trait]
    impl SharedBackend for NoFlushBackend {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _data: Bytes, _ttl: Duration) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        fn stats(&self) -> BackendStats {
            BackendStats::default()
        }
    }

    fn shared() -> (SharedCache, Arc<InMemorySharedBackend>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let backend = Arc::new(InMemorySharedBackend::new(clock.clone()));
        (
            SharedCache::new(backend.clone(), Duration::from_millis(100)),
            backend,
            clock,
        )
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (cache, _, _) = shared();
        let key = NormalizedKey::new("user_sessions", "abc");
        cache.set(&key, Bytes::from_static(b"s"), Duration::from_secs(900)).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().unwrap().as_ref(), b"s");
        assert!(cache.delete(&key).await.unwrap());
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_expiry() {
        let (cache, backend, clock) = shared();
        let key = NormalizedKey::new("g", "k");
        cache.set(&key, Bytes::from_static(b"s"), Duration::from_secs(90)).await.unwrap();
        clock.advance(Duration::from_secs(91));
        assert!(cache.get(&key).await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_flush_group() {
        let (cache, backend, _) = shared();
        for i in 0..3 {
            let k = NormalizedKey::new("a", &i.to_string());
            cache.set(&k, Bytes::from_static(b"1"), Duration::from_secs(600)).await.unwrap();
        }
        let other = NormalizedKey::new("b", "0");
        cache.set(&other, Bytes::from_static(b"1"), Duration::from_secs(600)).await.unwrap();

        assert_eq!(cache.flush_group("a:").await.unwrap(), Some(3));
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_unsupported() {
        let cache = SharedCache::new(Arc::new(NoFlushBackend), Duration::from_millis(100));
        assert_eq!(cache.flush_group("a:").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_offline() {
        let (cache, backend, _) = shared();
        backend.set_online(false);
        let key = NormalizedKey::new("g", "k");
        assert!(cache.get(&key).await.unwrap_err().is_tier_failure());
        assert!(cache
            .set(&key, Bytes::from_static(b"x"), Duration::from_secs(60))
            .await
            .is_err());

        backend.set_online(true);
        assert!(cache.get(&key).await.unwrap().is_none());
    }
}
