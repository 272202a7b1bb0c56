//! Cache Manager - Group-Policy Multi-Tier Cache
//!
//! Coordinates the local memory, durable and shared tiers per group policy:
//! tier-ordered lookup with promotion into faster tiers, fan-out writes,
//! cache-aside `remember`, and group/tag invalidation.
//!
//! A lookup snapshots the key's local write generation before reading any
//! tier. Promotion only copies the hit into faster tiers while that
//! generation is unchanged, so a value replaced or removed by a `set`,
//! `delete` or `invalidate` that finished during the lookup is never
//! written back. Writes, deletes and invalidations therefore update the
//! slower tiers first and the local tier last: a lookup that snapshots after
//! the local update already finds the new state below it.
//!
//! Tier errors never reach callers. They are logged at `warn`, counted, and
//! treated as a miss (reads) or a per-tier failure (writes).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::clock::{expiry_after, remaining, system_clock, SharedClock};
use super::compression::PayloadCompressor;
use super::durable::{DurableBackend, DurableCache, FileDurableBackend, InMemoryDurableBackend};
use super::entry::Envelope;
use super::group::{CacheGroupPolicy, CacheTier, GroupRegistry, GroupRegistryBuilder};
use super::key::{group_prefix, NormalizedKey};
use super::local::{LocalConfig, LocalMemoryCache, WriteGeneration};
use super::metrics::{CacheMetrics, CacheStats};
use super::shared::{InMemorySharedBackend, SharedBackend, SharedCache};
use crate::config::{CacheSettings, DEFAULT_TIER_TIMEOUT};
use crate::error::Result;

/// Result of writing one tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    /// Value stored
    Stored,
    /// Tier refused the value (larger than the local budget)
    Rejected,
    /// Backing store failed or timed out
    Failed(String),
}

/// Per-tier outcome of a `set`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetReport {
    outcomes: Vec<(CacheTier, TierOutcome)>,
}

impl SetReport {
    fn record(&mut self, tier: CacheTier, outcome: TierOutcome) {
        self.outcomes.push((tier, outcome));
        self.outcomes.sort_by_key(|(tier, _)| *tier);
    }

    /// At least one enabled tier stored the value
    pub fn succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, outcome)| *outcome == TierOutcome::Stored)
    }

    /// Every enabled tier stored the value
    pub fn all_succeeded(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .iter()
                .all(|(_, outcome)| *outcome == TierOutcome::Stored)
    }

    /// Outcome for `tier`, `None` when the tier was not written
    pub fn outcome(&self, tier: CacheTier) -> Option<&TierOutcome> {
        self.outcomes
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, outcome)| outcome)
    }

    /// Tiers whose write failed
    pub fn failed_tiers(&self) -> Vec<CacheTier> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TierOutcome::Failed(_)))
            .map(|(tier, _)| *tier)
            .collect()
    }

    /// All outcomes in tier order
    pub fn outcomes(&self) -> &[(CacheTier, TierOutcome)] {
        &self.outcomes
    }
}

/// Builder for [`CacheManager`]
pub struct CacheManagerBuilder {
    registry: GroupRegistry,
    clock: SharedClock,
    local: LocalConfig,
    durable: Option<Arc<dyn DurableBackend>>,
    shared: Option<Arc<dyn SharedBackend>>,
    tier_timeout: Duration,
    compressor: PayloadCompressor,
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        Self {
            registry: GroupRegistry::with_defaults(),
            clock: system_clock(),
            local: LocalConfig::default(),
            durable: None,
            shared: None,
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            compressor: PayloadCompressor::new(),
        }
    }
}

impl CacheManagerBuilder {
    pub fn registry(mut self, registry: GroupRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn local_config(mut self, config: LocalConfig) -> Self {
        self.local = config;
        self
    }

    /// Enable the durable tier
    pub fn durable(mut self, backend: Arc<dyn DurableBackend>) -> Self {
        self.durable = Some(backend);
        self
    }

    /// Enable the shared tier
    pub fn shared(mut self, backend: Arc<dyn SharedBackend>) -> Self {
        self.shared = Some(backend);
        self
    }

    /// Timeout for every durable and shared call
    pub fn tier_timeout(mut self, timeout: Duration) -> Self {
        self.tier_timeout = timeout;
        self
    }

    pub fn compressor(mut self, compressor: PayloadCompressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn build(self) -> CacheManager {
        let timeout = self.tier_timeout;
        CacheManager {
            local: LocalMemoryCache::new(self.local, self.clock.clone()),
            durable: self.durable.map(|b| DurableCache::new(b, timeout)),
            shared: self.shared.map(|b| SharedCache::new(b, timeout)),
            registry: self.registry,
            compressor: self.compressor,
            metrics: Arc::new(CacheMetrics::new()),
            clock: self.clock,
        }
    }
}

/// Multi-tier cache manager.
///
/// Construct once at startup and share through `Arc`.
pub struct CacheManager {
    registry: GroupRegistry,
    local: LocalMemoryCache,
    durable: Option<DurableCache>,
    shared: Option<SharedCache>,
    compressor: PayloadCompressor,
    metrics: Arc<CacheMetrics>,
    clock: SharedClock,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    /// All three tiers in memory, built-in groups, system clock
    pub fn in_memory() -> Self {
        let clock = system_clock();
        Self::builder()
            .durable(Arc::new(InMemoryDurableBackend::new(clock.clone())))
            .shared(Arc::new(InMemorySharedBackend::new(clock.clone())))
            .clock(clock)
            .build()
    }

    /// Build from a settings file.
    ///
    /// The durable tier is file-backed when `durable_dir` is set and disabled
    /// otherwise; the shared tier is the in-process backend when enabled.
    pub async fn from_settings(settings: &CacheSettings, clock: SharedClock) -> Result<Self> {
        let registry = GroupRegistryBuilder::with_defaults()
            .apply_overrides(&settings.groups)?
            .build();

        let mut builder = Self::builder()
            .registry(registry)
            .clock(clock.clone())
            .local_config(LocalConfig {
                memory_budget: settings.memory_budget(),
            })
            .tier_timeout(settings.tier_timeout()?);

        if let Some(dir) = &settings.durable_dir {
            let backend = FileDurableBackend::open(dir.clone(), clock.clone()).await?;
            info!(dir = %dir.display(), "Durable tier enabled");
            builder = builder.durable(Arc::new(backend));
        }
        if settings.shared_tier.unwrap_or(false) {
            info!("Shared tier enabled (in-process backend)");
            builder = builder.shared(Arc::new(InMemorySharedBackend::new(clock)));
        }
        Ok(builder.build())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Get a value, deserializing the cached JSON payload
    pub async fn get<T: DeserializeOwned>(&self, key: &str, group: &str) -> Option<T> {
        let payload = self.get_bytes(key, group).await?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, group, "Cached payload does not deserialize: {}", e);
                None
            }
        }
    }

    /// Get the raw payload
    #[instrument(skip(self), level = "debug")]
    pub async fn get_bytes(&self, key: &str, group: &str) -> Option<Bytes> {
        let policy = self.registry.resolve(group);
        let key = NormalizedKey::new(group, key);
        let mut seen = self.local.generation(&key);

        for tier in policy.tiers.iter() {
            let Some(raw) = self.read_tier(tier, &key).await else {
                continue;
            };

            let envelope = match Envelope::decode(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(key = %key, %tier, "Dropping unreadable entry: {}", e);
                    self.discard(tier, &key, &mut seen).await;
                    continue;
                }
            };

            if envelope.is_expired(self.clock.now()) {
                self.discard(tier, &key, &mut seen).await;
                continue;
            }

            let payload = match self
                .compressor
                .decompress(&envelope.body, envelope.algorithm)
            {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(key = %key, %tier, "Dropping entry that fails to decompress: {}", e);
                    self.discard(tier, &key, &mut seen).await;
                    continue;
                }
            };

            self.metrics.record_hit(tier);
            self.promote(policy, tier, &key, raw, envelope.expires_at, seen)
                .await;
            return Some(payload);
        }

        self.metrics.record_miss();
        None
    }

    async fn read_tier(&self, tier: CacheTier, key: &NormalizedKey) -> Option<Bytes> {
        let result = match tier {
            CacheTier::Local => return self.local.get(key).map(|e| e.payload().clone()),
            CacheTier::Durable => match &self.durable {
                Some(durable) => durable.get(key).await,
                None => return None,
            },
            CacheTier::Shared => match &self.shared {
                Some(shared) => shared.get(key).await,
                None => return None,
            },
        };
        match result {
            Ok(found) => found,
            Err(e) => {
                self.metrics.record_tier_error();
                warn!(key = %key, %tier, "Tier read failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Drop an unusable entry found during a lookup
    async fn discard(&self, tier: CacheTier, key: &NormalizedKey, seen: &mut WriteGeneration) {
        if tier == CacheTier::Local {
            self.local.delete(key);
            // lower tiers are only read after this snapshot
            *seen = self.local.generation(key);
            return;
        }
        // a newer write may already have replaced the bytes that were read
        if self.local.generation(key) == *seen {
            self.remove_from(tier, key).await;
        }
    }

    /// Copy a hit into every faster enabled tier, unless `key` was written
    /// after `seen` was taken
    async fn promote(
        &self,
        policy: &CacheGroupPolicy,
        hit: CacheTier,
        key: &NormalizedKey,
        raw: Bytes,
        expires_at: DateTime<Utc>,
        seen: WriteGeneration,
    ) {
        for tier in policy.tiers.iter().take_while(|t| *t != hit) {
            let Some(ttl) = remaining(self.clock.now(), expires_at) else {
                return;
            };
            let outcome = match tier {
                CacheTier::Local => {
                    match self
                        .local
                        .set_if_unchanged(key.clone(), raw.clone(), expires_at, seen)
                    {
                        Some(true) => TierOutcome::Stored,
                        Some(false) => TierOutcome::Rejected,
                        None => {
                            debug!(key = %key, "Key written during lookup, promotion skipped");
                            return;
                        }
                    }
                }
                _ if self.local.generation(key) != seen => {
                    debug!(key = %key, "Key written during lookup, promotion skipped");
                    return;
                }
                _ => self.write_tier(tier, key, raw.clone(), expires_at, ttl).await,
            };
            if outcome == TierOutcome::Stored {
                self.metrics.record_promotion();
                debug!(key = %key, from = %hit, to = %tier, "Promoted entry");
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value as JSON; `true` when at least one enabled tier stored it
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        group: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_with_report(key, group, value, ttl).await.succeeded()
    }

    /// Store a value as JSON and report every tier's outcome
    pub async fn set_with_report<T: Serialize + ?Sized>(
        &self,
        key: &str,
        group: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> SetReport {
        match serde_json::to_vec(value) {
            Ok(payload) => self.set_bytes_with_report(key, group, Bytes::from(payload), ttl).await,
            Err(e) => {
                warn!(key, group, "Value does not serialize, not cached: {}", e);
                SetReport::default()
            }
        }
    }

    /// Store a raw payload
    pub async fn set_bytes(
        &self,
        key: &str,
        group: &str,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_bytes_with_report(key, group, payload, ttl)
            .await
            .succeeded()
    }

    /// Store a raw payload and report every tier's outcome.
    ///
    /// A zero `ttl` falls back to the group TTL.
    #[instrument(skip(self, payload), fields(size = payload.len()), level = "debug")]
    pub async fn set_bytes_with_report(
        &self,
        key: &str,
        group: &str,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> SetReport {
        let policy = self.registry.resolve(group);
        let key = NormalizedKey::new(group, key);
        let ttl = ttl.filter(|t| !t.is_zero()).unwrap_or(policy.ttl);
        let expires_at = expiry_after(self.clock.now(), ttl);

        let (body, algorithm) = self.compressor.compress(&payload, policy.compress);
        let raw = Envelope::new(algorithm, expires_at, body).encode();

        let mut report = SetReport::default();
        for tier in slowest_first(policy) {
            if !self.tier_enabled(tier) {
                continue;
            }
            let outcome = self.write_tier(tier, &key, raw.clone(), expires_at, ttl).await;
            report.record(tier, outcome);
        }
        if !policy.tiers.contains(CacheTier::Local) {
            self.local.touch(&key);
        }

        if report.succeeded() {
            self.metrics.record_set();
        } else {
            warn!(key = %key, group, "No tier stored the value");
        }
        report
    }

    async fn write_tier(
        &self,
        tier: CacheTier,
        key: &NormalizedKey,
        raw: Bytes,
        expires_at: DateTime<Utc>,
        ttl: Duration,
    ) -> TierOutcome {
        let result = match tier {
            CacheTier::Local => {
                if self.local.set(key.clone(), raw, expires_at) {
                    return TierOutcome::Stored;
                }
                // an older value must not outlive a rejected overwrite
                self.local.delete(key);
                return TierOutcome::Rejected;
            }
            CacheTier::Durable => match &self.durable {
                Some(durable) => durable.set(key, raw, ttl).await,
                None => return TierOutcome::Rejected,
            },
            CacheTier::Shared => match &self.shared {
                Some(shared) => shared.set(key, raw, ttl).await,
                None => return TierOutcome::Rejected,
            },
        };

        match result {
            Ok(()) => TierOutcome::Stored,
            Err(e) => {
                self.metrics.record_tier_error();
                warn!(key = %key, %tier, "Tier write failed: {}", e);
                TierOutcome::Failed(e.to_string())
            }
        }
    }

    /// Remove a key from every enabled tier; `false` when a tier failed
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str, group: &str) -> bool {
        let policy = self.registry.resolve(group);
        let key = NormalizedKey::new(group, key);

        let mut ok = true;
        for tier in slowest_first(policy) {
            ok &= self.remove_from(tier, &key).await;
        }
        if !policy.tiers.contains(CacheTier::Local) {
            self.local.touch(&key);
        }
        self.metrics.record_delete();
        ok
    }

    async fn remove_from(&self, tier: CacheTier, key: &NormalizedKey) -> bool {
        let result = match tier {
            CacheTier::Local => {
                self.local.delete(key);
                return true;
            }
            CacheTier::Durable => match &self.durable {
                Some(durable) => durable.delete(key).await,
                None => return true,
            },
            CacheTier::Shared => match &self.shared {
                Some(shared) => shared.delete(key).await,
                None => return true,
            },
        };
        match result {
            Ok(_) => true,
            Err(e) => {
                self.metrics.record_tier_error();
                warn!(key = %key, %tier, "Tier delete failed: {}", e);
                false
            }
        }
    }

    // =========================================================================
    // Cache-aside
    // =========================================================================

    /// Return the cached value, or run `producer` once and cache its result.
    ///
    /// `Ok(None)` from the producer means "no value": nothing is cached.
    /// Producer errors are returned unchanged and nothing is cached.
    #[instrument(skip(self, producer), level = "debug")]
    pub async fn remember<T, F, Fut, E>(
        &self,
        key: &str,
        group: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> std::result::Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
    {
        if let Some(value) = self.get::<T>(key, group).await {
            return Ok(Some(value));
        }

        let produced = producer().await?;
        if let Some(value) = &produced {
            self.set(key, group, value, ttl).await;
        }
        Ok(produced)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Invalidate a group, or every group carrying a tag.
    ///
    /// Returns the number of keys removed from the local tier. Durable keys
    /// written by this process are deleted through the group index; the shared
    /// tier is flushed when the backend supports it.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, selector: &str, by_tag: bool) -> usize {
        let groups: Vec<String> = if by_tag {
            self.registry
                .groups_with_tags(&[selector])
                .into_iter()
                .map(str::to_string)
                .collect()
        } else {
            vec![selector.to_string()]
        };

        let mut removed = 0;
        for group in &groups {
            removed += self.invalidate_group(group).await;
        }

        self.metrics.record_invalidations(removed as u64);
        info!(selector, by_tag, groups = groups.len(), removed, "Cache invalidated");
        removed
    }

    async fn invalidate_group(&self, group: &str) -> usize {
        let prefix = group_prefix(group);

        if let Some(durable) = &self.durable {
            let deleted = durable.delete_by_prefix(&prefix).await;
            debug!(group, deleted, "Durable group entries deleted");
        }

        if let Some(shared) = &self.shared {
            match shared.flush_group(&prefix).await {
                Ok(Some(flushed)) => debug!(group, flushed, "Shared group flushed"),
                Ok(None) => debug!(group, "Shared backend has no group flush"),
                Err(e) => {
                    self.metrics.record_tier_error();
                    warn!(group, "Shared group flush failed: {}", e);
                }
            }
        }

        self.local.delete_by_prefix(&prefix)
    }

    /// Delete every durable key matching a `*` glob over normalized keys.
    ///
    /// Full backend scan, for administrative use.
    #[instrument(skip(self))]
    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<usize> {
        match &self.durable {
            Some(durable) => durable.delete_by_pattern(pattern).await,
            None => Ok(0),
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove expired local entries
    pub fn sweep_expired(&self) -> usize {
        let removed = self.local.sweep_expired();
        debug!(removed, "Local sweep complete");
        removed
    }

    /// Drop durable entries past their storage TTL
    pub async fn purge_durable(&self) -> usize {
        let Some(durable) = &self.durable else {
            return 0;
        };
        match durable.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                self.metrics.record_tier_error();
                warn!("Durable purge failed: {}", e);
                0
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Counters, hit rate and local tier occupancy
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            metrics: self.metrics.snapshot(),
            local_bytes: self.local.size(),
            local_capacity_bytes: self.local.capacity(),
            local_entries: self.local.len() as u64,
            local_evictions: self.local.evictions(),
            local_expirations: self.local.expirations(),
        }
    }

    /// Zero the counters
    pub fn reset_stats(&self) {
        self.metrics.reset();
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn local(&self) -> &LocalMemoryCache {
        &self.local
    }

    pub fn durable(&self) -> Option<&DurableCache> {
        self.durable.as_ref()
    }

    pub fn shared(&self) -> Option<&SharedCache> {
        self.shared.as_ref()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Whether `tier` has a backend
    pub fn tier_enabled(&self, tier: CacheTier) -> bool {
        match tier {
            CacheTier::Local => true,
            CacheTier::Durable => self.durable.is_some(),
            CacheTier::Shared => self.shared.is_some(),
        }
    }
}

/// Enabled tiers of `policy`, slowest first
fn slowest_first(policy: &CacheGroupPolicy) -> Vec<CacheTier> {
    let mut tiers: Vec<CacheTier> = policy.tiers.iter().collect();
    tiers.reverse();
    tiers
}

// =============================================================================
// Tests
// =============================================================================
