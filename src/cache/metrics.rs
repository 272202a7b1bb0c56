//! Cache Metrics
//!
//! Lock-free counters embedded in the manager and the snapshot they produce.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::group::CacheTier;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    invalidations: AtomicU64,

    // per-tier hits, indexed like CacheTier::ALL
    tier_hits: [AtomicU64; 3],
    promotions: AtomicU64,
    tier_errors: AtomicU64,
}

fn tier_index(tier: CacheTier) -> usize {
    match tier {
        CacheTier::Local => 0,
        CacheTier::Durable => 1,
        CacheTier::Shared => 2,
    }
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: CacheTier) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.tier_hits[tier_index(tier)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, removed: u64) {
        self.invalidations.fetch_add(removed, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_error(&self) {
        self.tier_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits served by `tier`
    pub fn tier_hits(&self, tier: CacheTier) -> u64 {
        self.tier_hits[tier_index(tier)].load(Ordering::Relaxed)
    }

    /// hits / (hits + misses), 0 before any lookup
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits(), self.misses())
    }

    /// Take a snapshot of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits();
        let misses = self.misses();
        MetricsSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
            local_hits: self.tier_hits(CacheTier::Local),
            durable_hits: self.tier_hits(CacheTier::Durable),
            shared_hits: self.tier_hits(CacheTier::Shared),
            promotions: self.promotions.load(Ordering::Relaxed),
            tier_errors: self.tier_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.invalidations,
            &self.promotions,
            &self.tier_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.tier_hits {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
    pub local_hits: u64,
    pub durable_hits: u64,
    pub shared_hits: u64,
    pub promotions: u64,
    pub tier_errors: u64,
}

/// Manager statistics: counters plus local tier occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub local_bytes: u64,
    pub local_capacity_bytes: u64,
    pub local_entries: u64,
    pub local_evictions: u64,
    pub local_expirations: u64,
}

impl CacheStats {
    /// hits / (hits + misses)
    pub fn hit_rate(&self) -> f64 {
        self.metrics.hit_rate
    }
}
