//! Prometheus Exporter
//!
//! Mirrors [`CacheStats`] snapshots into a private prometheus registry and
//! renders it in the text exposition format.

use prometheus::{Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::CacheStats;
use crate::error::{Error, Result};

const NAMESPACE: &str = "tiercache";

/// Gauges refreshed from manager snapshots.
///
/// Counters are exported as gauges because `reset_stats` may zero them.
pub struct CacheExporter {
    registry: Registry,
    hits: IntGauge,
    misses: IntGauge,
    sets: IntGauge,
    deletes: IntGauge,
    invalidations: IntGauge,
    local_hits: IntGauge,
    durable_hits: IntGauge,
    shared_hits: IntGauge,
    promotions: IntGauge,
    tier_errors: IntGauge,
    local_bytes: IntGauge,
    local_capacity_bytes: IntGauge,
    local_entries: IntGauge,
    local_evictions: IntGauge,
    hit_rate: Gauge,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .map_err(|e| Error::Internal(format!("gauge {}: {}", name, e)))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| Error::Internal(format!("register {}: {}", name, e)))?;
    Ok(gauge)
}

impl CacheExporter {
    /// Create an exporter with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hit_rate = Gauge::with_opts(
            Opts::new("hit_rate", "hits / (hits + misses), 0 before any lookup")
                .namespace(NAMESPACE),
        )
        .map_err(|e| Error::Internal(format!("gauge hit_rate: {}", e)))?;
        registry
            .register(Box::new(hit_rate.clone()))
            .map_err(|e| Error::Internal(format!("register hit_rate: {}", e)))?;

        Ok(Self {
            hits: int_gauge(&registry, "hits", "Lookups served by any tier")?,
            misses: int_gauge(&registry, "misses", "Lookups no tier could serve")?,
            sets: int_gauge(&registry, "sets", "Successful writes")?,
            deletes: int_gauge(&registry, "deletes", "Delete calls")?,
            invalidations: int_gauge(&registry, "invalidations", "Local keys removed by invalidation")?,
            local_hits: int_gauge(&registry, "local_hits", "Hits served by the local tier")?,
            durable_hits: int_gauge(&registry, "durable_hits", "Hits served by the durable tier")?,
            shared_hits: int_gauge(&registry, "shared_hits", "Hits served by the shared tier")?,
            promotions: int_gauge(&registry, "promotions", "Entries copied into faster tiers")?,
            tier_errors: int_gauge(&registry, "tier_errors", "Absorbed tier failures")?,
            local_bytes: int_gauge(&registry, "local_bytes", "Bytes held by the local tier")?,
            local_capacity_bytes: int_gauge(&registry, "local_capacity_bytes", "Local tier byte budget")?,
            local_entries: int_gauge(&registry, "local_entries", "Entries held by the local tier")?,
            local_evictions: int_gauge(&registry, "local_evictions", "Local entries evicted under pressure")?,
            hit_rate,
            registry,
        })
    }

    /// Copy a snapshot into the gauges
    pub fn refresh(&self, stats: &CacheStats) {
        let m = &stats.metrics;
        for (gauge, value) in [
            (&self.hits, m.hits),
            (&self.misses, m.misses),
            (&self.sets, m.sets),
            (&self.deletes, m.deletes),
            (&self.invalidations, m.invalidations),
            (&self.local_hits, m.local_hits),
            (&self.durable_hits, m.durable_hits),
            (&self.shared_hits, m.shared_hits),
            (&self.promotions, m.promotions),
            (&self.tier_errors, m.tier_errors),
            (&self.local_bytes, stats.local_bytes),
            (&self.local_capacity_bytes, stats.local_capacity_bytes),
            (&self.local_entries, stats.local_entries),
            (&self.local_evictions, stats.local_evictions),
        ] {
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
        }
        self.hit_rate.set(m.hit_rate);
    }

    /// Render the registry as Prometheus text
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
