//! Health Checks
//!
//! Per-tier probes behind `/healthz` and `/readyz`.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheManager, CacheTier, NormalizedKey};
use crate::error::Error;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Tier answering normally
    Healthy,
    /// Tier slow, or cache running with a tier down
    Degraded,
    /// Tier failing
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Probe result of one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCheck {
    pub tier: CacheTier,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Probe results of every enabled tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Healthy only when every tier is; a failing tier degrades the cache
    /// but never makes it unusable
    pub status: HealthStatus,
    pub tiers: Vec<TierCheck>,
}

/// Probes the tiers of a manager
pub struct TierHealth {
    cache: Arc<CacheManager>,
    probe_key: NormalizedKey,
}

impl TierHealth {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            cache,
            probe_key: NormalizedKey::new("__health", "probe"),
        }
    }

    /// Probe every enabled tier, each bounded by the tier timeout
    pub async fn check(&self) -> HealthReport {
        let mut tiers = vec![self.check_local()];
        if let Some(durable) = self.cache.durable() {
            let started = Instant::now();
            let result = durable.get(&self.probe_key).await.map(|_| ());
            tiers.push(Self::classify(CacheTier::Durable, result, started));
        }
        if let Some(shared) = self.cache.shared() {
            let started = Instant::now();
            let result = shared.get(&self.probe_key).await.map(|_| ());
            tiers.push(Self::classify(CacheTier::Shared, result, started));
        }

        let status = if tiers.iter().all(|t| t.status.is_healthy()) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthReport { status, tiers }
    }

    fn check_local(&self) -> TierCheck {
        let local = self.cache.local();
        TierCheck {
            tier: CacheTier::Local,
            status: HealthStatus::Healthy,
            message: Some(format!(
                "{} entries, {}/{} bytes",
                local.len(),
                local.size(),
                local.capacity()
            )),
            duration_ms: 0,
        }
    }

    fn classify(tier: CacheTier, result: crate::error::Result<()>, started: Instant) -> TierCheck {
        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, message) = match result {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e @ Error::TierTimeout { .. }) => (HealthStatus::Degraded, Some(e.to_string())),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };
        TierCheck {
            tier,
            status,
            message,
            duration_ms,
        }
    }
}
