//! Background Maintenance
//!
//! Periodic warming and expiry sweeping for a [`CacheManager`], stopped
//! through a [`CancellationToken`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::manager::CacheManager;
use super::warming::WarmingScheduler;
use crate::config::{DEFAULT_SWEEP_INTERVAL, DEFAULT_WARM_INTERVAL};

/// Maintenance cadence
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Time between warming runs
    pub warm_interval: Duration,
    /// Time between expiry sweeps
    pub sweep_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            warm_interval: DEFAULT_WARM_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Entries removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub local_expired: usize,
    pub durable_purged: usize,
}

/// Runs warming and sweeping on their own intervals
pub struct Maintenance {
    cache: Arc<CacheManager>,
    warming: Arc<WarmingScheduler>,
    config: MaintenanceConfig,
    shutdown: CancellationToken,
}

impl Maintenance {
    pub fn new(
        cache: Arc<CacheManager>,
        warming: Arc<WarmingScheduler>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            cache,
            warming,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`run`](Maintenance::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Loop until cancelled. Both tasks also run once at startup.
    pub async fn run(self: Arc<Self>) {
        info!(
            warm_interval_secs = self.config.warm_interval.as_secs(),
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Starting cache maintenance"
        );

        let mut warm_tick = interval(self.config.warm_interval);
        warm_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = interval(self.config.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Cache maintenance shutting down");
                    break;
                }

                _ = warm_tick.tick() => {
                    self.warming.run_warming().await;
                }

                _ = sweep_tick.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Remove expired local entries and purge the durable store
    pub async fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            local_expired: self.cache.sweep_expired(),
            durable_purged: self.cache.purge_durable().await,
        };
        debug!(
            local_expired = report.local_expired,
            durable_purged = report.durable_purged,
            "Expiry sweep complete"
        );
        report
    }
}
