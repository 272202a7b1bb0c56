//! Cache Warming
//!
//! Strategies registered per group pre-populate the cache on a schedule.
//! Only groups whose policy has `warm` set are run. Every strategy runs in
//! its own task, so an error or a panic in one never affects the others.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info};

use super::manager::CacheManager;

/// Populates one group
#[async_trait]
pub trait WarmingStrategy: Send + Sync {
    async fn warm(&self, cache: Arc<CacheManager>) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`WarmingStrategy`]
pub struct FnStrategy<F>(F);

impl<F> FnStrategy<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> WarmingStrategy for FnStrategy<F>
where
    F: Fn(Arc<CacheManager>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn warm(&self, cache: Arc<CacheManager>) -> anyhow::Result<()> {
        (self.0)(cache).await
    }
}

/// Outcome of one warming run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmingReport {
    /// Groups whose strategy completed
    pub warmed: Vec<String>,
    /// Groups whose strategy failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Groups with a strategy but no `warm` flag
    pub skipped: Vec<String>,
}

/// Holds strategies and runs them against a manager
pub struct WarmingScheduler {
    cache: Arc<CacheManager>,
    strategies: RwLock<BTreeMap<String, Arc<dyn WarmingStrategy>>>,
}

impl WarmingScheduler {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            cache,
            strategies: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register (or replace) the strategy of `group`
    pub fn register_strategy(&self, group: impl Into<String>, strategy: Arc<dyn WarmingStrategy>) {
        let group = group.into();
        debug!(group = %group, "Warming strategy registered");
        self.strategies.write().insert(group, strategy);
    }

    /// Register an async closure as the strategy of `group`
    pub fn register_fn<F, Fut>(&self, group: impl Into<String>, f: F)
    where
        F: Fn(Arc<CacheManager>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_strategy(group, Arc::new(FnStrategy::new(f)));
    }

    /// Groups with a registered strategy
    pub fn groups(&self) -> Vec<String> {
        self.strategies.read().keys().cloned().collect()
    }

    /// Run every strategy whose group is flagged `warm`
    pub async fn run_warming(&self) -> WarmingReport {
        let started = Instant::now();
        let mut report = WarmingReport::default();

        let strategies: Vec<(String, Arc<dyn WarmingStrategy>)> = self
            .strategies
            .read()
            .iter()
            .map(|(group, strategy)| (group.clone(), strategy.clone()))
            .collect();

        let mut handles = Vec::new();
        let mut groups = Vec::new();
        for (group, strategy) in strategies {
            if !self.cache.registry().resolve(&group).warm {
                report.skipped.push(group);
                continue;
            }
            let cache = self.cache.clone();
            handles.push(tokio::spawn(async move { strategy.warm(cache).await }));
            groups.push(group);
        }

        for (group, joined) in groups.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(())) => report.warmed.push(group),
                Ok(Err(e)) => {
                    error!(group = %group, "Warming strategy failed: {:#}", e);
                    report.failed.push((group, e.to_string()));
                }
                Err(e) => {
                    error!(group = %group, "Warming strategy panicked: {}", e);
                    report.failed.push((group, "strategy panicked".to_string()));
                }
            }
        }

        info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cache warming complete"
        );
        report
    }
}
