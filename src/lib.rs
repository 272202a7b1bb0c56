//! tiercache - Group-Policy Multi-Tier Cache
//!
//! Caches opaque serializable values across a process-local memory tier, a
//! durable tier and an optional shared tier, with per-group policy (TTL,
//! enabled tiers, compression, warming, invalidation tags).
//!
//! # Architecture
//!
//! ```text
//! caller → CacheManager → [local → durable → shared]
//!               ↑ GroupRegistry (policy per group)
//!               ↑ WarmingScheduler / Maintenance (background)
//! ```
//!
//! The cache is a pure optimisation: tier failures are logged and absorbed,
//! and a fully degraded cache behaves like an always-cold one.
//!
//! # Modules
//!
//! - [`cache`] - Tiers, group policy, manager, warming and maintenance
//! - [`config`] - YAML settings and duration parsing
//! - [`error`] - Error types
//! - [`monitoring`] - Prometheus export and tier health
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiercache::cache::CacheManager;
//!
//! # async fn demo() {
//! let cache = Arc::new(CacheManager::in_memory());
//! cache.set("site_name", "settings", &"tiercache", None).await;
//! let name: Option<String> = cache.get("site_name", "settings").await;
//! assert_eq!(name.as_deref(), Some("tiercache"));
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{CacheGroupPolicy, CacheManager, CacheTier, GroupRegistry, WarmingScheduler};
pub use config::CacheSettings;
pub use error::{Error, Result};
