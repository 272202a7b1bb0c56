//! Monitoring
//!
//! Prometheus export of cache statistics and tier health probes.

pub mod exporter;
pub mod health;

pub use exporter::CacheExporter;
pub use health::{HealthReport, HealthStatus, TierCheck, TierHealth};
