//! Group-Policy Multi-Tier Cache
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          CacheManager                           │
//! │   get / set / delete / remember / invalidate / stats            │
//! └────────┬──────────────────┬──────────────────┬──────────────────┘
//!          │ GroupRegistry    │ PayloadCompressor│ CacheMetrics
//!          ▼                  ▼                  ▼
//! ┌────────────────┐  ┌────────────────┐  ┌────────────────┐
//! │  Local memory  │─▶│    Durable     │─▶│     Shared     │
//! │ sharded RwLock │  │ file / memory  │  │  pluggable     │
//! │  byte budget   │  │ TTL 1m..7d     │  │  group flush   │
//! └────────────────┘  └────────────────┘  └────────────────┘
//!        fastest ◀──── promotion on hit ────  slowest
//! ```
//!
//! Lookups walk the tiers a group enables, fastest first, and copy a hit
//! back into the faster tiers. Every tier stores the same [`Envelope`]
//! bytes, so expiry is decided by the value itself.

pub mod clock;
pub mod compression;
pub mod durable;
pub mod entry;
pub mod group;
pub mod key;
pub mod local;
pub mod maintenance;
pub mod manager;
pub mod metrics;
pub mod shard;
pub mod shared;
pub mod warming;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use compression::{CompressionAlgorithm, PayloadCompressor};
pub use durable::{DurableBackend, DurableCache, FileDurableBackend, InMemoryDurableBackend};
pub use entry::{CacheEntry, Envelope};
pub use group::{CacheGroupPolicy, CacheTier, GroupRegistry, GroupRegistryBuilder, TierSet};
pub use key::NormalizedKey;
pub use local::{LocalConfig, LocalMemoryCache, WriteGeneration};
pub use maintenance::{Maintenance, MaintenanceConfig, SweepReport};
pub use manager::{CacheManager, CacheManagerBuilder, SetReport, TierOutcome};
pub use metrics::{CacheMetrics, CacheStats, MetricsSnapshot};
pub use shared::{InMemorySharedBackend, SharedBackend, SharedCache};
pub use warming::{FnStrategy, WarmingReport, WarmingScheduler, WarmingStrategy};

/// Payload size above which compressible groups are compressed
pub const COMPRESSION_THRESHOLD: usize = compression::DEFAULT_COMPRESSION_THRESHOLD;

/// Share of local entries evicted per round under memory pressure
pub const LOCAL_EVICTION_PERCENT: u8 = 25;
