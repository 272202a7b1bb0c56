//! tiercache Integration Tests
//!
//! End-to-end behaviour of the cache through its public API:
//! - Manager properties (round-trip, expiry, isolation, promotion,
//!   remember, invalidation, eviction)
//! - Several managers sharing one shared tier
//! - File-backed durable tier surviving a restart
//! - Warming, maintenance and monitoring
//! - Per-key ordering and counters under concurrent tasks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tiercache::cache::clock::expiry_after;
use tiercache::cache::{
    CacheManager, CacheTier, Clock, CompressionAlgorithm, DurableBackend, Envelope,
    InMemoryDurableBackend, InMemorySharedBackend, LocalConfig, ManualClock, NormalizedKey,
    SharedBackend,
};

struct Fixture {
    manager: CacheManager,
    clock: Arc<ManualClock>,
    durable: Arc<InMemoryDurableBackend>,
    shared: Arc<InMemorySharedBackend>,
}

fn fixture_with_budget(budget: u64) -> Fixture {
    let clock = Arc::new(ManualClock::new());
    let durable = Arc::new(InMemoryDurableBackend::new(clock.clone()));
    let shared = Arc::new(InMemorySharedBackend::new(clock.clone()));
    let manager = CacheManager::builder()
        .clock(clock.clone())
        .local_config(LocalConfig {
            memory_budget: budget,
        })
        .durable(durable.clone())
        .shared(shared.clone())
        .build();
    Fixture {
        manager,
        clock,
        durable,
        shared,
    }
}

fn fixture() -> Fixture {
    fixture_with_budget(50 * 1024 * 1024)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Total {
    total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Computed {
    computed: String,
}

// =============================================================================
// Manager properties
// =============================================================================

mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let f = fixture();
        let value = serde_json::json!({"user": 42, "tags": ["a", "b"]});
        assert!(f.manager.set("profile", "user_sessions", &value, None).await);
        assert_eq!(
            f.manager.get::<serde_json::Value>("profile", "user_sessions").await,
            Some(value)
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let f = fixture();
        f.manager
            .set("k", "analytics", &1u32, Some(Duration::from_secs(1)))
            .await;
        f.clock.advance(Duration::from_millis(1500));
        assert_eq!(f.manager.get::<u32>("k", "analytics").await, None);
    }

    #[tokio::test]
    async fn test_group_isolation() {
        let f = fixture();
        f.manager.set("k", "groupA", &"v1", None).await;
        assert_eq!(f.manager.get::<String>("k", "groupB").await, None);
    }

    #[tokio::test]
    async fn test_shared_seed_promotes_to_local() {
        let f = fixture();
        let key = NormalizedKey::new("ai_responses", "prompt");
        let expires_at = expiry_after(f.clock.now(), Duration::from_secs(3600));
        let raw = Envelope::new(
            CompressionAlgorithm::None,
            expires_at,
            Bytes::from(serde_json::to_vec(&Computed {
                computed: "seeded".into(),
            })
            .unwrap()),
        )
        .encode();
        f.shared
            .set(key.as_str(), raw, Duration::from_secs(3600))
            .await
            .unwrap();

        let first: Option<Computed> = f.manager.get("prompt", "ai_responses").await;
        assert_eq!(first.unwrap().computed, "seeded");
        assert_eq!(f.manager.stats().metrics.shared_hits, 1);

        f.shared.set_online(false);
        let second: Option<Computed> = f.manager.get("prompt", "ai_responses").await;
        assert_eq!(second.unwrap().computed, "seeded");
        assert_eq!(f.manager.stats().metrics.local_hits, 1);
        assert_eq!(f.durable.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_remember_idempotent_under_hit() {
        let f = fixture();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let _: Option<u32> = f
                .manager
                .remember("k", "ai_responses", None, move || async move {
                    Ok::<_, anyhow::Error>(Some(calls.fetch_add(1, Ordering::SeqCst) as u32))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_group_invalidation() {
        let f = fixture();
        for i in 0..5 {
            f.manager.set(&format!("s{}", i), "settings", &i, None).await;
            f.manager.set(&format!("a{}", i), "ai_responses", &i, None).await;
        }

        assert_eq!(f.manager.invalidate("settings", false).await, 5);
        for i in 0..5 {
            assert_eq!(f.manager.get::<i32>(&format!("s{}", i), "settings").await, None);
            assert_eq!(
                f.manager.get::<i32>(&format!("a{}", i), "ai_responses").await,
                Some(i)
            );
        }
    }

    #[tokio::test]
    async fn test_eviction_under_pressure() {
        // health_checks lives in the local tier only
        let f = fixture_with_budget(4096);
        for i in 0..40u64 {
            f.manager
                .set_bytes(
                    &format!("k{}", i),
                    "health_checks",
                    Bytes::from(vec![b'x'; 200]),
                    Some(Duration::from_secs(60 + i)),
                )
                .await;
        }

        let stats = f.manager.stats();
        assert!(stats.local_bytes <= 4096);
        assert!(stats.local_evictions > 0);
        // the latest-expiring entry always survives, the soonest never does
        assert!(f.manager.get_bytes("k39", "health_checks").await.is_some());
        assert!(f.manager.get_bytes("k0", "health_checks").await.is_none());
    }

    #[tokio::test]
    async fn test_analytics_report_scenario() {
        let f = fixture();
        assert!(
            f.manager
                .set("report-2024-01", "analytics", &Total { total: 125 }, Some(Duration::from_secs(1800)))
                .await
        );
        assert_eq!(
            f.manager.get::<Total>("report-2024-01", "analytics").await,
            Some(Total { total: 125 })
        );

        f.clock.advance(Duration::from_secs(1801));
        assert_eq!(f.manager.get::<Total>("report-2024-01", "analytics").await, None);
    }

    #[tokio::test]
    async fn test_remember_scenario() {
        let f = fixture();
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let produce = move || async move {
            let value = if calls.fetch_add(1, Ordering::SeqCst) == 0 { "x" } else { "y" };
            Ok::<_, anyhow::Error>(Some(Computed {
                computed: value.to_string(),
            }))
        };

        let ttl = Some(Duration::from_secs(300));
        let first = f.manager.remember("expensive", "ai_responses", ttl, produce).await.unwrap();
        let second = f.manager.remember("expensive", "ai_responses", ttl, produce).await.unwrap();
        assert_eq!(first.unwrap().computed, "x");
        assert_eq!(second.unwrap().computed, "x");
    }

    #[tokio::test]
    async fn test_shared_outage_does_not_fail_set() {
        let f = fixture();
        f.shared.set_online(false);
        let report = f.manager.set_with_report("k", "ai_responses", &1u8, None).await;
        assert!(report.succeeded());
        assert_eq!(report.failed_tiers(), vec![CacheTier::Shared]);
        assert_eq!(f.manager.stats().metrics.sets, 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn round_trip_and_isolation(
                key in ".{0,64}",
                group in "[a-z_]{1,20}",
                value in proptest::collection::vec(any::<i64>(), 0..16),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let f = fixture();
                    prop_assert!(f.manager.set(&key, &group, &value, None).await);
                    prop_assert_eq!(
                        f.manager.get::<Vec<i64>>(&key, &group).await,
                        Some(value.clone())
                    );
                    let other = format!("{}_other", group);
                    prop_assert_eq!(f.manager.get::<Vec<i64>>(&key, &other).await, None);
                    Ok(())
                })?;
            }
        }
    }
}

// =============================================================================
// Shared tier across managers
// =============================================================================

mod shared_tests {
    use super::*;

    #[tokio::test]
    async fn test_value_visible_to_second_process() {
        let clock = Arc::new(ManualClock::new());
        let shared = Arc::new(InMemorySharedBackend::new(clock.clone()));
        let a = CacheManager::builder()
            .clock(clock.clone())
            .shared(shared.clone())
            .build();
        let b = CacheManager::builder()
            .clock(clock.clone())
            .shared(shared.clone())
            .build();

        a.set("sess", "user_sessions", &"alice", None).await;
        assert_eq!(
            b.get::<String>("sess", "user_sessions").await.as_deref(),
            Some("alice")
        );
        assert_eq!(b.stats().metrics.shared_hits, 1);

        // a flush from one manager clears the shared tier for everybody
        b.invalidate("users", true).await;
        a.local().clear();
        assert_eq!(a.get::<String>("sess", "user_sessions").await, None);
    }
}

// =============================================================================
// File-backed durable tier
// =============================================================================

mod durable_tests {
    use super::*;
    use tiercache::cache::FileDurableBackend;

    #[tokio::test]
    async fn test_values_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());

        {
            let backend = FileDurableBackend::open(dir.path(), clock.clone()).await.unwrap();
            let manager = CacheManager::builder()
                .clock(clock.clone())
                .durable(Arc::new(backend))
                .build();
            let big = "quarterly numbers ".repeat(200);
            assert!(manager.set("q1", "reports", &big, None).await);
        }

        let backend = FileDurableBackend::open(dir.path(), clock.clone()).await.unwrap();
        let manager = CacheManager::builder()
            .clock(clock.clone())
            .durable(Arc::new(backend))
            .build();
        assert_eq!(
            manager.get::<String>("q1", "reports").await,
            Some("quarterly numbers ".repeat(200))
        );

        assert_eq!(manager.delete_by_pattern("reports:*").await.unwrap(), 1);
        assert_eq!(manager.get::<String>("q1", "reports").await, None);
    }
}

// =============================================================================
// Warming, maintenance and monitoring
// =============================================================================

mod background_tests {
    use super::*;
    use tiercache::cache::{Maintenance, MaintenanceConfig};
    use tiercache::monitoring::{CacheExporter, HealthStatus, TierHealth};
    use tiercache::WarmingScheduler;

    #[tokio::test]
    async fn test_warming_then_read() {
        let cache = Arc::new(CacheManager::in_memory());
        let warming = WarmingScheduler::new(cache.clone());
        warming.register_fn("reports", |cache: Arc<CacheManager>| async move {
            cache.set("daily", "reports", &Total { total: 7 }, None).await;
            Ok(())
        });
        warming.register_fn("settings", |_cache: Arc<CacheManager>| async move {
            Err(anyhow::anyhow!("settings source offline"))
        });

        let report = warming.run_warming().await;
        assert_eq!(report.warmed, vec!["reports".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            cache.get::<Total>("daily", "reports").await,
            Some(Total { total: 7 })
        );
    }

    #[tokio::test]
    async fn test_sweep_via_maintenance() {
        let f = fixture();
        let cache = Arc::new(f.manager);
        cache
            .set("k", "health_checks", &1u8, Some(Duration::from_secs(5)))
            .await;
        let maintenance = Maintenance::new(
            cache.clone(),
            Arc::new(WarmingScheduler::new(cache.clone())),
            MaintenanceConfig::default(),
        );
        f.clock.advance(Duration::from_secs(10));
        assert_eq!(maintenance.sweep().await.local_expired, 1);
        assert!(cache.local().is_empty());
    }

    #[tokio::test]
    async fn test_monitoring_surface() {
        let f = fixture();
        f.manager.set("k", "settings", &1u8, None).await;
        f.manager.get::<u8>("k", "settings").await;
        f.shared.set_online(false);

        let cache = Arc::new(f.manager);
        let exporter = CacheExporter::new().unwrap();
        exporter.refresh(&cache.stats());
        let text = exporter.render().unwrap();
        assert!(text.contains("tiercache_hits 1"));
        assert!(text.contains("tiercache_sets 1"));

        let report = TierHealth::new(cache).check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// All three tiers in memory, with a tier timeout no scheduler delay reaches
    fn manager() -> Arc<CacheManager> {
        let clock = Arc::new(ManualClock::new());
        Arc::new(
            CacheManager::builder()
                .clock(clock.clone())
                .durable(Arc::new(InMemoryDurableBackend::new(clock.clone())))
                .shared(Arc::new(InMemorySharedBackend::new(clock)))
                .tier_timeout(Duration::from_secs(30))
                .build(),
        )
    }

    /// Tasks that keep reading `k` through the durable tier until stopped
    fn spawn_readers(
        manager: &Arc<CacheManager>,
        stop: &Arc<AtomicBool>,
        count: usize,
    ) -> Vec<tokio::task::JoinHandle<usize>> {
        (0..count)
            .map(|_| {
                let manager = manager.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    let mut reads = 0;
                    while !stop.load(Ordering::Relaxed) {
                        // force the next read below the local tier
                        manager.local().clear();
                        manager.get::<u64>("k", "settings").await;
                        reads += 1;
                        tokio::task::yield_now().await;
                    }
                    reads
                })
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completed_writes_are_visible_under_concurrent_reads() {
        let manager = manager();
        let stop = Arc::new(AtomicBool::new(false));
        let readers = spawn_readers(&manager, &stop, 6);

        for round in 1..=200u64 {
            if round % 10 == 0 {
                assert!(manager.delete("k", "settings").await);
                assert_eq!(
                    manager.get::<u64>("k", "settings").await,
                    None,
                    "deleted value came back in round {}",
                    round
                );
            } else {
                assert!(manager.set("k", "settings", &round, None).await);
                assert_eq!(
                    manager.get::<u64>("k", "settings").await,
                    Some(round),
                    "stale value after set in round {}",
                    round
                );
            }
            tokio::task::yield_now().await;
        }

        stop.store(true, Ordering::Relaxed);
        let mut reads = 0;
        for reader in readers {
            reads += reader.await.unwrap();
        }
        assert!(reads > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_after_concurrent_churn_wins() {
        let manager = manager();
        let writers: Vec<_> = (0..8u64)
            .map(|w| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    for i in 0..50u64 {
                        let value = w * 1000 + i;
                        manager.set("k", "analytics", &value, None).await;
                        if i % 7 == 0 {
                            manager.delete("k", "analytics").await;
                        }
                        manager.get::<u64>("k", "analytics").await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        // quiescent: a write now must win everywhere
        assert!(manager.set("k", "analytics", &42u64, None).await);
        manager.local().clear();
        assert_eq!(manager.get::<u64>("k", "analytics").await, Some(42));
        assert_eq!(manager.get::<u64>("k", "analytics").await, Some(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counters_lose_no_updates() {
        let manager = manager();
        assert!(manager.set("present", "settings", &1u8, None).await);
        manager.reset_stats();

        const TASKS: u64 = 8;
        const OPS: u64 = 500;
        let tasks: Vec<_> = (0..TASKS)
            .map(|t| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    for i in 0..OPS {
                        assert_eq!(manager.get::<u8>("present", "settings").await, Some(1));
                        let missing = format!("missing-{}-{}", t, i);
                        assert_eq!(manager.get::<u8>(&missing, "health_checks").await, None);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.metrics.hits, TASKS * OPS);
        assert_eq!(stats.metrics.misses, TASKS * OPS);
        assert_eq!(stats.metrics.local_hits, TASKS * OPS);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
