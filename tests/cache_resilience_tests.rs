//! Integration tests for the cache resilience client
//!
//! These tests run against the in-process cache backend and verify:
//! - Negative caching for absent records
//! - Set/read round trips
//! - Single-loader rebuilds under the mutex strategy
//! - Stale serving and single rebuilds under logical expiry
//! - Failure surfacing (connectivity, malformed entries, shutdown)
//! - Lock release when a loader panics or a rebuilt value cannot be encoded

use futures::future::join_all;
use ouroboros_guard::{
    CacheResilienceClient, GuardConfig, GuardError, InMemoryCache, RemoteCache, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SHOP_KEY: &str = "cache:shop:";
const SHOP_LOCK: &str = "shop:";
const TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shop {
    id: u64,
    name: String,
    version: u32,
}

fn shop(id: u64, version: u32) -> Shop {
    Shop {
        id,
        name: format!("shop-{}", id),
        version,
    }
}

fn client_with(config: GuardConfig) -> (InMemoryCache, CacheResilienceClient) {
    let store = InMemoryCache::new();
    let client = CacheResilienceClient::new(Arc::new(store.clone()), config)
        .expect("valid config");
    (store, client)
}

fn quiet_config() -> GuardConfig {
    GuardConfig::builder()
        .default_ttl(TTL)
        .null_ttl(Duration::from_secs(2))
        .ttl_jitter(0.0) // No jitter for predictable tests
        .lock_retry(RetryPolicy {
            max_attempts: 200,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        })
        .build()
}

async fn wait_for_rebuilds(client: &CacheResilienceClient, completed: u64) {
    for _ in 0..200 {
        let stats = client.rebuild_stats();
        if stats.completed + stats.failed >= completed && stats.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("rebuilds did not finish: {:?}", client.rebuild_stats());
}

// ----------------------------------------------------------------------
// Pass-through
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_negative_entry_shields_loader() {
    let (_, client) = client_with(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let value: Option<Shop> = client
            .get_pass_through(
                SHOP_KEY,
                404u64,
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                },
                TTL,
            )
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = client.stats();
    assert_eq!(stats.negative_hits, 1);
    assert_eq!(stats.loads, 1);
}

#[tokio::test]
async fn test_negative_entry_expires_before_values() {
    let config = GuardConfig::builder()
        .default_ttl(Duration::from_secs(1))
        .null_ttl(Duration::from_millis(100))
        .ttl_jitter(0.0)
        .build();
    let (store, client) = client_with(config);
    let calls = Arc::new(AtomicUsize::new(0));

    let lookup = |calls: Arc<AtomicUsize>| {
        let client = client.clone();
        async move {
            client
                .get_pass_through::<Shop, _, _, _>(
                    SHOP_KEY,
                    404u64,
                    move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    },
                    Duration::from_secs(1),
                )
                .await
                .unwrap()
        }
    };

    assert_eq!(lookup(Arc::clone(&calls)).await, None);
    let remaining = store.ttl("cache:shop:404").await.unwrap();
    assert!(remaining <= Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(lookup(Arc::clone(&calls)).await, None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_set_then_read_round_trip() {
    let (store, client) = client_with(quiet_config());
    let original = shop(1, 3);

    client.set("cache:shop:1", &original, TTL).await.unwrap();

    let read: Option<Shop> = client
        .get_pass_through(
            SHOP_KEY,
            1u64,
            |_| async { Err(anyhow::anyhow!("loader must not run")) },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(read, Some(original));
    assert!(store.ttl("cache:shop:1").await.unwrap() <= TTL);
}

#[tokio::test]
async fn test_filled_value_ttl_is_jittered_upward() {
    let config = GuardConfig::builder()
        .default_ttl(TTL)
        .null_ttl(Duration::from_secs(2))
        .ttl_jitter(0.5)
        .build();
    let (store, client) = client_with(config);

    let _: Option<Shop> = client
        .get_pass_through(SHOP_KEY, 5u64, |id| async move { Ok(Some(shop(id, 1))) }, TTL)
        .await
        .unwrap();

    let remaining = store.ttl("cache:shop:5").await.unwrap();
    assert!(remaining > TTL - Duration::from_secs(1));
    assert!(remaining <= TTL + TTL / 2);
}

#[tokio::test]
async fn test_unavailable_cache_is_not_a_miss() {
    let (store, client) = client_with(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));
    store.set_available(false);

    let loader_calls = Arc::clone(&calls);
    let result: Result<Option<Shop>, GuardError> = client
        .get_pass_through(
            SHOP_KEY,
            1u64,
            move |id| async move {
                loader_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(shop(id, 1)))
            },
            TTL,
        )
        .await;

    assert!(result.unwrap_err().is_connection_error());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_envelope_does_not_poison_key() {
    let (store, client) = client_with(quiet_config());
    store.set("cache:shop:2", b"not json at all").await.unwrap();

    let first: Result<Option<Shop>, GuardError> = client
        .get_pass_through(SHOP_KEY, 2u64, |id| async move { Ok(Some(shop(id, 1))) }, TTL)
        .await;
    assert!(matches!(first, Err(GuardError::SerializationError(_))));

    let second: Option<Shop> = client
        .get_pass_through(SHOP_KEY, 2u64, |id| async move { Ok(Some(shop(id, 1))) }, TTL)
        .await
        .unwrap();
    assert_eq!(second, Some(shop(2, 1)));
}

// ----------------------------------------------------------------------
// Mutex strategy
// ----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_mutex_single_loader_under_concurrency() {
    let (store, client) = client_with(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..50)
        .map(|_| {
            let calls = Arc::clone(&calls);
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .get_with_mutex(
                        SHOP_KEY,
                        SHOP_LOCK,
                        1u64,
                        move |id| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Some(shop(id, 1)))
                        },
                        TTL,
                    )
                    .await
            })
        })
        .collect();

    let results: Vec<Result<Option<Shop>, GuardError>> = join_all(readers)
        .await
        .into_iter()
        .map(|joined| joined.expect("reader task panicked"))
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), Some(shop(1, 1)));
    }
    assert!(store.get("lock:shop:1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mutex_caches_absent_record() {
    let (_, client) = client_with(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let value: Option<Shop> = client
            .get_with_mutex(
                SHOP_KEY,
                SHOP_LOCK,
                77u64,
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                },
                TTL,
            )
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mutex_releases_lock_when_loader_fails() {
    let (store, client) = client_with(quiet_config());

    let result: Result<Option<Shop>, GuardError> = client
        .get_with_mutex(
            SHOP_KEY,
            SHOP_LOCK,
            3u64,
            |_| async { Err(anyhow::anyhow!("database timeout")) },
            TTL,
        )
        .await;

    assert!(matches!(result, Err(GuardError::LoaderError(_))));
    assert!(store.get("lock:shop:3").await.unwrap().is_none());
    assert!(store.get("cache:shop:3").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mutex_releases_lock_when_loader_panics() {
    let (store, client) = client_with(quiet_config());

    let reader = client.clone();
    let handle = tokio::spawn(async move {
        let value: Result<Option<Shop>, GuardError> = reader
            .get_with_mutex(
                SHOP_KEY,
                SHOP_LOCK,
                5u64,
                |id| async move {
                    if id == 5 {
                        panic!("loader crashed");
                    }
                    Ok(Some(shop(id, 1)))
                },
                TTL,
            )
            .await;
        value
    });

    // The panic reaches the caller after the lock is released
    let joined = handle.await.unwrap_err();
    assert!(joined.is_panic());
    assert!(store.get("lock:shop:5").await.unwrap().is_none());
    assert!(store.get("cache:shop:5").await.unwrap().is_none());

    // The next reader is not blocked by a leftover lock
    let value: Option<Shop> = client
        .get_with_mutex(
            SHOP_KEY,
            SHOP_LOCK,
            5u64,
            |id| async move { Ok(Some(shop(id, 2))) },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(value, Some(shop(5, 2)));
    assert_eq!(client.stats().lock_contention, 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_waiters() {
    let config = GuardConfig::builder()
        .lock_retry(RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            multiplier: 1.0,
        })
        .build();
    let (_, client) = client_with(config);

    let holder = client.mutex();
    assert!(holder
        .try_acquire("shop:9", Duration::from_secs(30))
        .await
        .unwrap());

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .get_with_mutex::<Shop, _, _, _>(
                    SHOP_KEY,
                    SHOP_LOCK,
                    9u64,
                    |id| async move { Ok(Some(shop(id, 1))) },
                    TTL,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be interrupted promptly")
        .unwrap();
    assert!(matches!(result, Err(GuardError::InterruptedWait { .. })));
}

// ----------------------------------------------------------------------
// Logical expiry strategy
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_logical_fresh_entry_served_without_rebuild() {
    let (_, client) = client_with(quiet_config());
    client
        .set_with_logical_expiry("cache:shop:1", &shop(1, 1), TTL)
        .await
        .unwrap();

    let value: Option<Shop> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            1u64,
            |_| async { Err(anyhow::anyhow!("loader must not run")) },
            TTL,
        )
        .await
        .unwrap();

    assert_eq!(value, Some(shop(1, 1)));
    assert_eq!(client.rebuild_stats().submitted, 0);
}

#[tokio::test]
async fn test_logical_missing_entry_reads_as_absent() {
    let (_, client) = client_with(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let loader_calls = Arc::clone(&calls);
    let value: Option<Shop> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            1u64,
            move |id| async move {
                loader_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(shop(id, 1)))
            },
            TTL,
        )
        .await
        .unwrap();

    assert_eq!(value, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_logical_expired_entry_single_rebuild() {
    let (store, client) = client_with(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    client
        .set_with_logical_expiry("cache:shop:1", &shop(1, 1), Duration::ZERO)
        .await
        .unwrap();

    let readers: Vec<_> = (0..50)
        .map(|_| {
            let calls = Arc::clone(&calls);
            let client = client.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                let value = client
                    .get_with_logical_expiry(
                        SHOP_KEY,
                        SHOP_LOCK,
                        1u64,
                        move |id| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(Some(shop(id, 2)))
                        },
                        TTL,
                    )
                    .await;
                (value, started.elapsed())
            })
        })
        .collect();

    let results: Vec<(Result<Option<Shop>, GuardError>, Duration)> = join_all(readers)
        .await
        .into_iter()
        .map(|joined| joined.expect("reader task panicked"))
        .collect();
    for (value, elapsed) in results {
        assert_eq!(value.unwrap(), Some(shop(1, 1)));
        assert!(elapsed < Duration::from_millis(100), "reader blocked for {:?}", elapsed);
    }

    wait_for_rebuilds(&client, 1).await;

    let rebuilds = client.rebuild_stats();
    assert_eq!(rebuilds.submitted, 1);
    assert_eq!(rebuilds.completed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.stats().stale_served, 50);
    assert!(store.get("lock:shop:1").await.unwrap().is_none());

    let refreshed: Option<Shop> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            1u64,
            |_| async { Err(anyhow::anyhow!("loader must not run")) },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(refreshed, Some(shop(1, 2)));
}

#[tokio::test]
async fn test_logical_rebuild_drops_deleted_record() {
    let (store, client) = client_with(quiet_config());
    client
        .set_with_logical_expiry("cache:shop:4", &shop(4, 1), Duration::ZERO)
        .await
        .unwrap();

    let stale: Option<Shop> = client
        .get_with_logical_expiry(SHOP_KEY, SHOP_LOCK, 4u64, |_| async { Ok(None) }, TTL)
        .await
        .unwrap();
    assert_eq!(stale, Some(shop(4, 1)));

    wait_for_rebuilds(&client, 1).await;
    assert!(store.get("cache:shop:4").await.unwrap().is_none());
    assert!(store.get("lock:shop:4").await.unwrap().is_none());
}

#[tokio::test]
async fn test_logical_failed_rebuild_keeps_stale_and_releases_lock() {
    let (store, client) = client_with(quiet_config());
    client
        .set_with_logical_expiry("cache:shop:6", &shop(6, 1), Duration::ZERO)
        .await
        .unwrap();

    let stale: Option<Shop> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            6u64,
            |_| async { Err(anyhow::anyhow!("database timeout")) },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(stale, Some(shop(6, 1)));

    wait_for_rebuilds(&client, 1).await;
    assert_eq!(client.rebuild_stats().failed, 1);
    assert!(store.get("lock:shop:6").await.unwrap().is_none());
    assert!(store.get("cache:shop:6").await.unwrap().is_some());
}

#[tokio::test]
async fn test_logical_panicking_rebuild_releases_lock() {
    let (store, client) = client_with(quiet_config());
    client
        .set_with_logical_expiry("cache:shop:12", &shop(12, 1), Duration::ZERO)
        .await
        .unwrap();

    let stale: Option<Shop> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            12u64,
            |id| async move {
                if id == 12 {
                    panic!("loader crashed");
                }
                Ok(Some(shop(id, 2)))
            },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(stale, Some(shop(12, 1)));

    wait_for_rebuilds(&client, 1).await;
    assert_eq!(client.rebuild_stats().failed, 1);
    assert!(store.get("lock:shop:12").await.unwrap().is_none());
    assert!(store.get("cache:shop:12").await.unwrap().is_some());

    // A later reader can claim the lock and rebuild
    let stale: Option<Shop> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            12u64,
            |id| async move { Ok(Some(shop(id, 2))) },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(stale, Some(shop(12, 1)));
    wait_for_rebuilds(&client, 2).await;
    assert_eq!(client.rebuild_stats().completed, 1);
}

/// Reads fine but refuses to be written back
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Unencodable {
    id: u64,
}

impl Serialize for Unencodable {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(format!(
            "record {} cannot be encoded",
            self.id
        )))
    }
}

#[tokio::test]
async fn test_logical_unencodable_rebuild_releases_lock() {
    let (store, client) = client_with(quiet_config());
    store
        .set(
            "cache:shop:14",
            br#"{"kind":"logical","data":{"id":14},"expire_at":"2020-01-01T00:00:00Z"}"#,
        )
        .await
        .unwrap();

    let stale: Option<Unencodable> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            14u64,
            |id| async move { Ok(Some(Unencodable { id })) },
            TTL,
        )
        .await
        .unwrap();
    assert_eq!(stale, Some(Unencodable { id: 14 }));

    wait_for_rebuilds(&client, 1).await;
    assert_eq!(client.rebuild_stats().failed, 1);
    assert!(store.get("lock:shop:14").await.unwrap().is_none());
    assert!(store.get("cache:shop:14").await.unwrap().is_some());
}

#[tokio::test]
async fn test_logical_contended_lock_serves_stale_without_job() {
    let (_, client) = client_with(quiet_config());
    client
        .set_with_logical_expiry("cache:shop:8", &shop(8, 1), Duration::ZERO)
        .await
        .unwrap();

    let other = client.mutex();
    assert!(other
        .try_acquire("shop:8", Duration::from_secs(30))
        .await
        .unwrap());

    let stale: Option<Shop> = client
        .get_with_logical_expiry(
            SHOP_KEY,
            SHOP_LOCK,
            8u64,
            |id| async move { Ok(Some(shop(id, 2))) },
            TTL,
        )
        .await
        .unwrap();

    assert_eq!(stale, Some(shop(8, 1)));
    assert_eq!(client.rebuild_stats().submitted, 0);
    assert!(other.is_held("shop:8").await.unwrap());
}

#[tokio::test]
async fn test_invalidate_after_source_write() {
    let (_, client) = client_with(quiet_config());
    let version = Arc::new(AtomicUsize::new(1));

    let read = |version: Arc<AtomicUsize>| {
        let client = client.clone();
        async move {
            client
                .get_pass_through::<Shop, _, _, _>(
                    SHOP_KEY,
                    1u64,
                    move |id| async move { Ok(Some(shop(id, version.load(Ordering::SeqCst) as u32))) },
                    TTL,
                )
                .await
                .unwrap()
        }
    };

    assert_eq!(read(Arc::clone(&version)).await, Some(shop(1, 1)));

    // Update the source of truth, then drop the cache entry
    version.store(2, Ordering::SeqCst);
    assert!(client.invalidate("cache:shop:1").await.unwrap());

    assert_eq!(read(Arc::clone(&version)).await, Some(shop(1, 2)));
}
