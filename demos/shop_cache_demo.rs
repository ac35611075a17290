//! Shop Cache Demo Application
//!
//! Puts the three read strategies in front of a slow in-process "database"
//! of shops and prints how often the database was actually hit.
//!
//! Usage:
//!   cargo run --example shop_cache_demo
//!
//! Environment variables:
//!   GUARD_REDIS_URL - use this Redis server instead of the in-process cache
//!   RUST_LOG        - log filter (default: info)

use futures::future::join_all;
use ouroboros_guard::{CacheResilienceClient, GuardConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHOP_KEY: &str = "cache:shop:";
const SHOP_LOCK: &str = "shop:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shop {
    id: u64,
    name: String,
    area: String,
}

/// Stand-in for the relational store
#[derive(Clone)]
struct ShopDatabase {
    rows: Arc<HashMap<u64, Shop>>,
    queries: Arc<AtomicUsize>,
}

impl ShopDatabase {
    fn seeded() -> Self {
        let rows = [(1, "Tea House", "Riverside"), (2, "Noodle Bar", "Old Town")]
            .into_iter()
            .map(|(id, name, area)| {
                (
                    id,
                    Shop {
                        id,
                        name: name.to_string(),
                        area: area.to_string(),
                    },
                )
            })
            .collect();

        Self {
            rows: Arc::new(rows),
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn find(self, id: u64) -> anyhow::Result<Option<Shop>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(self.rows.get(&id).cloned())
    }

    fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== Shop Cache Demo ===");

    let config = GuardConfig::from_env()?;
    let client = if std::env::var("GUARD_REDIS_URL").is_ok() {
        info!("Using Redis at {}", config.redis_url);
        CacheResilienceClient::connect(config).await?
    } else {
        info!("Using the in-process cache (set GUARD_REDIS_URL to use Redis)");
        CacheResilienceClient::in_memory(config)?
    };
    let db = ShopDatabase::seeded();
    let ttl = Duration::from_secs(30 * 60);

    info!("\n--- Pass-through: repeated lookups for a missing shop ---");
    for _ in 0..5 {
        let db = db.clone();
        let shop: Option<Shop> = client
            .get_pass_through(SHOP_KEY, 999u64, move |id| db.find(id), ttl)
            .await?;
        info!("shop 999 -> {:?}", shop);
    }
    info!("Database queries so far: {}", db.query_count());

    info!("\n--- Mutex: 20 concurrent first reads of shop 1 ---");
    let readers = (0..20).map(|_| {
        let client = client.clone();
        let db = db.clone();
        async move {
            client
                .get_with_mutex::<Shop, _, _, _>(SHOP_KEY, SHOP_LOCK, 1u64, move |id| db.find(id), ttl)
                .await
        }
    });
    let served = join_all(readers).await.into_iter().filter(|r| r.is_ok()).count();
    info!("{} readers served, database queries so far: {}", served, db.query_count());

    info!("\n--- Logical expiry: hot shop 2 ---");
    let logical_ttl = Duration::from_secs(1);
    let preload_db = db.clone();
    client
        .preload_with_logical_expiry(SHOP_KEY, 2u64, move |id| preload_db.find(id), logical_ttl)
        .await?;

    tokio::time::sleep(logical_ttl + Duration::from_millis(100)).await;

    let readers = (0..20).map(|_| {
        let client = client.clone();
        let db = db.clone();
        async move {
            client
                .get_with_logical_expiry::<Shop, _, _, _>(
                    SHOP_KEY,
                    SHOP_LOCK,
                    2u64,
                    move |id| db.find(id),
                    logical_ttl,
                )
                .await
        }
    });
    let stale = join_all(readers).await.into_iter().filter(|r| r.is_ok()).count();
    info!("{} readers served immediately (stale)", stale);

    client.shutdown().await;

    info!("\n--- Summary ---");
    info!("Database queries: {}", db.query_count());
    info!("Cache stats: {}", client.stats());
    info!("Rebuild stats: {:?}", client.rebuild_stats());

    client.invalidate_entity(SHOP_KEY, 1).await?;
    client.invalidate_entity(SHOP_KEY, 2).await?;
    client.invalidate_entity(SHOP_KEY, 999).await?;

    Ok(())
}
