//! ID Worker Demo Application
//!
//! Issues order IDs from several concurrent workers and decodes a few.
//!
//! Usage:
//!   cargo run --example id_worker_demo
//!
//! Environment variables:
//!   GUARD_REDIS_URL       - use this Redis server instead of the in-process cache
//!   GUARD_ID_EPOCH_OFFSET - epoch offset in Unix seconds (default: 1672531200)
//!   RUST_LOG              - log filter (default: info)

use ouroboros_guard::{CompositeId, CompositeIdGenerator, GuardConfig, InMemoryCache, RedisCache, RemoteCache};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== ID Worker Demo ===");

    let config = GuardConfig::from_env()?;
    let cache: Arc<dyn RemoteCache> = if std::env::var("GUARD_REDIS_URL").is_ok() {
        Arc::new(RedisCache::connect(&config.redis_url).await?)
    } else {
        Arc::new(InMemoryCache::new())
    };
    let generator = CompositeIdGenerator::from_config(cache, &config);

    let started = Instant::now();
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let generator = generator.clone();
            tokio::spawn(async move {
                let mut ids = Vec::with_capacity(100);
                for _ in 0..100 {
                    ids.push(generator.next_id("order").await?);
                }
                Ok::<_, ouroboros_guard::GuardError>(ids)
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.await??);
    }

    let distinct: HashSet<i64> = ids.iter().copied().collect();
    info!(
        "Issued {} ids ({} distinct) in {:?}",
        ids.len(),
        distinct.len(),
        started.elapsed()
    );

    ids.sort_unstable();
    for &raw in ids.iter().take(3) {
        let id = CompositeId::from(raw);
        info!(
            "id {} -> timestamp {} sequence {} issued at {:?}",
            id,
            id.timestamp_part(),
            id.sequence_part(),
            id.issued_at(generator.epoch_offset())
        );
    }

    Ok(())
}
