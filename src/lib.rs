//! # Ouroboros Guard (ouroboros-guard)
//!
//! Cache resilience and coordination primitives for services that put a
//! shared cache (Redis) in front of a slow source of truth.
//!
//! ## Features
//!
//! - Cache-aside reads with three strategies (pass-through, mutex, logical expiry)
//! - Self-describing envelopes for values, negative entries and logical expiry
//! - Distributed mutex with token-fenced release
//! - Bounded background rebuild executor with coalescing
//! - Composite 64-bit IDs from per-day remote counters
//! - Redis and in-process cache backends
//!
//! ## Pass-Through Reads
//! A missing record is cached as a short-lived negative entry so repeated
//! lookups for it never reach the database.
//!
//! ```no_run
//! use ouroboros_guard::{CacheResilienceClient, GuardConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = CacheResilienceClient::connect(GuardConfig::from_env()?).await?;
//!
//!     let shop: Option<String> = client
//!         .get_pass_through(
//!             "cache:shop:",
//!             42u64,
//!             |id| async move { Ok(Some(format!("shop {}", id))) },
//!             Duration::from_secs(30 * 60),
//!         )
//!         .await?;
//!     println!("Shop: {:?}", shop);
//!     Ok(())
//! }
//! ```
//!
//! ### Mutex Reads
//! On a miss only one caller per identifier runs the loader; the rest back
//! off and re-read.
//!
//! ```no_run
//! use ouroboros_guard::{CacheResilienceClient, GuardConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = CacheResilienceClient::connect(GuardConfig::default()).await?;
//!
//!     let shop: Option<String> = client
//!         .get_with_mutex(
//!             "cache:shop:",
//!             "shop:",
//!             42u64,
//!             |id| async move { Ok(Some(format!("shop {}", id))) },
//!             Duration::from_secs(30 * 60),
//!         )
//!         .await?;
//!     println!("Shop: {:?}", shop);
//!     Ok(())
//! }
//! ```
//!
//! ### Logical Expiry Reads
//! Hot keys are preloaded without a physical TTL. Expired values are
//! returned immediately while one background job refreshes them.
//!
//! ```no_run
//! use ouroboros_guard::{CacheResilienceClient, GuardConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = CacheResilienceClient::connect(GuardConfig::hot_keys()).await?;
//!     let logical_ttl = Duration::from_secs(20);
//!
//!     client
//!         .preload_with_logical_expiry(
//!             "cache:shop:",
//!             1u64,
//!             |id| async move { Ok(Some(format!("shop {}", id))) },
//!             logical_ttl,
//!         )
//!         .await?;
//!
//!     let shop: Option<String> = client
//!         .get_with_logical_expiry(
//!             "cache:shop:",
//!             "shop:",
//!             1u64,
//!             |id| async move { Ok(Some(format!("shop {}", id))) },
//!             logical_ttl,
//!         )
//!         .await?;
//!     println!("Shop: {:?}", shop);
//!     Ok(())
//! }
//! ```
//!
//! ## Composite IDs
//!
//! ```no_run
//! use ouroboros_guard::{CompositeIdGenerator, RedisCache, DEFAULT_ID_EPOCH_OFFSET};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = RedisCache::connect("redis://127.0.0.1:6379").await?;
//!     let ids = CompositeIdGenerator::new(Arc::new(cache), DEFAULT_ID_EPOCH_OFFSET);
//!
//!     let order_id = ids.next_id("order").await?;
//!     println!("Order id: {}", order_id);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod id_worker;
pub mod lock;
pub mod remote;

// Re-export main types for convenience
pub use cache::{
    cache_key, AsyncRebuildExecutor, CacheKey, CacheResilienceClient, Envelope, GuardConfig,
    GuardConfigBuilder, GuardStats, RebuildStats, RetryPolicy, SubmitOutcome,
    DEFAULT_ID_EPOCH_OFFSET, MIN_VALUE_TTL,
};
pub use error::{GuardError, Result};
pub use id_worker::{CompositeId, CompositeIdGenerator, IdScope};
pub use lock::{DistributedMutex, LockToken};
pub use remote::{InMemoryCache, RedisCache, RemoteCache};
