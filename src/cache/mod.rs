//! # Cache Resilience Layer
//!
//! Cache-aside reads over a shared remote cache that stay well-behaved when
//! the cache is cold, when keys are hot, and when callers ask for records
//! that do not exist.
//!
//! ## Features
//!
//! - **Negative Caching**: absent records are remembered briefly so repeated
//!   lookups never reach the source of truth
//! - **Mutex Rebuild**: one loader per identifier on a miss; others back off
//!   and re-read
//! - **Logical Expiration**: hot keys never physically expire; stale values
//!   are served while one background job refreshes them
//! - **TTL Jitter**: expiries are spread so entries written together do not
//!   expire together
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_guard::cache::{CacheResilienceClient, GuardConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> ouroboros_guard::Result<()> {
//! let config = GuardConfig::builder()
//!     .default_ttl(Duration::from_secs(30 * 60))
//!     .null_ttl(Duration::from_secs(2 * 60))
//!     .build();
//!
//! let client = CacheResilienceClient::in_memory(config)?;
//!
//! let name: Option<String> = client
//!     .get_pass_through(
//!         "cache:shop:",
//!         1u64,
//!         |id| async move { Ok(Some(format!("shop #{}", id))) },
//!         Duration::from_secs(30 * 60),
//!     )
//!     .await?;
//!
//! assert_eq!(name.as_deref(), Some("shop #1"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod envelope;
pub mod executor;
pub mod types;

pub use client::CacheResilienceClient;
pub use config::{
    validate_value_ttl, GuardConfig, GuardConfigBuilder, RetryPolicy, DEFAULT_ID_EPOCH_OFFSET,
    MIN_VALUE_TTL,
};
pub use envelope::Envelope;
pub use executor::{AsyncRebuildExecutor, RebuildStats, SubmitOutcome};
pub use types::{cache_key, CacheKey, GuardStats, COUNTER_NAMESPACE, LOCK_NAMESPACE};
