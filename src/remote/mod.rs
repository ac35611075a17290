//! Remote cache abstraction
//!
//! The guard never talks to a cache server directly; everything goes through
//! [`RemoteCache`], which captures the handful of atomic operations the
//! protocols rely on. Two backends are provided:
//!
//! - [`RedisCache`]: a Redis server via an auto-reconnecting connection manager
//! - [`InMemoryCache`]: a process-local map with physical TTLs, for tests,
//!   single-process deployments and demos

pub mod memory;
pub mod redis_cache;

pub use memory::InMemoryCache;
pub use redis_cache::RedisCache;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Operations the guard needs from a shared key-value cache
///
/// Every method is a single atomic operation on the server. Connectivity
/// problems must surface as [`GuardError::ConnectionError`](crate::GuardError::ConnectionError),
/// never as a missing key.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Read the raw bytes under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` with a physical expiry
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Write `value` with no physical expiry
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Write `value` only if `key` is absent; true when this call created it
    async fn set_if_absent_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Atomically increment the integer under `key` (created at 0) and return the new value
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Delete `key` only if it currently holds exactly `expected`; returns the number deleted
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<i64>;

    /// Delete `key`; true if something was removed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Longest expiry sent to a server (about a century); longer TTLs are clamped
pub(crate) const MAX_TTL_MILLIS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Millisecond expiry for servers that count in whole milliseconds
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_TTL_MILLIS)
}
