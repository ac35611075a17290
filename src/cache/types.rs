//! Core type definitions: keys, namespaces and statistics

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key type - semantic prefix followed by the entity identifier
pub type CacheKey = String;

/// Namespace holding lock records
pub const LOCK_NAMESPACE: &str = "lock:";

/// Namespace holding ID worker counters
pub const COUNTER_NAMESPACE: &str = "icr:";

/// Build the cache key for an entity: `prefix` immediately followed by `id`
///
/// Prefixes inside a reserved namespace are rejected so a cached value can
/// never overwrite a lock record or an ID counter.
pub fn cache_key(prefix: &str, id: impl fmt::Display) -> Result<CacheKey> {
    let key = format!("{}{}", prefix, id);
    validate_value_key(&key)?;
    Ok(key)
}

/// Check that a key may hold a cached value
pub fn validate_value_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(GuardError::InvalidKey("cache key must not be empty".to_string()));
    }

    for reserved in [LOCK_NAMESPACE, COUNTER_NAMESPACE] {
        if key.starts_with(reserved) {
            return Err(GuardError::InvalidKey(format!(
                "'{}' is inside the reserved '{}' namespace",
                key, reserved
            )));
        }
    }

    Ok(())
}

/// Build the storage key for a lock name
pub fn lock_key(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(GuardError::InvalidKey("lock name must not be empty".to_string()));
    }
    Ok(format!("{}{}", LOCK_NAMESPACE, name))
}

/// Live counters updated by the resilience client
#[derive(Debug, Default)]
pub(crate) struct GuardMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub negative_hits: AtomicU64,
    pub loads: AtomicU64,
    pub stale_served: AtomicU64,
    pub rebuilds_scheduled: AtomicU64,
    pub lock_contention: AtomicU64,
    pub serialization_faults: AtomicU64,
}

impl GuardMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GuardStats {
        GuardStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            rebuilds_scheduled: self.rebuilds_scheduled.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            serialization_faults: self.serialization_faults.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time statistics for the resilience client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GuardStats {
    /// Reads answered by a value envelope (fresh or stale)
    pub hits: u64,

    /// Reads that found no envelope at all
    pub misses: u64,

    /// Reads answered "not found" by a negative envelope
    pub negative_hits: u64,

    /// Synchronous loader invocations
    pub loads: u64,

    /// Logically expired values returned to callers
    pub stale_served: u64,

    /// Background rebuilds accepted by the executor
    pub rebuilds_scheduled: u64,

    /// Lock acquisitions that found another holder
    pub lock_contention: u64,

    /// Envelopes that failed to decode
    pub serialization_faults: u64,
}

impl GuardStats {
    /// Share of reads served from the cache (including negative entries), as a percentage
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.negative_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            (served as f64 / total as f64) * 100.0
        }
    }

    /// Share of hits that returned stale data, as a percentage
    pub fn stale_rate(&self) -> f64 {
        if self.hits == 0 {
            0.0
        } else {
            (self.stale_served as f64 / self.hits as f64) * 100.0
        }
    }
}

impl fmt::Display for GuardStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GuardStats {{ hits: {}, misses: {}, negative_hits: {}, hit_rate: {:.2}%, loads: {}, stale: {}, rebuilds: {}, contention: {} }}",
            self.hits,
            self.misses,
            self.negative_hits,
            self.hit_rate(),
            self.loads,
            self.stale_served,
            self.rebuilds_scheduled,
            self.lock_contention
        )
    }
}
