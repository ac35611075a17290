//! Configuration for the cache guard

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for callers waiting on a rebuild lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts (including the first) before giving up
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_backoff: Duration,

    /// Upper bound for a single delay
    pub max_backoff: Duration,

    /// Growth factor applied after each failed attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let nanos = self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_backoff.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }
}

/// Configuration for the resilience client and its collaborators
///
/// Defaults mirror a typical shop-detail workload:
/// - Values live for 30 minutes, negative entries for 2 minutes
/// - Rebuild leases last 10 seconds
/// - Five background rebuild workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Connection URL for the Redis backend
    pub redis_url: String,

    /// Default time-to-live for plain value envelopes
    pub default_ttl: Duration,

    /// Time-to-live for negative (absence) envelopes
    /// Always kept strictly below the value TTL
    pub null_ttl: Duration,

    /// TTL jitter factor (0.0 - 1.0)
    /// Stretches TTLs by a random fraction so a batch of keys written
    /// together does not expire together
    pub ttl_jitter: f64,

    /// Lease for rebuild locks; must exceed worst-case loader latency
    pub lock_lease_ttl: Duration,

    /// Backoff for the mutex read strategy
    pub lock_retry: RetryPolicy,

    /// Number of background rebuild workers
    pub rebuild_workers: usize,

    /// Maximum queued rebuild jobs before new ones are rejected
    pub rebuild_queue_capacity: usize,

    /// Seconds subtracted from the Unix time in composite IDs
    pub id_epoch_offset: i64,
}

/// 2023-01-01T00:00:00Z
pub const DEFAULT_ID_EPOCH_OFFSET: i64 = 1_672_531_200;

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            default_ttl: Duration::from_secs(30 * 60),
            null_ttl: Duration::from_secs(2 * 60),
            ttl_jitter: 0.1,
            lock_lease_ttl: Duration::from_secs(10),
            lock_retry: RetryPolicy::default(),
            rebuild_workers: 5,
            rebuild_queue_capacity: 256,
            id_epoch_offset: DEFAULT_ID_EPOCH_OFFSET,
        }
    }
}

impl GuardConfig {
    /// Create a new builder for guard configuration
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::default()
    }

    /// Load configuration from the environment (and `.env` if present)
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            redis_url: std::env::var("GUARD_REDIS_URL").unwrap_or(defaults.redis_url),
            default_ttl: env_secs("GUARD_DEFAULT_TTL_SECS")?.unwrap_or(defaults.default_ttl),
            null_ttl: env_secs("GUARD_NULL_TTL_SECS")?.unwrap_or(defaults.null_ttl),
            ttl_jitter: env_parse("GUARD_TTL_JITTER")?.unwrap_or(defaults.ttl_jitter),
            lock_lease_ttl: env_secs("GUARD_LOCK_LEASE_SECS")?.unwrap_or(defaults.lock_lease_ttl),
            lock_retry: RetryPolicy {
                max_attempts: env_parse("GUARD_LOCK_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.lock_retry.max_attempts),
                ..defaults.lock_retry
            },
            rebuild_workers: env_parse("GUARD_REBUILD_WORKERS")?
                .unwrap_or(defaults.rebuild_workers),
            rebuild_queue_capacity: env_parse("GUARD_REBUILD_QUEUE_CAPACITY")?
                .unwrap_or(defaults.rebuild_queue_capacity),
            id_epoch_offset: env_parse("GUARD_ID_EPOCH_OFFSET")?
                .unwrap_or(defaults.id_epoch_offset),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(GuardError::ConfigError("default_ttl must be greater than 0".to_string()));
        }

        if self.null_ttl.is_zero() {
            return Err(GuardError::ConfigError("null_ttl must be greater than 0".to_string()));
        }

        if self.null_ttl >= self.default_ttl {
            return Err(GuardError::ConfigError(
                "null_ttl must be shorter than default_ttl".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(GuardError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.lock_lease_ttl.is_zero() {
            return Err(GuardError::ConfigError("lock_lease_ttl must be greater than 0".to_string()));
        }

        if self.lock_retry.max_attempts == 0 {
            return Err(GuardError::ConfigError(
                "lock_retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.lock_retry.multiplier < 1.0 {
            return Err(GuardError::ConfigError(
                "lock_retry.multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.rebuild_workers == 0 {
            return Err(GuardError::ConfigError("rebuild_workers must be greater than 0".to_string()));
        }

        if self.rebuild_queue_capacity == 0 {
            return Err(GuardError::ConfigError(
                "rebuild_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.id_epoch_offset < 0 {
            return Err(GuardError::ConfigError("id_epoch_offset must not be negative".to_string()));
        }

        Ok(())
    }

    /// Stretch a TTL by a random fraction of up to `ttl_jitter`
    pub fn ttl_with_jitter(&self, base: Duration) -> Duration {
        if self.ttl_jitter == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter = rand::random::<f64>() * base_secs * self.ttl_jitter;

        Duration::try_from_secs_f64(base_secs + jitter)
            .unwrap_or(Duration::MAX)
            .max(base)
    }

    /// Physical TTL for a negative entry in a key family whose values live `value_ttl`
    ///
    /// Computed in whole milliseconds, the resolution of the cache server.
    /// For any `value_ttl` of at least [`MIN_VALUE_TTL`] the result is
    /// strictly below `value_ttl` even after jitter.
    pub fn negative_ttl(&self, value_ttl: Duration) -> Duration {
        let value_ms = whole_millis(value_ttl);
        let jittered_ms = whole_millis(self.ttl_with_jitter(self.null_ttl));

        if jittered_ms < value_ms {
            Duration::from_millis(jittered_ms.max(1))
        } else {
            Duration::from_millis((value_ms / 2).max(1))
        }
    }
}

/// Shortest TTL accepted for values filled from the source
///
/// A negative entry must fit at least one whole millisecond below it.
pub const MIN_VALUE_TTL: Duration = Duration::from_millis(2);

/// Reject value TTLs too short to keep negative entries strictly shorter
pub fn validate_value_ttl(ttl: Duration) -> Result<()> {
    if ttl < MIN_VALUE_TTL {
        return Err(GuardError::ConfigError(format!(
            "value ttl {:?} is below the minimum of {:?}",
            ttl, MIN_VALUE_TTL
        )));
    }
    Ok(())
}

fn whole_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| GuardError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

/// Builder for guard configuration
#[derive(Debug, Default)]
pub struct GuardConfigBuilder {
    redis_url: Option<String>,
    default_ttl: Option<Duration>,
    null_ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    lock_lease_ttl: Option<Duration>,
    lock_retry: Option<RetryPolicy>,
    rebuild_workers: Option<usize>,
    rebuild_queue_capacity: Option<usize>,
    id_epoch_offset: Option<i64>,
}

impl GuardConfigBuilder {
    /// Set the Redis connection URL
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set default TTL for value envelopes
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set TTL for negative envelopes
    pub fn null_ttl(mut self, ttl: Duration) -> Self {
        self.null_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Set the rebuild lock lease
    pub fn lock_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lock_lease_ttl = Some(ttl);
        self
    }

    /// Set the mutex strategy backoff policy
    pub fn lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.lock_retry = Some(policy);
        self
    }

    /// Set the number of rebuild workers
    pub fn rebuild_workers(mut self, workers: usize) -> Self {
        self.rebuild_workers = Some(workers);
        self
    }

    /// Set the rebuild queue capacity
    pub fn rebuild_queue_capacity(mut self, capacity: usize) -> Self {
        self.rebuild_queue_capacity = Some(capacity);
        self
    }

    /// Set the composite ID epoch offset (Unix seconds)
    pub fn id_epoch_offset(mut self, offset: i64) -> Self {
        self.id_epoch_offset = Some(offset);
        self
    }

    /// Build the guard configuration
    pub fn build(self) -> GuardConfig {
        let defaults = GuardConfig::default();

        GuardConfig {
            redis_url: self.redis_url.unwrap_or(defaults.redis_url),
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            null_ttl: self.null_ttl.unwrap_or(defaults.null_ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            lock_lease_ttl: self.lock_lease_ttl.unwrap_or(defaults.lock_lease_ttl),
            lock_retry: self.lock_retry.unwrap_or(defaults.lock_retry),
            rebuild_workers: self.rebuild_workers.unwrap_or(defaults.rebuild_workers),
            rebuild_queue_capacity: self
                .rebuild_queue_capacity
                .unwrap_or(defaults.rebuild_queue_capacity),
            id_epoch_offset: self.id_epoch_offset.unwrap_or(defaults.id_epoch_offset),
        }
    }
}

/// Preset configurations for common workloads
impl GuardConfig {
    /// Short-lived data: 5 minute values, 30 second negatives
    pub fn realtime() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            null_ttl: Duration::from_secs(30),
            ttl_jitter: 0.15,
            lock_lease_ttl: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// A few very hot keys: more workers, patient waiters
    pub fn hot_keys() -> Self {
        Self {
            rebuild_workers: 8,
            lock_retry: RetryPolicy {
                max_attempts: 100,
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(500),
                multiplier: 1.5,
            },
            ..Default::default()
        }
    }
}
