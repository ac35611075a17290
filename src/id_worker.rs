//! Composite 64-bit identifiers backed by a remote counter
//!
//! An ID is `(seconds since epoch offset) << 32 | sequence`, where the
//! sequence comes from an atomic increment on a per-scope, per-day counter
//! (`icr:<scope>:<yyyy:MM:dd>`). Nothing is kept locally: uniqueness rests
//! entirely on the atomicity of the remote increment, so any number of
//! processes may issue IDs for the same scope concurrently.
//!
//! IDs order by time at one-second resolution. Within a second, order
//! follows the day's counter.

use crate::cache::config::GuardConfig;
use crate::cache::types::COUNTER_NAMESPACE;
use crate::error::{GuardError, Result};
use crate::remote::RemoteCache;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Bits reserved for the per-day sequence
pub const COUNT_BITS: u32 = 32;

const SEQUENCE_MASK: i64 = (1 << COUNT_BITS) - 1;

/// Largest relative timestamp that keeps IDs positive
const MAX_TIMESTAMP: i64 = i64::MAX >> COUNT_BITS;

/// One counter sequence: a caller-chosen prefix and a calendar day
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdScope {
    pub prefix: String,
    pub day: NaiveDate,
}

impl IdScope {
    /// Scope for `prefix` on the UTC day containing `at`
    pub fn new(prefix: impl Into<String>, at: DateTime<Utc>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(GuardError::InvalidKey("id scope must not be empty".to_string()));
        }
        Ok(Self {
            prefix,
            day: at.date_naive(),
        })
    }

    /// Storage key of the counter
    pub fn counter_key(&self) -> String {
        format!("{}{}", COUNTER_NAMESPACE, self)
    }
}

impl fmt::Display for IdScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.day.format("%Y:%m:%d"))
    }
}

/// A decoded composite identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeId(i64);

impl CompositeId {
    /// Combine a relative timestamp and a sequence
    pub fn from_parts(timestamp: i64, sequence: u32) -> Self {
        Self((timestamp << COUNT_BITS) | i64::from(sequence))
    }

    /// The raw 64-bit value
    pub fn value(self) -> i64 {
        self.0
    }

    /// Seconds since the epoch offset at issue time
    pub fn timestamp_part(self) -> i64 {
        self.0 >> COUNT_BITS
    }

    /// Position within the day's counter
    pub fn sequence_part(self) -> u32 {
        (self.0 & SEQUENCE_MASK) as u32
    }

    /// Wall-clock second the ID was issued, given the generator's epoch offset
    pub fn issued_at(self, epoch_offset: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp_part() + epoch_offset, 0)
    }
}

impl From<i64> for CompositeId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<CompositeId> for i64 {
    fn from(id: CompositeId) -> Self {
        id.0
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues composite IDs from counters in a shared [`RemoteCache`]
#[derive(Clone)]
pub struct CompositeIdGenerator {
    cache: Arc<dyn RemoteCache>,
    epoch_offset: i64,
}

impl CompositeIdGenerator {
    /// Create a generator counting seconds from `epoch_offset` (Unix seconds)
    pub fn new(cache: Arc<dyn RemoteCache>, epoch_offset: i64) -> Self {
        Self { cache, epoch_offset }
    }

    /// Create a generator using `config.id_epoch_offset`
    pub fn from_config(cache: Arc<dyn RemoteCache>, config: &GuardConfig) -> Self {
        Self::new(cache, config.id_epoch_offset)
    }

    /// The epoch offset in Unix seconds
    pub fn epoch_offset(&self) -> i64 {
        self.epoch_offset
    }

    /// Issue the next ID for `scope`
    pub async fn next_id(&self, scope: &str) -> Result<i64> {
        Ok(self.next_id_at(scope, Utc::now()).await?.value())
    }

    /// Issue the next ID for `scope` as if the clock read `now`
    pub async fn next_id_at(&self, scope: &str, now: DateTime<Utc>) -> Result<CompositeId> {
        let timestamp = now.timestamp() - self.epoch_offset;
        if timestamp < 0 {
            error!(
                "Clock reads {} which is before the id epoch offset {}",
                now, self.epoch_offset
            );
            return Err(GuardError::ClockError(format!(
                "clock {} is before the id epoch offset {}",
                now, self.epoch_offset
            )));
        }
        if timestamp > MAX_TIMESTAMP {
            return Err(GuardError::ClockError(format!(
                "{} seconds past the epoch offset no longer fits in an id",
                timestamp
            )));
        }

        let id_scope = IdScope::new(scope, now)?;
        let key = id_scope.counter_key();
        let sequence = self.cache.increment(&key).await?;

        let sequence = u32::try_from(sequence).map_err(|_| {
            error!("Counter {} reached {}, no ids left for today", key, sequence);
            GuardError::SequenceOverflow {
                scope: id_scope.to_string(),
                value: sequence,
            }
        })?;

        let id = CompositeId::from_parts(timestamp, sequence);
        debug!("Issued id {} from {}", id, key);
        Ok(id)
    }
}

impl fmt::Debug for CompositeIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeIdGenerator")
            .field("epoch_offset", &self.epoch_offset)
            .finish()
    }
}
