//! Envelope codec for cached payloads
//!
//! Every value written by the guard is wrapped in an [`Envelope`] and stored
//! as JSON with an explicit `kind` tag:
//!
//! ```text
//! {"kind":"empty"}
//! {"kind":"value","data":{...}}
//! {"kind":"logical","data":{...},"expire_at":"2024-05-01T12:00:00Z"}
//! ```
//!
//! The tag alone decides the shape on read.

use crate::error::{GuardError, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// A cached payload in one of its three shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope<T> {
    /// Negative entry: the source of truth has no record
    Empty,

    /// Plain value guarded by the entry's physical TTL
    Value { data: T },

    /// Value carrying its own logical expiry
    #[serde(rename = "logical")]
    ValueWithExpiry { data: T, expire_at: DateTime<Utc> },
}

impl<T> Envelope<T> {
    /// Wrap a value whose logical expiry is `ttl` from now
    pub fn with_logical_expiry(data: T, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expire_at = Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Envelope::ValueWithExpiry { data, expire_at }
    }

    /// Whether this is a negative entry
    pub fn is_empty(&self) -> bool {
        matches!(self, Envelope::Empty)
    }

    /// Whether the logical expiry has passed (plain values never expire logically)
    pub fn is_logically_expired(&self) -> bool {
        self.is_logically_expired_at(Utc::now())
    }

    /// Whether the logical expiry has passed at `now`
    pub fn is_logically_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Envelope::ValueWithExpiry { expire_at, .. } => *expire_at <= now,
            _ => false,
        }
    }

    /// Borrow the payload, if any
    pub fn data(&self) -> Option<&T> {
        match self {
            Envelope::Empty => None,
            Envelope::Value { data } | Envelope::ValueWithExpiry { data, .. } => Some(data),
        }
    }

    /// Take the payload, if any
    pub fn into_data(self) -> Option<T> {
        match self {
            Envelope::Empty => None,
            Envelope::Value { data } | Envelope::ValueWithExpiry { data, .. } => Some(data),
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize to the bytes stored in the remote cache
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| GuardError::SerializationError(format!("failed to encode envelope: {}", e)))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Deserialize bytes read from the remote cache
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| GuardError::SerializationError(format!("malformed envelope: {}", e)))
    }
}

/// Encode a negative entry; needs no payload type
pub fn encode_empty() -> Vec<u8> {
    br#"{"kind":"empty"}"#.to_vec()
}
