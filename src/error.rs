//! Error types for cache guard operations
//!
//! This module defines the error type shared by the resilience client,
//! the distributed mutex, the rebuild executor and the ID worker.

use std::time::Duration;
use thiserror::Error;

/// Main error type for cache guard operations
#[derive(Error, Debug)]
pub enum GuardError {
    /// Connection error - the remote cache is unreachable or dropped the connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The remote cache rejected or failed a command
    #[error("Command error: {0}")]
    CommandError(String),

    /// Malformed envelope contents or a value that cannot be encoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The source-of-truth loader failed
    #[error("Loader error: {0}")]
    LoaderError(#[source] anyhow::Error),

    /// Gave up waiting for a rebuild lock
    #[error("Lock '{lock}' still contended after {attempts} attempts")]
    LockRetriesExhausted { lock: String, attempts: u32 },

    /// A backoff wait was interrupted by client shutdown
    #[error("Wait for lock '{lock}' interrupted after {waited:?}")]
    InterruptedWait { lock: String, waited: Duration },

    /// The rebuild executor refused a job
    #[error("Rebuild rejected for '{key}': {reason}")]
    RebuildRejected { key: String, reason: String },

    /// Key is empty or falls inside a reserved namespace
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Per-period counter no longer fits in the sequence bits
    #[error("Sequence overflow in scope '{scope}': counter reached {value}")]
    SequenceOverflow { scope: String, value: i64 },

    /// System clock is before the ID epoch
    #[error("Clock error: {0}")]
    ClockError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl GuardError {
    /// Whether the error means the remote cache itself is unavailable
    pub fn is_connection_error(&self) -> bool {
        matches!(self, GuardError::ConnectionError(_))
    }
}

/// Result type alias for cache guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<redis::RedisError> for GuardError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            GuardError::ConnectionError(e.to_string())
        } else {
            GuardError::CommandError(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(e: serde_json::Error) -> Self {
        GuardError::SerializationError(e.to_string())
    }
}

impl From<String> for GuardError {
    fn from(s: String) -> Self {
        GuardError::Other(s)
    }
}

impl From<&str> for GuardError {
    fn from(s: &str) -> Self {
        GuardError::Other(s.to_string())
    }
}
