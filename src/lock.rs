//! Distributed mutex with fenced release
//!
//! A lock is a key under the `lock:` namespace holding the owner's token,
//! created with an atomic set-if-absent and a lease. Release is a
//! server-side compare-and-delete, so an owner whose lease already lapsed
//! (and whose lock was re-acquired by someone else) cannot delete the new
//! holder's record.
//!
//! There is no lease renewal: `lease_ttl` must exceed the longest critical
//! section it protects.
//!
//! ```rust
//! use ouroboros_guard::{DistributedMutex, InMemoryCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> ouroboros_guard::Result<()> {
//! let cache = Arc::new(InMemoryCache::new());
//! let mutex = DistributedMutex::new(cache);
//!
//! if mutex.try_acquire("shop:1", Duration::from_secs(10)).await? {
//!     // ... critical section ...
//!     mutex.release("shop:1").await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::cache::types::lock_key;
use crate::error::Result;
use crate::remote::RemoteCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of this process, fixed for its lifetime
fn process_id() -> Uuid {
    static PROCESS_ID: OnceLock<Uuid> = OnceLock::new();
    *PROCESS_ID.get_or_init(Uuid::new_v4)
}

/// Fencing token identifying one lock owner
///
/// Combines a per-process UUID with a random per-owner nonce, so tokens
/// never collide across processes, process restarts or owners inside one
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    /// Random identity of the owning process
    pub process: Uuid,

    /// Random identity of the owner within the process
    pub nonce: u64,
}

impl LockToken {
    /// Mint a token for a new owner in this process
    pub fn generate() -> Self {
        Self {
            process: process_id(),
            nonce: rand::random(),
        }
    }

    /// Bytes stored in the lock record
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:016x}", self.process.simple(), self.nonce)
    }
}

/// Named, lease-bounded advisory lock shared through a [`RemoteCache`]
///
/// Each `DistributedMutex` value is one owner: it holds a single
/// [`LockToken`] and can hold any number of differently named locks.
/// Use [`DistributedMutex::new_owner`] to get an independent owner over the
/// same cache.
#[derive(Clone)]
pub struct DistributedMutex {
    cache: Arc<dyn RemoteCache>,
    token: LockToken,
}

impl DistributedMutex {
    /// Create a new owner
    pub fn new(cache: Arc<dyn RemoteCache>) -> Self {
        Self::with_token(cache, LockToken::generate())
    }

    /// Create an owner with an explicit token
    pub fn with_token(cache: Arc<dyn RemoteCache>, token: LockToken) -> Self {
        Self { cache, token }
    }

    /// A different owner sharing this mutex's cache
    pub fn new_owner(&self) -> Self {
        Self::new(Arc::clone(&self.cache))
    }

    /// This owner's fencing token
    pub fn token(&self) -> LockToken {
        self.token
    }

    /// Try once to take `name` for `lease_ttl`
    ///
    /// Returns `Ok(false)` when another owner holds the lock; never waits.
    pub async fn try_acquire(&self, name: &str, lease_ttl: Duration) -> Result<bool> {
        let key = lock_key(name)?;
        let acquired = self
            .cache
            .set_if_absent_with_ttl(&key, &self.token.to_bytes(), lease_ttl)
            .await?;

        if acquired {
            debug!("Acquired lock {} (lease {:?})", key, lease_ttl);
        } else {
            debug!("Lock {} is held by another owner", key);
        }
        Ok(acquired)
    }

    /// Release `name` if this owner still holds it
    ///
    /// Returns `Ok(true)` when the record was deleted and `Ok(false)` when
    /// the lock was absent or held by a different token (a safe no-op).
    pub async fn release(&self, name: &str) -> Result<bool> {
        let key = lock_key(name)?;
        let deleted = self
            .cache
            .compare_and_delete(&key, &self.token.to_bytes())
            .await?;

        if deleted > 0 {
            debug!("Released lock {}", key);
            Ok(true)
        } else {
            warn!(
                "Lock {} was not held by {} at release (lease expired or taken over)",
                key, self.token
            );
            Ok(false)
        }
    }

    /// Whether this owner currently holds `name`
    pub async fn is_held(&self, name: &str) -> Result<bool> {
        let key = lock_key(name)?;
        let current = self.cache.get(&key).await?;
        Ok(current.as_deref() == Some(self.token.to_bytes().as_slice()))
    }
}

impl fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("token", &self.token)
            .finish()
    }
}
