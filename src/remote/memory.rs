//! In-process remote cache with physical TTLs

use crate::error::{GuardError, Result};
use crate::remote::RemoteCache;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A stored value and its physical deadline
#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| deadline <= now)
    }
}

/// Expiry instant for `ttl` from `now`; TTLs past the clock's range never expire
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// Process-local [`RemoteCache`]
///
/// Each operation holds one lock over the whole map, so every call is atomic
/// with respect to every other call, matching the single-command atomicity
/// of a real cache server. Expired entries are dropped lazily on access and
/// in bulk by [`InMemoryCache::purge_expired`].
///
/// [`InMemoryCache::set_available`] simulates an outage: while unavailable
/// every operation fails with [`GuardError::ConnectionError`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, StoredValue>>>,
    offline: Arc<AtomicBool>,
    commands: Arc<AtomicU64>,
}

impl InMemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        if available {
            info!("In-memory cache back online");
        } else {
            warn!("In-memory cache marked unavailable");
        }
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Number of commands served so far
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Number of live (unexpired) keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|v| !v.is_expired(now)).count()
    }

    /// Whether no live keys remain
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining physical TTL of `key`; `None` when absent or persistent
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|v| !v.is_expired(now))
            .and_then(|v| v.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Remove all expired entries, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, v| !v.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            debug!("Purged {} expired entries", removed);
        }
        removed
    }

    fn check_online(&self) -> Result<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if self.offline.load(Ordering::SeqCst) {
            return Err(GuardError::ConnectionError(
                "in-memory cache is unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, StoredValue>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut StoredValue> {
        if entries.get(key).map_or(false, |v| v.is_expired(now)) {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl RemoteCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, Instant::now()).map(|v| v.bytes.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_online()?;
        let stored = StoredValue {
            bytes: value.to_vec(),
            expires_at: deadline(Instant::now(), ttl),
        };
        self.entries.lock().await.insert(key.to_string(), stored);
        Ok(())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_online()?;
        let stored = StoredValue {
            bytes: value.to_vec(),
            expires_at: None,
        };
        self.entries.lock().await.insert(key.to_string(), stored);
        Ok(())
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let current = match Self::live(&mut entries, key, now) {
            Some(stored) => std::str::from_utf8(&stored.bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    GuardError::CommandError(format!("value at '{}' is not an integer", key))
                })?,
            None => 0,
        };

        let next = current.checked_add(1).ok_or_else(|| {
            GuardError::CommandError(format!("increment would overflow at '{}'", key))
        })?;

        let expires_at = entries.get(key).and_then(|v| v.expires_at);
        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<i64> {
        self.check_online()?;
        let mut entries = self.entries.lock().await;

        let owned = Self::live(&mut entries, key, Instant::now())
            .map_or(false, |stored| stored.bytes == expected);

        if owned {
            entries.remove(key);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).map_or(false, |v| !v.is_expired(now)))
    }
}

/// Background task that periodically drops expired entries
pub async fn start_auto_cleanup(cache: InMemoryCache, interval: Duration) {
    info!("Starting in-memory cache cleanup task (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;
        let removed = cache.purge_expired().await;
        if removed > 0 {
            debug!("Auto cleanup removed {} entries", removed);
        }
    }
}
