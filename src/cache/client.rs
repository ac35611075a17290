//! Cache-aside read strategies guarding a slow source of truth
//!
//! Three read paths share one envelope format:
//!
//! - [`CacheResilienceClient::get_pass_through`]: negative caching against
//!   lookups for records that do not exist
//! - [`CacheResilienceClient::get_with_mutex`]: one loader per identifier,
//!   other callers back off and re-read
//! - [`CacheResilienceClient::get_with_logical_expiry`]: stale values are
//!   served immediately while one background job refreshes them

use crate::cache::config::{validate_value_ttl, GuardConfig};
use crate::cache::envelope::{encode_empty, Envelope};
use crate::cache::executor::{AsyncRebuildExecutor, RebuildStats, SubmitOutcome};
use crate::cache::types::{cache_key, validate_value_key, CacheKey, GuardMetrics, GuardStats};
use crate::error::{GuardError, Result};
use crate::lock::DistributedMutex;
use crate::remote::{InMemoryCache, RedisCache, RemoteCache};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of consulting the cache alone
enum Lookup<T> {
    Hit(T),
    Negative,
    Miss,
}

/// Orchestrates reads and writes through a [`RemoteCache`]
///
/// Cloning is cheap: clones share the cache connection, the rebuild
/// executor and the statistics.
#[derive(Clone)]
pub struct CacheResilienceClient {
    cache: Arc<dyn RemoteCache>,
    config: Arc<GuardConfig>,
    executor: Arc<AsyncRebuildExecutor>,
    metrics: Arc<GuardMetrics>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CacheResilienceClient {
    /// Create a client over an existing cache backend
    ///
    /// Spawns the rebuild workers, so it must be called inside a tokio runtime.
    pub fn new(cache: Arc<dyn RemoteCache>, config: GuardConfig) -> Result<Self> {
        config.validate()?;
        info!("Initializing cache resilience client with config: {:?}", config);

        let executor = AsyncRebuildExecutor::new(config.rebuild_workers, config.rebuild_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            cache,
            config: Arc::new(config),
            executor: Arc::new(executor),
            metrics: Arc::new(GuardMetrics::default()),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Connect to the Redis server named in `config.redis_url`
    pub async fn connect(config: GuardConfig) -> Result<Self> {
        let cache = RedisCache::connect(&config.redis_url).await?;
        Self::new(Arc::new(cache), config)
    }

    /// Client over a fresh process-local cache
    pub fn in_memory(config: GuardConfig) -> Result<Self> {
        Self::new(Arc::new(InMemoryCache::new()), config)
    }

    /// The underlying cache backend
    pub fn cache(&self) -> &Arc<dyn RemoteCache> {
        &self.cache
    }

    /// The active configuration
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// A new lock owner over this client's cache
    pub fn mutex(&self) -> DistributedMutex {
        DistributedMutex::new(Arc::clone(&self.cache))
    }

    /// Read statistics
    pub fn stats(&self) -> GuardStats {
        self.metrics.snapshot()
    }

    /// Background rebuild statistics
    pub fn rebuild_stats(&self) -> RebuildStats {
        self.executor.stats()
    }

    /// Interrupt callers waiting in [`get_with_mutex`](Self::get_with_mutex)
    /// and drain the rebuild executor
    pub async fn shutdown(&self) {
        info!("Shutting down cache resilience client");
        self.shutdown_tx.send_replace(true);
        self.executor.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Store `value` under `key` as a plain value expiring after `ttl`
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        validate_value_key(key)?;
        let bytes = Envelope::Value { data: value }.encode()?;
        self.cache.set_with_ttl(key, &bytes, ttl).await?;
        debug!("Stored value for {} (ttl {:?})", key, ttl);
        Ok(())
    }

    /// Store `value` under `key` with a logical expiry `logical_ttl` from now
    ///
    /// The entry itself has no physical TTL.
    pub async fn set_with_logical_expiry<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        logical_ttl: Duration,
    ) -> Result<()> {
        validate_value_key(key)?;
        let bytes = Envelope::with_logical_expiry(value, logical_ttl).encode()?;
        self.cache.set(key, &bytes).await?;
        debug!("Stored logical entry for {} (expires in {:?})", key, logical_ttl);
        Ok(())
    }

    /// Drop the cached entry for `key`
    ///
    /// Call after every write to the source of truth.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        validate_value_key(key)?;
        let removed = self.cache.delete(key).await?;
        debug!("Invalidated {} (present: {})", key, removed);
        Ok(removed)
    }

    /// Drop the cached entry for `key_prefix` + `id`
    pub async fn invalidate_entity(&self, key_prefix: &str, id: impl Display) -> Result<bool> {
        let key = cache_key(key_prefix, id)?;
        self.invalidate(&key).await
    }

    /// Load an entity from the source and store it as a logical entry
    ///
    /// Used to warm hot keys before they are served with
    /// [`get_with_logical_expiry`](Self::get_with_logical_expiry). Returns
    /// false (and writes nothing) when the source has no record.
    pub async fn preload_with_logical_expiry<T, ID, F, Fut>(
        &self,
        key_prefix: &str,
        id: ID,
        loader: F,
        logical_ttl: Duration,
    ) -> Result<bool>
    where
        T: Serialize,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let key = cache_key(key_prefix, &id)?;
        GuardMetrics::incr(&self.metrics.loads);

        match loader(id).await.map_err(GuardError::LoaderError)? {
            Some(value) => {
                self.set_with_logical_expiry(&key, &value, logical_ttl).await?;
                info!("Preloaded {} (logical ttl {:?})", key, logical_ttl);
                Ok(true)
            }
            None => {
                debug!("Nothing to preload for {}", key);
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Read strategies
    // ------------------------------------------------------------------

    /// Read with negative caching
    ///
    /// On a miss the loader runs once; an absent record is remembered as a
    /// negative entry for a TTL strictly shorter than `ttl`, so repeated
    /// lookups for it never reach the source until that entry expires.
    pub async fn get_pass_through<T, ID, F, Fut>(
        &self,
        key_prefix: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let key = cache_key(key_prefix, &id)?;
        validate_value_ttl(ttl)?;

        match self.lookup::<T>(&key).await? {
            Lookup::Hit(value) => Ok(Some(value)),
            Lookup::Negative => Ok(None),
            Lookup::Miss => self.load_and_fill(&key, id, loader, ttl).await,
        }
    }

    /// Read with a per-identifier rebuild lock
    ///
    /// On a miss only the lock holder calls the loader; everyone else backs
    /// off (capped exponential) and re-reads. Gives up with
    /// [`GuardError::LockRetriesExhausted`] after the configured attempts and
    /// with [`GuardError::InterruptedWait`] if the client shuts down while
    /// waiting. The lock is released on every exit path of the holder,
    /// including a panicking loader.
    pub async fn get_with_mutex<T, ID, F, Fut>(
        &self,
        key_prefix: &str,
        lock_prefix: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        ID: Display,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let key = cache_key(key_prefix, &id)?;
        validate_value_ttl(ttl)?;
        let lock_name = format!("{}{}", lock_prefix, id);
        let policy = &self.config.lock_retry;
        let started = Instant::now();

        for attempt in 1..=policy.max_attempts {
            // Only the first read of a waiting caller counts towards the stats
            let found = if attempt == 1 {
                self.lookup::<T>(&key).await?
            } else {
                self.peek::<T>(&key).await?
            };

            match found {
                Lookup::Hit(value) => return Ok(Some(value)),
                Lookup::Negative => return Ok(None),
                Lookup::Miss => {}
            }

            let owner = self.mutex();
            if owner.try_acquire(&lock_name, self.config.lock_lease_ttl).await? {
                let outcome = AssertUnwindSafe(self.fill_under_lock(&key, id, loader, ttl))
                    .catch_unwind()
                    .await;
                self.release_quietly(&owner, &lock_name).await;

                return match outcome {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
            }

            GuardMetrics::incr(&self.metrics.lock_contention);
            if attempt == policy.max_attempts {
                break;
            }

            let delay = policy.backoff_for(attempt);
            debug!(
                "Lock {} busy (attempt {}/{}), retrying after {:?}",
                lock_name, attempt, policy.max_attempts, delay
            );
            self.wait_or_interrupt(&lock_name, delay, started).await?;
        }

        warn!(
            "Gave up on lock {} after {} attempts ({:?})",
            lock_name,
            policy.max_attempts,
            started.elapsed()
        );
        Err(GuardError::LockRetriesExhausted {
            lock: lock_name,
            attempts: policy.max_attempts,
        })
    }

    /// Read entries that carry their own logical expiry
    ///
    /// Never loads on a miss: entries are expected to be preloaded, and a
    /// missing entry reads as "not found". A logically expired value is
    /// returned as-is; if this caller wins the identifier's lock, a
    /// background job reloads it with a fresh expiry of `logical_ttl`.
    /// Callers never wait for that job.
    pub async fn get_with_logical_expiry<T, ID, F, Fut>(
        &self,
        key_prefix: &str,
        lock_prefix: &str,
        id: ID,
        loader: F,
        logical_ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        ID: Display + Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        let key = cache_key(key_prefix, &id)?;

        let stale = match self.read_envelope::<T>(&key).await? {
            None => {
                GuardMetrics::incr(&self.metrics.misses);
                debug!("Logical entry missing: {}", key);
                return Ok(None);
            }
            Some(Envelope::Empty) => {
                GuardMetrics::incr(&self.metrics.negative_hits);
                return Ok(None);
            }
            Some(envelope) if !envelope.is_logically_expired() => {
                GuardMetrics::incr(&self.metrics.hits);
                debug!("Cache hit: {}", key);
                return Ok(envelope.into_data());
            }
            Some(envelope) => envelope.into_data(),
        };

        GuardMetrics::incr(&self.metrics.hits);
        GuardMetrics::incr(&self.metrics.stale_served);

        let lock_name = format!("{}{}", lock_prefix, id);
        let owner = self.mutex();

        match owner.try_acquire(&lock_name, self.config.lock_lease_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                GuardMetrics::incr(&self.metrics.lock_contention);
                debug!("Rebuild of {} already owned elsewhere, serving stale", key);
                return Ok(stale);
            }
            Err(e) => {
                warn!("Could not take rebuild lock {}: {}; serving stale", lock_name, e);
                return Ok(stale);
            }
        }

        // Another caller may have finished a rebuild between our read and our lock
        if let Ok(Some(envelope)) = self.read_envelope::<T>(&key).await {
            if !envelope.is_empty() && !envelope.is_logically_expired() {
                self.release_quietly(&owner, &lock_name).await;
                debug!("{} was refreshed concurrently", key);
                return Ok(envelope.into_data());
            }
        }

        let job = self.clone().rebuild_logical(
            key.clone(),
            id,
            loader,
            logical_ttl,
            owner.clone(),
            lock_name.clone(),
        );

        match self.executor.submit(key.clone(), job).await {
            Ok(SubmitOutcome::Accepted) => {
                GuardMetrics::incr(&self.metrics.rebuilds_scheduled);
                debug!("Scheduled rebuild of {}", key);
            }
            Ok(SubmitOutcome::Coalesced) => {
                self.release_quietly(&owner, &lock_name).await;
            }
            Err(e) => {
                warn!("{}; serving stale {}", e, key);
                self.release_quietly(&owner, &lock_name).await;
            }
        }

        Ok(stale)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Read and decode the envelope under `key`
    ///
    /// A malformed envelope is evicted (best effort) and reported as a
    /// serialization error for this read only.
    async fn read_envelope<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Envelope<T>>> {
        let bytes = match self.cache.get(key).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match Envelope::decode(&bytes) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                GuardMetrics::incr(&self.metrics.serialization_faults);
                warn!("Evicting malformed entry {}: {}", key, e);
                if let Err(delete_err) = self.cache.delete(key).await {
                    warn!("Failed to evict malformed entry {}: {}", key, delete_err);
                }
                Err(e)
            }
        }
    }

    /// Consult the cache without touching the read statistics
    async fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>> {
        Ok(match self.read_envelope::<T>(key).await? {
            Some(envelope) => match envelope.into_data() {
                Some(value) => Lookup::Hit(value),
                None => Lookup::Negative,
            },
            None => Lookup::Miss,
        })
    }

    /// Consult the cache and record the outcome
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>> {
        let found = self.peek::<T>(key).await?;

        match &found {
            Lookup::Hit(_) => {
                GuardMetrics::incr(&self.metrics.hits);
                debug!("Cache hit: {}", key);
            }
            Lookup::Negative => {
                GuardMetrics::incr(&self.metrics.negative_hits);
                debug!("Negative cache hit: {}", key);
            }
            Lookup::Miss => {
                GuardMetrics::incr(&self.metrics.misses);
                debug!("Cache miss: {}", key);
            }
        }

        Ok(found)
    }

    async fn load_and_fill<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        GuardMetrics::incr(&self.metrics.loads);

        match loader(id).await.map_err(GuardError::LoaderError)? {
            Some(value) => {
                let bytes = Envelope::Value { data: &value }.encode()?;
                self.cache
                    .set_with_ttl(key, &bytes, self.config.ttl_with_jitter(ttl))
                    .await?;
                debug!("Filled {} from source", key);
                Ok(Some(value))
            }
            None => {
                let negative_ttl = self.config.negative_ttl(ttl);
                self.cache.set_with_ttl(key, &encode_empty(), negative_ttl).await?;
                debug!("Source has no record for {}, cached negative for {:?}", key, negative_ttl);
                Ok(None)
            }
        }
    }

    async fn fill_under_lock<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        match self.peek::<T>(key).await? {
            Lookup::Hit(value) => Ok(Some(value)),
            Lookup::Negative => Ok(None),
            Lookup::Miss => self.load_and_fill(key, id, loader, ttl).await,
        }
    }

    async fn rebuild_logical<T, ID, F, Fut>(
        self,
        key: CacheKey,
        id: ID,
        loader: F,
        logical_ttl: Duration,
        owner: DistributedMutex,
        lock_name: String,
    ) -> Result<()>
    where
        T: Serialize + Send + Sync + 'static,
        ID: Send + 'static,
        F: FnOnce(ID) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        let outcome = AssertUnwindSafe(self.refresh_logical(&key, id, loader, logical_ttl))
            .catch_unwind()
            .await;
        self.release_quietly(&owner, &lock_name).await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(GuardError::Other(format!("rebuild of '{}' panicked", key))),
        }
    }

    async fn refresh_logical<T, ID, F, Fut>(
        &self,
        key: &str,
        id: ID,
        loader: F,
        logical_ttl: Duration,
    ) -> Result<()>
    where
        T: Serialize + Send + Sync,
        F: FnOnce(ID) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        match loader(id).await.map_err(GuardError::LoaderError)? {
            Some(value) => {
                self.set_with_logical_expiry(key, &value, logical_ttl).await?;
                debug!("Rebuilt {}", key);
            }
            None => {
                self.cache.delete(key).await?;
                info!("Source no longer has {}, dropped logical entry", key);
            }
        }
        Ok(())
    }

    async fn release_quietly(&self, owner: &DistributedMutex, lock_name: &str) {
        if let Err(e) = owner.release(lock_name).await {
            error!("Failed to release lock {}: {} (lease will expire)", lock_name, e);
        }
    }

    async fn wait_or_interrupt(&self, lock_name: &str, delay: Duration, started: Instant) -> Result<()> {
        let mut shutdown = self.shutdown_rx.clone();
        let interrupted = || GuardError::InterruptedWait {
            lock: lock_name.to_string(),
            waited: started.elapsed(),
        };

        if *shutdown.borrow() {
            return Err(interrupted());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = shutdown.changed() => Err(interrupted()),
        }
    }
}
