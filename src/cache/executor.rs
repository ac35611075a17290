//! Bounded pool for background cache rebuilds
//!
//! Jobs are submitted under a key (normally the cache key being rebuilt)
//! and run on a fixed set of worker tasks fed by a bounded queue. Admission
//! is explicit:
//!
//! - a job whose key is already queued or running is coalesced (dropped)
//! - a job arriving while the queue is full is rejected
//!
//! Submitting never waits. A job that fails or panics is logged and counted;
//! it never takes its worker down.

use crate::error::{GuardError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Job = BoxFuture<'static, Result<()>>;

struct QueuedJob {
    key: String,
    job: Job,
}

/// Outcome of an accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for a worker
    Accepted,
    /// A job for the same key is already pending; this one was dropped
    Coalesced,
}

/// Counters for the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RebuildStats {
    pub submitted: u64,
    pub coalesced: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

impl RebuildStats {
    /// Jobs accepted but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    coalesced: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Fixed-size worker pool for rebuild jobs
pub struct AsyncRebuildExecutor {
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    pending: Arc<Mutex<HashSet<String>>>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncRebuildExecutor {
    /// Spawn `workers` worker tasks sharing a queue of `queue_capacity` jobs
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<QueuedJob>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let counters = Arc::new(Counters::default());

        info!(
            "Starting rebuild executor ({} workers, queue capacity {})",
            workers, queue_capacity
        );

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&pending),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            pending,
            counters,
            workers: Mutex::new(handles),
        }
    }

    /// Submit a job for `key` without waiting for it to run
    ///
    /// Fails with [`GuardError::RebuildRejected`] when the queue is full or
    /// the executor has been shut down; the job is dropped unrun.
    pub async fn submit<F>(&self, key: impl Into<String>, job: F) -> Result<SubmitOutcome>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let key = key.into();
        let sender_guard = self.sender.lock().await;
        let sender = match sender_guard.as_ref() {
            Some(sender) => sender,
            None => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(GuardError::RebuildRejected {
                    key,
                    reason: "executor is shut down".to_string(),
                });
            }
        };

        let mut pending = self.pending.lock().await;
        if pending.contains(&key) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("Rebuild for {} already pending, coalescing", key);
            return Ok(SubmitOutcome::Coalesced);
        }

        let queued = QueuedJob {
            key: key.clone(),
            job: job.boxed(),
        };

        match sender.try_send(queued) {
            Ok(()) => {
                pending.insert(key.clone());
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                debug!("Queued rebuild for {}", key);
                Ok(SubmitOutcome::Accepted)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Rebuild queue full, rejecting job for {}", key);
                Err(GuardError::RebuildRejected {
                    key,
                    reason: "queue is full".to_string(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(GuardError::RebuildRejected {
                    key,
                    reason: "workers have stopped".to_string(),
                })
            }
        }
    }

    /// Whether a job for `key` is queued or running
    pub async fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().await.contains(key)
    }

    /// Snapshot of the executor counters
    pub fn stats(&self) -> RebuildStats {
        RebuildStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs, let queued ones finish, and wait for the workers
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().await.take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Rebuild worker terminated abnormally: {}", e);
            }
        }

        info!("Rebuild executor stopped ({:?})", self.stats());
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    pending: Arc<Mutex<HashSet<String>>>,
    counters: Arc<Counters>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(QueuedJob { key, job }) = next else {
            break;
        };

        debug!("Worker {} running rebuild for {}", worker_id, key);

        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!("Rebuild for {} completed", key);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Rebuild for {} failed: {}", key, e);
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Rebuild for {} panicked", key);
            }
        }

        pending.lock().await.remove(&key);
    }

    debug!("Worker {} exiting", worker_id);
}
