//! Supervised background tasks.
//!
//! Every background job the broker starts (readiness watches, unbind
//! notifications) goes through a `TaskPool`. Each job is tracked until it
//! finishes; a supervisor task awaits it and logs panics. On shutdown the
//! pool flips a watch channel, waits for jobs to wind down, then aborts
//! whatever is left.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

struct TaskSlot {
    label: String,
    abort: AbortHandle,
}

#[derive(Clone)]
pub struct TaskPool {
    /// Running jobs: task id → slot.
    tasks: Arc<RwLock<HashMap<u64, TaskSlot>>>,
    next_id: Arc<AtomicU64>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Start a job. The closure receives the pool's shutdown signal and
    /// should return promptly once it flips to `true`.
    ///
    /// Returns false, without running the job, once shutdown has begun.
    pub async fn spawn<F, Fut>(&self, label: impl Into<String>, job: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        if self.is_shutting_down() {
            warn!(%label, "task pool is shutting down, job dropped");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(job(self.shutdown_rx()));

        // Register before the supervisor can observe completion.
        let mut tasks = self.tasks.write().await;
        tasks.insert(
            id,
            TaskSlot {
                label: label.clone(),
                abort: handle.abort_handle(),
            },
        );

        drop(tasks);
        debug!(task_id = id, %label, "task spawned");

        let registry = self.tasks.clone();
        tokio::spawn(async move {
            let outcome = handle.await;
            registry.write().await.remove(&id);
            match outcome {
                Ok(()) => debug!(%label, "task finished"),
                Err(e) if e.is_panic() => error!(%label, "task panicked"),
                Err(_) => debug!(%label, "task cancelled"),
            }
        });

        true
    }

    /// A fresh receiver for the pool's shutdown signal.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Labels of jobs still running.
    pub async fn active(&self) -> Vec<String> {
        let tasks = self.tasks.read().await;
        let mut labels: Vec<String> = tasks.values().map(|slot| slot.label.clone()).collect();
        labels.sort();
        labels
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait until no job is running. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_empty().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Signal every job to stop, give them `grace` to finish, then abort
    /// stragglers. Returns how many jobs had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutdown_tx.send_replace(true);

        if self.wait_idle(grace).await {
            info!("all background tasks stopped");
            return 0;
        }

        let tasks = self.tasks.read().await;
        for slot in tasks.values() {
            warn!(label = %slot.label, "aborting background task");
            slot.abort.abort();
        }
        tasks.len()
    }
}
