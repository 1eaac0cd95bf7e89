//! Cluster-wide mutual exclusion
//!
//! Builder and apply runs hold a named lock for their whole duration so that
//! only one process in a fleet performs that work at a time. Failing to get
//! the lock means "skip this cycle", never an error.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

/// Cluster lock service
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Try to take the lock, waiting up to `timeout`; `false` if it is held elsewhere
    async fn acquire(&self, action: &str, timeout: Duration) -> Result<bool>;

    /// Release a lock taken with [`acquire`](ClusterLock::acquire)
    async fn release(&self, action: &str) -> Result<()>;
}

/// Result of a lock-guarded run
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    /// The lock was held elsewhere; nothing was done
    Skipped,
    /// The work ran to completion
    Ran(T),
}

impl<T> RunOutcome<T> {
    /// Whether the run was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// The run's value, if it ran
    pub fn ran(self) -> Option<T> {
        match self {
            Self::Skipped => None,
            Self::Ran(value) => Some(value),
        }
    }
}

/// Run `work` while holding `action`.
///
/// The lock is released whether the work succeeds or fails.
pub async fn with_cluster_lock<T, F>(
    lock: &dyn ClusterLock,
    action: &str,
    timeout: Duration,
    work: F,
) -> Result<RunOutcome<T>>
where
    F: Future<Output = Result<T>>,
{
    if !lock.acquire(action, timeout).await? {
        debug!(action, "Cluster lock held elsewhere, skipping");
        return Ok(RunOutcome::Skipped);
    }

    let result = work.await;
    let released = lock.release(action).await;
    let value = result?;
    released?;
    Ok(RunOutcome::Ran(value))
}

/// Process-local [`ClusterLock`]
#[derive(Debug, Default)]
pub struct MemoryClusterLock {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

impl MemoryClusterLock {
    /// Create a lock service with nothing held
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `action` is currently held
    pub fn is_held(&self, action: &str) -> bool {
        self.held.lock().contains(action)
    }
}

#[async_trait]
impl ClusterLock for MemoryClusterLock {
    async fn acquire(&self, action: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            if self.held.lock().insert(action.to_string()) {
                return Ok(true);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn release(&self, action: &str) -> Result<()> {
        self.held.lock().remove(action);
        self.released.notify_waiters();
        Ok(())
    }
}
