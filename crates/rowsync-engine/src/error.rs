//! Error types for the replication engine
//!
//! Includes error classification for run-level retry and alerting. A batch
//! abort requested by conflict policy is not an error: it is reported as
//! [`ApplyOutcome::BatchAborted`](crate::apply::ApplyOutcome::BatchAborted).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::model::BatchStatus;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Change event store or batch registry failures
    Store,
    /// Target database failures
    Target,
    /// Unresolved data conflicts
    Conflict,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Timeouts and lock service failures
    Network,
    /// Illegal state transitions, unknown batches
    State,
    /// Malformed row data
    Data,
}

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Change event store or batch registry failure
    #[error("Store error: {0}")]
    Store(String),

    /// Target database failure
    #[error("Target error: {0}")]
    Target(#[from] rowsync_rdbc::Error),

    /// A row conflict that no configured resolution could settle
    #[error("Conflict in batch {batch_id} on {table} at line {line_number}: {message}")]
    Conflict {
        /// Batch being applied
        batch_id: i64,
        /// Target table
        table: String,
        /// 1-based position of the row in the batch
        line_number: u64,
        /// Description of the conflict
        message: String,
    },

    /// I/O boundary exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Batch status change outside the allowed lifecycle
    #[error("Illegal status transition for batch {batch_id}: {from} -> {to}")]
    IllegalTransition {
        /// Batch whose status was changed
        batch_id: i64,
        /// Current status
        from: BatchStatus,
        /// Requested status
        to: BatchStatus,
    },

    /// Batch id unknown to the registry
    #[error("Batch not found: {0}")]
    BatchNotFound(i64),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Row values that cannot be interpreted
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Cluster lock service failure
    #[error("Lock error: {0}")]
    Lock(String),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a new store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid data error
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) | Self::Io(_) => ErrorCategory::Store,
            Self::Target(_) => ErrorCategory::Target,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Timeout(_) | Self::Lock(_) => ErrorCategory::Network,
            Self::IllegalTransition { .. } | Self::BatchNotFound(_) => ErrorCategory::State,
            Self::Config(_) | Self::Yaml(_) => ErrorCategory::Configuration,
            Self::InvalidData(_) => ErrorCategory::Data,
        }
    }

    /// Check if this error is retriable at run level.
    ///
    /// Returns true for transient errors that may succeed on the next cycle.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Lock(_) | Self::Store(_) => true,
            Self::Target(e) => e.is_retriable(),
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Conflict { .. }
            | Self::IllegalTransition { .. }
            | Self::BatchNotFound(_)
            | Self::Config(_)
            | Self::InvalidData(_)
            | Self::Yaml(_) => false,
        }
    }
}

/// Bound an I/O call by `timeout`; a zero timeout waits indefinitely
pub(crate) async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        EngineError::timeout(format!("{} exceeded {}ms", what, timeout.as_millis()))
    })?
}
