//! Batch registry
//!
//! Durable state of every batch. The builder creates batches, the transport
//! marks them sent, the apply engine marks them OK or ERROR, and operators
//! query and override status. Batches are never deleted here; purging is
//! somebody else's job.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::model::{BatchStatus, OutgoingBatch};

/// Batch state storage
#[async_trait]
pub trait BatchRegistry: Send + Sync {
    /// Create a batch with a generated id
    async fn create_batch(
        &self,
        node_id: &str,
        channel_id: &str,
        status: BatchStatus,
    ) -> Result<OutgoingBatch>;

    /// Record the number of events tagged with a batch
    async fn record_created(&self, batch_id: i64, event_count: u64) -> Result<()>;

    /// Look up a batch
    async fn get(&self, batch_id: i64) -> Result<Option<OutgoingBatch>>;

    /// All batches for a destination node, ordered by batch id
    async fn list_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>>;

    /// Batches in ERROR, ordered by batch id, at most `max_rows`
    async fn list_error_batches(&self, max_rows: usize) -> Result<Vec<OutgoingBatch>>;

    /// Batches with ids in `start..=end`
    async fn batch_range(&self, start: i64, end: i64) -> Result<Vec<OutgoingBatch>>;

    /// Change status along the batch lifecycle
    async fn transition(
        &self,
        batch_id: i64,
        to: BatchStatus,
        error_message: Option<String>,
    ) -> Result<OutgoingBatch>;

    /// Operator override: set any status without lifecycle checks
    async fn set_batch_status(&self, batch_id: i64, status: BatchStatus) -> Result<OutgoingBatch>;

    /// Mark a batch as shipped
    async fn mark_sent(&self, batch_id: i64) -> Result<OutgoingBatch> {
        self.transition(batch_id, BatchStatus::Sent, None).await
    }

    /// Mark a batch as applied
    async fn mark_ok(&self, batch_id: i64) -> Result<OutgoingBatch> {
        self.transition(batch_id, BatchStatus::Ok, None).await
    }

    /// Mark a batch as failed
    async fn mark_error(&self, batch_id: i64, message: &str) -> Result<OutgoingBatch> {
        self.transition(batch_id, BatchStatus::Error, Some(message.to_string()))
            .await
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    batches: BTreeMap<i64, OutgoingBatch>,
    last_id: i64,
}

/// In-memory [`BatchRegistry`] with a sequential id generator
#[derive(Debug, Default)]
pub struct MemoryBatchRegistry {
    state: RwLock<RegistryState>,
}

impl MemoryBatchRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches ever created
    pub fn len(&self) -> usize {
        self.state.read().batches.len()
    }

    /// Whether no batch was created yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BatchRegistry for MemoryBatchRegistry {
    async fn create_batch(
        &self,
        node_id: &str,
        channel_id: &str,
        status: BatchStatus,
    ) -> Result<OutgoingBatch> {
        let mut state = self.state.write();
        state.last_id += 1;
        let batch = OutgoingBatch::new(state.last_id, node_id, channel_id, status);
        state.batches.insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    async fn record_created(&self, batch_id: i64, event_count: u64) -> Result<()> {
        let mut state = self.state.write();
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))?;
        batch.event_count = event_count;
        Ok(())
    }

    async fn get(&self, batch_id: i64) -> Result<Option<OutgoingBatch>> {
        Ok(self.state.read().batches.get(&batch_id).cloned())
    }

    async fn list_batches(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        Ok(self
            .state
            .read()
            .batches
            .values()
            .filter(|b| b.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn list_error_batches(&self, max_rows: usize) -> Result<Vec<OutgoingBatch>> {
        Ok(self
            .state
            .read()
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Error)
            .take(max_rows)
            .cloned()
            .collect())
    }

    async fn batch_range(&self, start: i64, end: i64) -> Result<Vec<OutgoingBatch>> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .read()
            .batches
            .range(start..=end)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn transition(
        &self,
        batch_id: i64,
        to: BatchStatus,
        error_message: Option<String>,
    ) -> Result<OutgoingBatch> {
        let mut state = self.state.write();
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))?;

        if !batch.status.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                batch_id,
                from: batch.status,
                to,
            });
        }
        batch.status = to;
        if to == BatchStatus::Error {
            batch.error_message = error_message;
        }
        Ok(batch.clone())
    }

    async fn set_batch_status(&self, batch_id: i64, status: BatchStatus) -> Result<OutgoingBatch> {
        let mut state = self.state.write();
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))?;

        if !batch.status.can_transition_to(status) {
            warn!(
                batch_id,
                from = %batch.status,
                to = %status,
                "Overriding batch status outside the normal lifecycle"
            );
        } else {
            info!(batch_id, from = %batch.status, to = %status, "Setting batch status");
        }
        batch.status = status;
        if status != BatchStatus::Error {
            batch.error_message = None;
        }
        Ok(batch.clone())
    }
}
