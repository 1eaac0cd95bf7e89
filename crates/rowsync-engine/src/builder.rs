//! # Batch Builder
//!
//! Partitions unbatched change events for a (node, channel) pair into
//! outgoing batches without splitting source transactions.
//!
//! Events are included in event id order until the batch grows past the
//! channel's `max_batch_size`. From then on the builder peeks ahead: it keeps
//! including events of transactions already in the batch and skips everything
//! else, until `peek_ahead_window` consecutive events were skipped or the
//! cursor is exhausted. Skipped events stay untagged and start the next batch.
//!
//! A transaction still open when the window runs out is split across
//! batches. `max_batch_events` caps a batch regardless of open transactions.
//!
//! ## Usage
//!
//! ```ignore
//! use rowsync_engine::prelude::*;
//!
//! let builder = BatchBuilder::new(config.routing.clone(), store, registry, lock);
//! if let RunOutcome::Ran(Some(batch)) = builder.run("store-001", &channel).await? {
//!     println!("built batch {} with {} events", batch.batch_id, batch.event_count);
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::error::{bounded, Result};
use crate::lock::{with_cluster_lock, ClusterLock, RunOutcome};
use crate::model::{BatchStatus, Channel, OutgoingBatch};
use crate::registry::BatchRegistry;
use crate::store::ChangeEventStore;

/// Builds outgoing batches from the change event store.
pub struct BatchBuilder {
    config: RoutingConfig,
    store: Arc<dyn ChangeEventStore>,
    registry: Arc<dyn BatchRegistry>,
    lock: Arc<dyn ClusterLock>,
}

impl BatchBuilder {
    /// Create a builder.
    pub fn new(
        config: RoutingConfig,
        store: Arc<dyn ChangeEventStore>,
        registry: Arc<dyn BatchRegistry>,
        lock: Arc<dyn ClusterLock>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            lock,
        }
    }

    /// Routing settings in use.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Build one batch while holding the routing lock for this node and channel.
    ///
    /// Returns [`RunOutcome::Skipped`] when another process holds the lock.
    pub async fn run(
        &self,
        node_id: &str,
        channel: &Channel,
    ) -> Result<RunOutcome<Option<OutgoingBatch>>> {
        let action = format!("{}:{}:{}", self.config.lock_action, node_id, channel.id);
        with_cluster_lock(
            self.lock.as_ref(),
            &action,
            self.config.lock_timeout(),
            self.build_batches(node_id, channel),
        )
        .await
    }

    /// Build at most one batch from the unbatched events of a node and channel.
    ///
    /// Returns `None` when the channel is skipped or has no eligible events.
    pub async fn build_batches(
        &self,
        node_id: &str,
        channel: &Channel,
    ) -> Result<Option<OutgoingBatch>> {
        if channel.suspended {
            warn!(
                node_id,
                channel_id = %channel.id,
                "Channel is currently suspended, not building batches"
            );
            return Ok(None);
        }
        if !channel.enabled {
            debug!(node_id, channel_id = %channel.id, "Channel is disabled");
            return Ok(None);
        }
        if channel.ignored {
            return self.acknowledge_ignored(node_id, channel).await;
        }

        let timeout = self.config.query_timeout();
        let window = self.config.peek_ahead_window;
        let flush_size = self.config.tag_flush_size.max(1);
        let started = Instant::now();

        let mut cursor = bounded(
            timeout,
            "open event cursor",
            self.store.unbatched_events(node_id, &channel.id),
        )
        .await?;

        let mut batch: Option<OutgoingBatch> = None;
        let mut pending: Vec<i64> = Vec::new();
        let mut count: u64 = 0;
        let mut peek_ahead_mode = false;
        let mut countdown = window;
        let mut transaction_ids: HashSet<String> = HashSet::new();

        while countdown > 0 {
            let Some(event) = bounded(timeout, "fetch next event", cursor.next()).await? else {
                break;
            };

            let batch_id = match &batch {
                Some(b) => b.batch_id,
                None => {
                    let created = bounded(
                        timeout,
                        "create batch",
                        self.registry
                            .create_batch(node_id, &channel.id, BatchStatus::New),
                    )
                    .await?;
                    let id = created.batch_id;
                    batch = Some(created);
                    id
                }
            };

            let in_open_transaction = event
                .transaction_id
                .as_ref()
                .is_some_and(|id| transaction_ids.contains(id));

            if !peek_ahead_mode || in_open_transaction {
                countdown = window;
                if let Some(id) = event.transaction_id {
                    transaction_ids.insert(id);
                }
                pending.push(event.event_id);
                count += 1;

                if pending.len() >= flush_size {
                    self.flush_tags(node_id, batch_id, &mut pending).await?;
                }
            } else {
                countdown -= 1;
            }

            if !peek_ahead_mode && count > channel.max_batch_size {
                debug!(
                    node_id,
                    channel_id = %channel.id,
                    batch_id,
                    count,
                    "Batch size reached, looking ahead for open transactions"
                );
                peek_ahead_mode = true;
            }

            if count >= self.config.max_batch_events {
                warn!(
                    node_id,
                    channel_id = %channel.id,
                    batch_id,
                    count,
                    "Batch reached the hard event limit, open transactions continue in the next batch"
                );
                break;
            }
        }

        let Some(mut batch) = batch else {
            debug!(node_id, channel_id = %channel.id, "No unbatched events");
            return Ok(None);
        };

        self.flush_tags(node_id, batch.batch_id, &mut pending).await?;
        bounded(
            timeout,
            "record batch count",
            self.registry.record_created(batch.batch_id, count),
        )
        .await?;
        batch.event_count = count;

        metrics::counter!("rowsync_batches_built_total", "channel" => channel.id.clone())
            .increment(1);
        metrics::counter!("rowsync_events_batched_total", "channel" => channel.id.clone())
            .increment(count);
        info!(
            node_id,
            channel_id = %channel.id,
            batch_id = batch.batch_id,
            events = count,
            transactions = transaction_ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built outgoing batch"
        );
        Ok(Some(batch))
    }

    /// Ignored channels get a single batch, already OK, covering every pending event.
    async fn acknowledge_ignored(
        &self,
        node_id: &str,
        channel: &Channel,
    ) -> Result<Option<OutgoingBatch>> {
        let timeout = self.config.query_timeout();
        let waiting = bounded(
            timeout,
            "count unbatched events",
            self.store.count_unbatched(node_id, &channel.id),
        )
        .await?;
        if waiting == 0 {
            debug!(node_id, channel_id = %channel.id, "No unbatched events");
            return Ok(None);
        }

        let mut batch = bounded(
            timeout,
            "create batch",
            self.registry
                .create_batch(node_id, &channel.id, BatchStatus::Ok),
        )
        .await?;
        let tagged = bounded(
            timeout,
            "tag ignored events",
            self.store
                .tag_all_unbatched(node_id, &channel.id, batch.batch_id),
        )
        .await?;
        bounded(
            timeout,
            "record batch count",
            self.registry.record_created(batch.batch_id, tagged),
        )
        .await?;
        batch.event_count = tagged;

        metrics::counter!("rowsync_batches_built_total", "channel" => channel.id.clone())
            .increment(1);
        info!(
            node_id,
            channel_id = %channel.id,
            batch_id = batch.batch_id,
            events = tagged,
            "Channel is ignored, acknowledged pending events as batch OK"
        );
        Ok(Some(batch))
    }

    async fn flush_tags(&self, node_id: &str, batch_id: i64, pending: &mut Vec<i64>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        bounded(
            self.config.query_timeout(),
            "tag batched events",
            self.store.tag_events(node_id, batch_id, pending),
        )
        .await?;
        pending.clear();
        Ok(())
    }
}
