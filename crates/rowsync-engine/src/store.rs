//! Change event store interface
//!
//! The store is append-only from the engine's point of view: the batch
//! builder reads unbatched events through a forward [`EventCursor`] and tags
//! them with batch ids. An event's tag is the source of truth for "already
//! batched", so a tag is never overwritten.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::model::ChangeEvent;

/// Forward-only cursor over change events in event id order.
#[async_trait]
pub trait EventCursor: Send {
    /// Fetch the next event, `None` once exhausted
    async fn next(&mut self) -> Result<Option<ChangeEvent>>;
}

/// Storage of captured change events.
#[async_trait]
pub trait ChangeEventStore: Send + Sync {
    /// Open a cursor over untagged events for a node and channel, ordered by event id
    async fn unbatched_events(
        &self,
        node_id: &str,
        channel_id: &str,
    ) -> Result<Box<dyn EventCursor>>;

    /// Count untagged events for a node and channel
    async fn count_unbatched(&self, node_id: &str, channel_id: &str) -> Result<u64>;

    /// Tag events with a batch id, returning the number tagged
    async fn tag_events(&self, node_id: &str, batch_id: i64, event_ids: &[i64]) -> Result<u64>;

    /// Tag every untagged event for a node and channel in one operation
    async fn tag_all_unbatched(&self, node_id: &str, channel_id: &str, batch_id: i64)
        -> Result<u64>;
}

/// Cursor over a snapshot of events
pub struct VecCursor {
    events: VecDeque<ChangeEvent>,
}

impl VecCursor {
    /// Create a cursor yielding `events` in order
    pub fn new(events: impl Into<VecDeque<ChangeEvent>>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

#[async_trait]
impl EventCursor for VecCursor {
    async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        Ok(self.events.pop_front())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    /// Events per destination node, kept in event id order
    events: HashMap<String, Vec<ChangeEvent>>,
    /// (node, event id) → batch id
    tags: HashMap<(String, i64), i64>,
}

/// In-memory [`ChangeEventStore`]
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    state: RwLock<StoreState>,
    tag_latency: RwLock<Option<Duration>>,
}

impl MemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a captured event to a destination node
    pub fn append(&self, node_id: &str, event: ChangeEvent) {
        let mut state = self.state.write();
        let events = state.events.entry(node_id.to_string()).or_default();
        let pos = events.partition_point(|e| e.event_id <= event.event_id);
        events.insert(pos, event);
    }

    /// Delay every tagging call, simulating a slow store
    pub fn set_tag_latency(&self, latency: Option<Duration>) {
        *self.tag_latency.write() = latency;
    }

    /// Batch an event was tagged with
    pub fn batch_of(&self, node_id: &str, event_id: i64) -> Option<i64> {
        self.state
            .read()
            .tags
            .get(&(node_id.to_string(), event_id))
            .copied()
    }

    /// Events tagged with a batch, in event id order
    pub fn batch_events(&self, node_id: &str, batch_id: i64) -> Vec<ChangeEvent> {
        let state = self.state.read();
        state
            .events
            .get(node_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| {
                        state.tags.get(&(node_id.to_string(), e.event_id)) == Some(&batch_id)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn untagged(&self, node_id: &str, channel_id: &str) -> Vec<ChangeEvent> {
        let state = self.state.read();
        state
            .events
            .get(node_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| {
                        e.channel_id == channel_id
                            && !state.tags.contains_key(&(node_id.to_string(), e.event_id))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChangeEventStore for MemoryEventStore {
    async fn unbatched_events(
        &self,
        node_id: &str,
        channel_id: &str,
    ) -> Result<Box<dyn EventCursor>> {
        Ok(Box::new(VecCursor::new(self.untagged(node_id, channel_id))))
    }

    async fn count_unbatched(&self, node_id: &str, channel_id: &str) -> Result<u64> {
        Ok(self.untagged(node_id, channel_id).len() as u64)
    }

    async fn tag_events(&self, node_id: &str, batch_id: i64, event_ids: &[i64]) -> Result<u64> {
        let latency = *self.tag_latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write();
        for id in event_ids {
            if let Some(existing) = state.tags.get(&(node_id.to_string(), *id)) {
                return Err(EngineError::store(format!(
                    "event {} for node {} already tagged with batch {}",
                    id, node_id, existing
                )));
            }
        }
        for id in event_ids {
            state.tags.insert((node_id.to_string(), *id), batch_id);
        }
        Ok(event_ids.len() as u64)
    }

    async fn tag_all_unbatched(
        &self,
        node_id: &str,
        channel_id: &str,
        batch_id: i64,
    ) -> Result<u64> {
        let ids: Vec<i64> = self
            .untagged(node_id, channel_id)
            .iter()
            .map(|e| e.event_id)
            .collect();
        let mut state = self.state.write();
        for id in &ids {
            state.tags.insert((node_id.to_string(), *id), batch_id);
        }
        Ok(ids.len() as u64)
    }
}
