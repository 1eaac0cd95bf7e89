//! Replication data model
//!
//! - [`ChangeEvent`]: one captured row mutation, immutable once captured
//! - [`OutgoingBatch`]: unit of shipment and apply, with a monotonic status
//! - [`Channel`]: replication lane policy read by the batch builder

use chrono::{DateTime, Utc};
use rowsync_rdbc::dml::DmlType;
use rowsync_rdbc::types::Row;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch type for batches built from captured change events
pub const BATCH_TYPE_EVENTS: &str = "events";

/// One captured row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Ordering key, monotonically increasing
    pub event_id: i64,
    /// Source transaction grouping, when known
    pub transaction_id: Option<String>,
    /// Channel the event was captured on
    pub channel_id: String,
    /// Source table name
    pub table: String,
    /// Mutation kind
    pub dml_type: DmlType,
    /// Row after the change (INSERT, UPDATE)
    pub new_values: Option<Row>,
    /// Row before the change (UPDATE, DELETE)
    pub old_values: Option<Row>,
    /// Primary key of the changed row
    pub pk_values: Option<Row>,
    /// Capture time
    pub created_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an event with no row data
    pub fn new(
        event_id: i64,
        channel_id: impl Into<String>,
        table: impl Into<String>,
        dml_type: DmlType,
    ) -> Self {
        Self {
            event_id,
            transaction_id: None,
            channel_id: channel_id.into(),
            table: table.into(),
            dml_type,
            new_values: None,
            old_values: None,
            pk_values: None,
            created_at: Utc::now(),
        }
    }

    /// Set the source transaction id
    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Set the row after the change
    pub fn with_new_values(mut self, row: Row) -> Self {
        self.new_values = Some(row);
        self
    }

    /// Set the row before the change
    pub fn with_old_values(mut self, row: Row) -> Self {
        self.old_values = Some(row);
        self
    }

    /// Set the primary key values
    pub fn with_pk_values(mut self, row: Row) -> Self {
        self.pk_values = Some(row);
        self
    }

    /// Primary key values: explicit key data, else old row, else new row
    pub fn key_values(&self) -> Option<&Row> {
        self.pk_values
            .as_ref()
            .or(self.old_values.as_ref())
            .or(self.new_values.as_ref())
    }
}

/// Lifecycle status of an [`OutgoingBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Built, not yet shipped
    New,
    /// Shipped to the destination node
    Sent,
    /// Applied (or acknowledged without apply)
    Ok,
    /// Failed; terminal until resubmitted as a new batch
    Error,
}

impl BatchStatus {
    /// Two-letter status code
    pub const fn code(self) -> &'static str {
        match self {
            Self::New => "NE",
            Self::Sent => "SE",
            Self::Ok => "OK",
            Self::Error => "ER",
        }
    }

    /// Whether moving from `self` to `to` respects the batch lifecycle.
    ///
    /// Re-marking the current status is allowed and has no effect.
    pub const fn can_transition_to(self, to: BatchStatus) -> bool {
        matches!(
            (self, to),
            (Self::New, Self::New)
                | (Self::Sent, Self::Sent)
                | (Self::Ok, Self::Ok)
                | (Self::Error, Self::Error)
                | (Self::New, Self::Sent)
                | (Self::New, Self::Error)
                | (Self::Sent, Self::Ok)
                | (Self::Sent, Self::Error)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A unit of shipment and apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    /// Generated batch id
    pub batch_id: i64,
    /// Destination node
    pub node_id: String,
    /// Channel the batch was built for
    pub channel_id: String,
    /// Batch type, [`BATCH_TYPE_EVENTS`] for routed change events
    pub batch_type: String,
    /// Current status
    pub status: BatchStatus,
    /// Creation time
    pub create_time: DateTime<Utc>,
    /// Number of events tagged with this batch
    pub event_count: u64,
    /// Failure description for batches in [`BatchStatus::Error`]
    pub error_message: Option<String>,
}

impl OutgoingBatch {
    /// Create a batch record
    pub fn new(
        batch_id: i64,
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        status: BatchStatus,
    ) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            batch_type: BATCH_TYPE_EVENTS.to_string(),
            status,
            create_time: Utc::now(),
            event_count: 0,
            error_message: None,
        }
    }

    /// `<node>-<batch id>` identifier used in logs
    pub fn node_batch_id(&self) -> String {
        format!("{}-{}", self.node_id, self.batch_id)
    }
}

/// Replication lane configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id
    pub id: String,

    /// Disabled channels are skipped silently
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Suspended channels are skipped with a warning
    #[serde(default)]
    pub suspended: bool,

    /// Ignored channels acknowledge their events without shipping them
    #[serde(default)]
    pub ignored: bool,

    /// Events per batch before the builder only accepts open transactions
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,

    /// Queue the channel's batches are routed through
    #[serde(default = "default_queue")]
    pub queue: String,
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> u64 {
    10_000
}

fn default_queue() -> String {
    "default".to_string()
}

impl Channel {
    /// Create an enabled channel with default limits
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            suspended: false,
            ignored: false,
            max_batch_size: default_max_batch_size(),
            queue: default_queue(),
        }
    }

    /// Set the max batch size
    pub fn with_max_batch_size(mut self, max_batch_size: u64) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set the enabled flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the suspended flag
    pub fn with_suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    /// Set the ignored flag
    pub fn with_ignored(mut self, ignored: bool) -> Self {
        self.ignored = ignored;
        self
    }
}
