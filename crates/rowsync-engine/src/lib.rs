//! # rowsync-engine
//!
//! Transaction-aware batch building and conflict-aware apply for database
//! change replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ChangeEventStore  │──▶│ BatchBuilder │──▶│  BatchRegistry   │
//! │ (captured rows)  │   │ (peek-ahead) │   │ NE → SE → OK/ER  │
//! └──────────────────┘   └──────────────┘   └────────┬─────────┘
//!                                                     │ transport
//!                                                     ▼
//! ┌──────────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │   DmlExecutor    │◀──│ ApplyEngine  │◀──│ TransformEngine  │
//! │ (target database)│   │ (conflicts)  │   │ (table mapping)  │
//! └──────────────────┘   └──────────────┘   └──────────────────┘
//! ```
//!
//! Both runs hold a [`ClusterLock`](lock::ClusterLock) for their action and
//! skip the cycle when another process holds it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rowsync_engine::prelude::*;
//!
//! let config = EngineConfig::from_file("rowsync.yaml")?;
//! let builder = BatchBuilder::new(config.routing.clone(), store, registry.clone(), lock.clone());
//! for channel in &config.channels {
//!     builder.run("store-001", channel).await?;
//! }
//!
//! let engine = ApplyEngine::new(config.loading.clone(), executor, registry, lock)
//!     .with_transforms(TransformEngine::new(config.transforms.clone()))
//!     .with_conflicts(ConflictSettings::new(config.conflicts.clone()));
//! let result = engine.apply_batch(batch_id, &changes, &ResolvedRows::new()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod apply;
pub mod builder;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod registry;
pub mod store;
pub mod transform;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::apply::{
        ApplyEngine, ApplyOutcome, ApplyStats, BatchFailure, BatchResult, BatchStatistics,
        ConflictDetector, ConflictPolicy, ConflictSettings, DetectType, LoadStatus,
        ResolveType, ResolvedData, ResolvedRows,
    };
    pub use crate::builder::BatchBuilder;
    pub use crate::config::{EngineConfig, LoadConfig, RoutingConfig};
    pub use crate::error::{EngineError, ErrorCategory, Result};
    pub use crate::lock::{with_cluster_lock, ClusterLock, MemoryClusterLock, RunOutcome};
    pub use crate::model::{BatchStatus, ChangeEvent, Channel, OutgoingBatch};
    pub use crate::registry::{BatchRegistry, MemoryBatchRegistry};
    pub use crate::store::{ChangeEventStore, EventCursor, MemoryEventStore};
    pub use crate::transform::{TransformColumn, TransformEngine, TransformRule};
}

pub use error::{EngineError, Result};
