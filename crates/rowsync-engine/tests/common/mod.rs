//! Shared fixtures for rowsync-engine integration tests

#![allow(dead_code)]

use rowsync_engine::prelude::*;
use rowsync_rdbc::prelude::{ColumnMetadata, DmlType, MemoryDatabase, Row, TableMetadata};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize test logging once
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rowsync_engine=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// `item(id PK, name, price, version, updated_at)`
pub fn item_table() -> TableMetadata {
    TableMetadata::new("item")
        .with_column(ColumnMetadata::new("id", "INTEGER").primary_key(1))
        .with_column(ColumnMetadata::new("name", "VARCHAR"))
        .with_column(ColumnMetadata::new("price", "INTEGER"))
        .with_column(ColumnMetadata::new("version", "INTEGER"))
        .with_column(ColumnMetadata::new("updated_at", "TIMESTAMP"))
}

/// Target database with the `item` table
pub fn item_database() -> Arc<MemoryDatabase> {
    let db = Arc::new(MemoryDatabase::new());
    db.create_table(item_table());
    db
}

/// Item row
pub fn item(id: i64, name: &str, price: i64) -> Row {
    Row::default()
        .with("id", id)
        .with("name", name)
        .with("price", price)
}

/// INSERT of a full row on the `sale` channel
pub fn insert(event_id: i64, table: &str, row: Row) -> ChangeEvent {
    ChangeEvent::new(event_id, "sale", table, DmlType::Insert).with_new_values(row)
}

/// UPDATE from `old` to `new`, keyed by `id`
pub fn update(event_id: i64, table: &str, old: Row, new: Row) -> ChangeEvent {
    let key = old.project(&["id"]);
    ChangeEvent::new(event_id, "sale", table, DmlType::Update)
        .with_pk_values(key)
        .with_old_values(old)
        .with_new_values(new)
}

/// DELETE of the row identified by `id`
pub fn delete(event_id: i64, table: &str, id: i64) -> ChangeEvent {
    ChangeEvent::new(event_id, "sale", table, DmlType::Delete)
        .with_pk_values(Row::default().with("id", id))
}

/// Apply side wiring over a memory database
pub struct ApplyFixture {
    pub db: Arc<MemoryDatabase>,
    pub registry: Arc<MemoryBatchRegistry>,
    pub lock: Arc<MemoryClusterLock>,
    pub engine: ApplyEngine,
}

impl ApplyFixture {
    pub fn new(db: Arc<MemoryDatabase>, policies: Vec<ConflictPolicy>) -> Self {
        Self::with_engine(db, |engine| {
            engine.with_conflicts(ConflictSettings::new(policies))
        })
    }

    pub fn with_engine(
        db: Arc<MemoryDatabase>,
        configure: impl FnOnce(ApplyEngine) -> ApplyEngine,
    ) -> Self {
        let registry = Arc::new(MemoryBatchRegistry::new());
        let lock = Arc::new(MemoryClusterLock::new());
        let engine = configure(ApplyEngine::new(
            LoadConfig::default(),
            db.clone(),
            registry.clone(),
            lock.clone(),
        ));
        Self {
            db,
            registry,
            lock,
            engine,
        }
    }

    /// Register a SENT batch on the `sale` channel
    pub async fn sent_batch(&self) -> i64 {
        self.registry
            .create_batch("store-001", "sale", BatchStatus::Sent)
            .await
            .unwrap()
            .batch_id
    }

    /// Apply `changes` as a fresh batch
    pub async fn apply(&self, changes: &[ChangeEvent]) -> BatchResult {
        self.apply_resolved(changes, &ResolvedRows::new()).await
    }

    /// Apply `changes` as a fresh batch with resolved data
    pub async fn apply_resolved(
        &self,
        changes: &[ChangeEvent],
        resolved: &ResolvedRows,
    ) -> BatchResult {
        let batch_id = self.sent_batch().await;
        self.engine
            .apply_batch(batch_id, changes, resolved)
            .await
            .unwrap()
    }
}
