//! # Apply Engine
//!
//! Applies the changes of one batch to a target database through a
//! [`DmlExecutor`]. Every change is transformed (or passed through), written,
//! and, when the write reports a conflict, resolved according to the most
//! specific [`ConflictPolicy`] for its target table and channel.
//!
//! A write conflicts when an insert violates a unique constraint, or when an
//! update or delete affects no rows. Resolution either repairs the write with
//! a fallback statement, skips the row, or aborts the batch. An abort is
//! returned as [`ApplyOutcome::BatchAborted`] and a conflict no resolution can
//! settle becomes [`EngineError::Conflict`]; both roll back the uncommitted
//! tail and mark the batch ERROR.
//!
//! ## Usage
//!
//! ```ignore
//! use rowsync_engine::prelude::*;
//!
//! let engine = ApplyEngine::new(config.loading.clone(), executor, registry, lock)
//!     .with_transforms(TransformEngine::new(config.transforms.clone()))
//!     .with_conflicts(ConflictSettings::new(config.conflicts.clone()));
//!
//! let result = engine.apply_batch(batch_id, &changes, &ResolvedRows::new()).await?;
//! println!("batch {} -> {}", result.batch_id, result.status);
//! ```

use rowsync_rdbc::dml::{DmlStatement, DmlType};
use rowsync_rdbc::executor::DmlExecutor;
use rowsync_rdbc::types::{Row, TableMetadata};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::conflict::{ConflictPolicy, ConflictSettings, DetectType, ResolveType};
use super::detector::{ConflictDetector, NewerWinsDetector};
use super::resolved::ResolvedRows;
use super::stats::{ApplyStats, AtomicApplyStats, BatchStatistics};
use crate::config::LoadConfig;
use crate::error::{bounded, EngineError, Result};
use crate::lock::{with_cluster_lock, ClusterLock, RunOutcome};
use crate::model::{BatchStatus, ChangeEvent, OutgoingBatch};
use crate::registry::BatchRegistry;
use crate::transform::{SourceRow, TransformEngine, TransformedWrite};

/// Result of one write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The statement affected the target row
    Success,
    /// Unique violation, or no row matched the lookup
    Conflict,
}

/// Outcome of applying one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Written, directly or by a fallback
    Success,
    /// Skipped by conflict policy
    RowSkipped,
    /// Conflict policy requires the whole batch to fail
    BatchAborted(String),
}

/// Why a batch ended in ERROR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchFailure {
    /// Conflict policy aborted the batch
    Aborted {
        /// Row that triggered the abort
        line_number: u64,
        /// Policy decision
        reason: String,
    },
    /// A conflict no resolution could settle
    Conflict {
        /// Row in conflict
        line_number: u64,
        /// Target table
        table: String,
        /// What failed
        message: String,
    },
}

impl BatchFailure {
    /// Row the failure occurred at
    pub fn line_number(&self) -> u64 {
        match self {
            Self::Aborted { line_number, .. } | Self::Conflict { line_number, .. } => *line_number,
        }
    }

    /// Message recorded on the batch
    pub fn message(&self) -> String {
        match self {
            Self::Aborted { line_number, reason } => {
                format!("Batch aborted at line {}: {}", line_number, reason)
            }
            Self::Conflict {
                line_number,
                table,
                message,
            } => format!("Conflict on {} at line {}: {}", table, line_number, message),
        }
    }
}

/// Result of applying one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Batch applied
    pub batch_id: i64,
    /// Final status, `Ok` or `Error`
    pub status: BatchStatus,
    /// Per-batch counters
    pub statistics: BatchStatistics,
    /// Failure cause when `status` is `Error`
    pub failure: Option<BatchFailure>,
}

impl BatchResult {
    /// Whether the batch was applied
    pub fn is_ok(&self) -> bool {
        self.status == BatchStatus::Ok
    }
}

/// Parameterised SQL by statement shape, owned by one batch run
#[derive(Debug, Default)]
struct StatementCache {
    sql: HashMap<StatementShape, Arc<str>>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct StatementShape {
    dml_type: DmlType,
    table: String,
    columns: Vec<String>,
    lookup: Vec<String>,
}

impl StatementCache {
    fn statement(&mut self, dml_type: DmlType, table: &str, columns: Row, lookup: Row) -> DmlStatement {
        let shape = StatementShape {
            dml_type,
            table: table.to_ascii_lowercase(),
            columns: columns.columns().to_vec(),
            lookup: lookup.columns().to_vec(),
        };
        if let Some(sql) = self.sql.get(&shape) {
            return DmlStatement::with_sql(Arc::clone(sql), dml_type, table, columns, lookup);
        }
        let statement = DmlStatement::new(dml_type, table, columns, lookup);
        self.sql.insert(shape, Arc::from(statement.sql()));
        statement
    }

    fn len(&self) -> usize {
        self.sql.len()
    }
}

/// State of one `apply_batch` invocation
struct BatchRun<'a> {
    batch: &'a OutgoingBatch,
    resolved: &'a ResolvedRows,
    statistics: BatchStatistics,
    statements: StatementCache,
    tables: HashMap<String, Arc<TableMetadata>>,
    uncommitted: u64,
}

impl<'a> BatchRun<'a> {
    fn new(batch: &'a OutgoingBatch, resolved: &'a ResolvedRows) -> Self {
        Self {
            batch,
            resolved,
            statistics: BatchStatistics::default(),
            statements: StatementCache::default(),
            tables: HashMap::new(),
            uncommitted: 0,
        }
    }
}

/// A write against one target table, fitted to its columns
#[derive(Debug, Clone)]
struct TargetWrite {
    metadata: Arc<TableMetadata>,
    table: String,
    dml_type: DmlType,
    values: Row,
    key_values: Row,
    old_values: Option<Row>,
    transformed: Option<TransformedWrite>,
}

impl TargetWrite {
    fn passthrough(metadata: Arc<TableMetadata>, event: &ChangeEvent, source: &SourceRow) -> Self {
        let values = fit_row(&source.values, &metadata);
        let old_values = source.old_values.as_ref().map(|r| fit_row(r, &metadata));
        let key_source = event.key_values().cloned().unwrap_or_default();

        let pk_names: Vec<&str> = metadata
            .primary_key_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let key_values = if pk_names.is_empty() {
            fit_row(&key_source, &metadata)
        } else {
            pk_names
                .iter()
                .filter_map(|name| {
                    key_source
                        .get_by_name(name)
                        .or_else(|| old_values.as_ref().and_then(|r| r.get_by_name(name)))
                        .or_else(|| values.get_by_name(name))
                        .map(|v| (name.to_string(), v.clone()))
                })
                .collect()
        };

        Self {
            table: metadata.name.clone(),
            metadata,
            dml_type: event.dml_type,
            values,
            key_values,
            old_values,
            transformed: None,
        }
    }

    fn transformed(metadata: Arc<TableMetadata>, write: TransformedWrite) -> Self {
        Self {
            table: metadata.name.clone(),
            dml_type: write.target_dml,
            values: fit_row(&write.values, &metadata),
            key_values: fit_row(&write.key_values, &metadata),
            old_values: write.old_values.as_ref().map(|r| fit_row(r, &metadata)),
            metadata,
            transformed: Some(write),
        }
    }

    fn with_dml(&self, dml_type: DmlType) -> Self {
        Self {
            dml_type,
            ..self.clone()
        }
    }

    fn generated_identity(&self) -> bool {
        self.transformed
            .as_ref()
            .is_some_and(|t| t.generated_identity)
    }
}

/// Columns of `row` that exist in the target table
fn fit_row(row: &Row, metadata: &TableMetadata) -> Row {
    let mut fitted = row.clone();
    fitted.retain(|column, _| metadata.column(column).is_some());
    fitted
}

fn source_row(event: &ChangeEvent) -> Result<SourceRow> {
    let values = match event.dml_type {
        DmlType::Delete => Row::default(),
        DmlType::Insert | DmlType::Update => event.new_values.clone().ok_or_else(|| {
            EngineError::invalid_data(format!(
                "{} event {} on {} has no row data",
                event.dml_type, event.event_id, event.table
            ))
        })?,
    };
    if event.key_values().is_none() {
        return Err(EngineError::invalid_data(format!(
            "{} event {} on {} has no key data",
            event.dml_type, event.event_id, event.table
        )));
    }
    Ok(SourceRow {
        table: event.table.clone(),
        values,
        key_values: event.pk_values.clone().unwrap_or_default(),
        old_values: event.old_values.clone(),
    })
}

/// Applies batches of changes to a target database.
pub struct ApplyEngine {
    config: LoadConfig,
    executor: Arc<dyn DmlExecutor>,
    registry: Arc<dyn BatchRegistry>,
    lock: Arc<dyn ClusterLock>,
    transforms: TransformEngine,
    conflicts: ConflictSettings,
    detector: Arc<dyn ConflictDetector>,
    stats: AtomicApplyStats,
}

impl ApplyEngine {
    /// Create an engine with no transforms and the default conflict policy.
    pub fn new(
        config: LoadConfig,
        executor: Arc<dyn DmlExecutor>,
        registry: Arc<dyn BatchRegistry>,
        lock: Arc<dyn ClusterLock>,
    ) -> Self {
        Self {
            config,
            executor,
            registry,
            lock,
            transforms: TransformEngine::default(),
            conflicts: ConflictSettings::default(),
            detector: Arc::new(NewerWinsDetector),
            stats: AtomicApplyStats::default(),
        }
    }

    /// Use transform rules
    pub fn with_transforms(mut self, transforms: TransformEngine) -> Self {
        self.transforms = transforms;
        self
    }

    /// Use conflict policies
    pub fn with_conflicts(mut self, conflicts: ConflictSettings) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// Use a custom newer-wins detector
    pub fn with_detector(mut self, detector: Arc<dyn ConflictDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Load settings in use
    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Cumulative statistics across all batches applied by this engine
    pub fn stats(&self) -> ApplyStats {
        self.stats.snapshot()
    }

    /// Apply a batch while holding the load lock for its node and batch.
    ///
    /// Returns [`RunOutcome::Skipped`] when another process holds the lock.
    pub async fn run(
        &self,
        batch_id: i64,
        changes: &[ChangeEvent],
        resolved: &ResolvedRows,
    ) -> Result<RunOutcome<BatchResult>> {
        let batch = self.fetch_batch(batch_id).await?;
        let action = format!("{}:{}", self.config.lock_action, batch.node_batch_id());
        with_cluster_lock(
            self.lock.as_ref(),
            &action,
            self.config.lock_timeout(),
            self.apply_batch(batch_id, changes, resolved),
        )
        .await
    }

    /// Apply the changes of a SENT batch in order and mark it OK or ERROR.
    ///
    /// Policy aborts and unresolved conflicts are reported in the returned
    /// [`BatchResult`]. Any other failure marks the batch ERROR and is
    /// returned as an error.
    pub async fn apply_batch(
        &self,
        batch_id: i64,
        changes: &[ChangeEvent],
        resolved: &ResolvedRows,
    ) -> Result<BatchResult> {
        let batch = self.fetch_batch(batch_id).await?;
        if batch.status != BatchStatus::Sent {
            return Err(EngineError::IllegalTransition {
                batch_id,
                from: batch.status,
                to: BatchStatus::Ok,
            });
        }

        let started = Instant::now();
        let mut run = BatchRun::new(&batch, resolved);

        let loaded = match self.load_changes(&mut run, changes).await {
            Ok(None) => self
                .target("commit", self.executor.commit())
                .await
                .map(|()| None),
            other => other,
        };
        let loaded = loaded.or_else(|e| match e {
            EngineError::Conflict {
                table,
                line_number,
                message,
                ..
            } => Ok(Some(BatchFailure::Conflict {
                line_number,
                table,
                message,
            })),
            other => Err(other),
        });
        run.statistics.statements_prepared = run.statements.len() as u64;

        match loaded {
            Ok(None) => {
                self.target_registry("mark batch ok", self.registry.mark_ok(batch_id))
                    .await?;
                self.stats.record_batch(&run.statistics, true);
                info!(
                    batch_id,
                    node_id = %batch.node_id,
                    channel_id = %batch.channel_id,
                    rows = run.statistics.line_count,
                    statements = run.statistics.statement_count,
                    prepared = run.statistics.statements_prepared,
                    "Applied batch in {:?}",
                    started.elapsed()
                );
                Ok(BatchResult {
                    batch_id,
                    status: BatchStatus::Ok,
                    statistics: run.statistics,
                    failure: None,
                })
            }
            Ok(Some(failure)) => {
                self.rollback_quietly(batch_id).await;
                let message = failure.message();
                self.target_registry("mark batch error", self.registry.mark_error(batch_id, &message))
                    .await?;
                self.stats.record_batch(&run.statistics, false);
                error!(
                    batch_id,
                    node_id = %batch.node_id,
                    line_number = failure.line_number(),
                    "Failed to apply batch: {}",
                    message
                );
                Ok(BatchResult {
                    batch_id,
                    status: BatchStatus::Error,
                    statistics: run.statistics,
                    failure: Some(failure),
                })
            }
            Err(e) => {
                self.rollback_quietly(batch_id).await;
                if let Err(mark) = self
                    .target_registry("mark batch error", self.registry.mark_error(batch_id, &e.to_string()))
                    .await
                {
                    warn!(batch_id, error = %mark, "Could not mark batch as failed");
                }
                self.stats.record_batch(&run.statistics, false);
                error!(batch_id, node_id = %batch.node_id, error = %e, "Failed to apply batch");
                Err(e)
            }
        }
    }

    async fn fetch_batch(&self, batch_id: i64) -> Result<OutgoingBatch> {
        self.target_registry("get batch", self.registry.get(batch_id))
            .await?
            .ok_or(EngineError::BatchNotFound(batch_id))
    }

    async fn load_changes(
        &self,
        run: &mut BatchRun<'_>,
        changes: &[ChangeEvent],
    ) -> Result<Option<BatchFailure>> {
        for (index, event) in changes.iter().enumerate() {
            let line_number = index as u64 + 1;
            run.statistics.line_count += 1;

            if run.resolved.is_ignored(line_number) {
                run.statistics.ignore_count += 1;
                debug!(
                    batch_id = run.batch.batch_id,
                    line_number,
                    table = %event.table,
                    "Skipping row marked as ignored by resolved data"
                );
                continue;
            }

            let source = source_row(event)?;
            for write in self.writes_for(run, event, &source).await? {
                match self.write_row(run, line_number, &source, &write).await? {
                    ApplyOutcome::Success | ApplyOutcome::RowSkipped => {}
                    ApplyOutcome::BatchAborted(reason) => {
                        return Ok(Some(BatchFailure::Aborted {
                            line_number,
                            reason,
                        }))
                    }
                }
            }

            run.uncommitted += 1;
            if run.uncommitted >= self.config.max_rows_before_commit {
                self.target("commit", self.executor.commit()).await?;
                debug!(
                    batch_id = run.batch.batch_id,
                    line_number,
                    rows = run.uncommitted,
                    "Committed before end of batch"
                );
                run.uncommitted = 0;
                run.statistics.early_commit_count += 1;
            }
        }
        Ok(None)
    }

    async fn writes_for(
        &self,
        run: &mut BatchRun<'_>,
        event: &ChangeEvent,
        source: &SourceRow,
    ) -> Result<Vec<TargetWrite>> {
        if !self.transforms.handles(&event.table) {
            let metadata = self.table_metadata(run, &event.table).await?;
            return Ok(vec![TargetWrite::passthrough(metadata, event, source)]);
        }

        let mut writes = Vec::new();
        for transformed in self.transforms.transform(event.dml_type, source) {
            let metadata = self.table_metadata(run, &transformed.target_table).await?;
            writes.push(TargetWrite::transformed(metadata, transformed));
        }
        Ok(writes)
    }

    async fn table_metadata(
        &self,
        run: &mut BatchRun<'_>,
        table: &str,
    ) -> Result<Arc<TableMetadata>> {
        let key = table.to_ascii_lowercase();
        if let Some(metadata) = run.tables.get(&key) {
            return Ok(Arc::clone(metadata));
        }
        let metadata = self
            .target("describe table", self.executor.describe_table(table))
            .await?
            .ok_or_else(|| {
                EngineError::Target(rowsync_rdbc::Error::TableNotFound {
                    table: table.to_string(),
                })
            })?;
        let metadata = Arc::new(metadata);
        run.tables.insert(key, Arc::clone(&metadata));
        Ok(metadata)
    }

    async fn write_row(
        &self,
        run: &mut BatchRun<'_>,
        line_number: u64,
        source: &SourceRow,
        write: &TargetWrite,
    ) -> Result<ApplyOutcome> {
        if write.dml_type != DmlType::Insert && write.key_values.is_empty() {
            return Err(EngineError::invalid_data(format!(
                "{} on {} at line {} has no key values",
                write.dml_type, write.table, line_number
            )));
        }

        let policy = self.conflicts.pick(&write.table, &run.batch.channel_id);
        if self.load(run, write, policy).await? == LoadStatus::Success {
            return Ok(ApplyOutcome::Success);
        }

        debug!(
            batch_id = run.batch.batch_id,
            line_number,
            table = %write.table,
            dml_type = %write.dml_type,
            policy = %policy.id,
            resolve_type = ?policy.resolve_type,
            row = ?write.values,
            old = ?write.old_values,
            resolved = ?run.resolved.get(line_number),
            "Conflict detected"
        );

        let outcome = self.resolve(run, line_number, source, write, policy).await;
        match &outcome {
            Ok(resolution) if self.config.log_conflict_resolution => info!(
                batch_id = run.batch.batch_id,
                line_number,
                table = %write.table,
                policy = %policy.id,
                row = ?write.values,
                outcome = ?resolution,
                "Conflict resolved"
            ),
            Ok(resolution) => debug!(
                batch_id = run.batch.batch_id,
                line_number,
                table = %write.table,
                policy = %policy.id,
                row = ?write.values,
                outcome = ?resolution,
                "Conflict resolved"
            ),
            Err(e) => warn!(
                batch_id = run.batch.batch_id,
                line_number,
                table = %write.table,
                policy = %policy.id,
                row = ?write.values,
                error = %e,
                "Conflict could not be resolved"
            ),
        }
        outcome
    }

    /// First attempt, with conflict detection
    async fn load(
        &self,
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        policy: &ConflictPolicy,
    ) -> Result<LoadStatus> {
        match write.dml_type {
            DmlType::Insert => self.insert(run, write, &write.values, false).await,
            DmlType::Update => {
                self.update(
                    run,
                    write,
                    &write.values,
                    self.config.apply_changes_only,
                    Some(policy),
                )
                .await
            }
            DmlType::Delete => self.delete(run, write, Some(policy)).await,
        }
    }

    async fn resolve(
        &self,
        run: &mut BatchRun<'_>,
        line_number: u64,
        source: &SourceRow,
        write: &TargetWrite,
        policy: &ConflictPolicy,
    ) -> Result<ApplyOutcome> {
        let changes_only = policy.resolve_changes_only;

        match (write.dml_type, policy.resolve_type) {
            (_, ResolveType::Ignore) => Ok(Self::skip_or_abort(run, write, policy, "ignored by policy")),

            (DmlType::Insert, ResolveType::Fallback) => {
                let status = self
                    .fallback_update(run, write, source, None, changes_only)
                    .await?;
                self.require(run, line_number, write, status, "fallback update matched no row")
            }

            (DmlType::Insert, ResolveType::NewerWins) => {
                if !self.is_newer(write, policy).await? {
                    return Ok(Self::skip_or_abort(run, write, policy, "incoming row is not newer"));
                }
                let status = self
                    .fallback_update(run, write, source, None, changes_only)
                    .await?;
                self.require(run, line_number, write, status, "fallback update matched no row")
            }

            (DmlType::Update, ResolveType::Fallback) => {
                let status = if policy.detect_type == DetectType::UsePkData {
                    match self.fallback_insert(run, write, source, None).await? {
                        LoadStatus::Success => LoadStatus::Success,
                        LoadStatus::Conflict => {
                            self.fallback_update(run, write, source, None, false)
                                .await?
                        }
                    }
                } else {
                    self.update_then_insert(run, write, source, None, changes_only)
                        .await?
                };
                self.require(run, line_number, write, status, "fallback insert and update both conflicted")
            }

            (DmlType::Update, ResolveType::NewerWins) => {
                if !self.is_newer(write, policy).await? {
                    return Ok(Self::skip_or_abort(run, write, policy, "incoming row is not newer"));
                }
                let status = self
                    .update_then_insert(run, write, source, None, changes_only)
                    .await?;
                self.require(run, line_number, write, status, "fallback update and insert both conflicted")
            }

            (DmlType::Insert | DmlType::Update, ResolveType::Manual) => {
                let resolved = run.resolved;
                match resolved.get(line_number) {
                    None => Err(self.unresolved(run, line_number, write, "no resolved data for manual conflict")),
                    Some(data) if data.ignore_row => {
                        Ok(Self::skip_or_abort(run, write, policy, "resolved data ignores the row"))
                    }
                    Some(data) => {
                        let status = self
                            .update_then_insert(run, write, source, data.row.as_ref(), changes_only)
                            .await?;
                        self.require(run, line_number, write, status, "resolved row could not be written")
                    }
                }
            }

            (DmlType::Delete, ResolveType::Fallback) => {
                let status = if policy.detect_type == DetectType::UsePkData {
                    LoadStatus::Conflict
                } else {
                    self.delete(run, write, None).await?
                };
                if status == LoadStatus::Conflict {
                    run.statistics.missing_delete_count += 1;
                    debug!(
                        batch_id = run.batch.batch_id,
                        line_number,
                        table = %write.table,
                        key = ?write.key_values,
                        "Row to delete is already gone"
                    );
                }
                Ok(ApplyOutcome::Success)
            }

            (DmlType::Delete, ResolveType::NewerWins) => Ok(ApplyOutcome::Success),

            (DmlType::Delete, ResolveType::Manual) => {
                let resolved = run.resolved;
                match resolved.get(line_number) {
                    None => Err(self.unresolved(run, line_number, write, "no resolved data for manual conflict")),
                    Some(data) if data.ignore_row => {
                        Ok(Self::skip_or_abort(run, write, policy, "resolved data ignores the row"))
                    }
                    Some(_) => {
                        if self.delete(run, write, None).await? == LoadStatus::Conflict {
                            run.statistics.missing_delete_count += 1;
                        }
                        Ok(ApplyOutcome::Success)
                    }
                }
            }
        }
    }

    async fn update_then_insert(
        &self,
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        source: &SourceRow,
        row_override: Option<&Row>,
        changes_only: bool,
    ) -> Result<LoadStatus> {
        match self
            .fallback_update(run, write, source, row_override, changes_only)
            .await?
        {
            LoadStatus::Success => Ok(LoadStatus::Success),
            LoadStatus::Conflict => {
                self.fallback_insert(run, write, source, row_override)
                    .await
            }
        }
    }

    /// Write `write` as `dml_type`, re-running its transform when it has one
    fn retarget(
        &self,
        write: &TargetWrite,
        dml_type: DmlType,
        source: &SourceRow,
        row_override: Option<&Row>,
    ) -> Option<TargetWrite> {
        match (&write.transformed, row_override) {
            (Some(attempted), None) => self
                .transforms
                .fallback(attempted, dml_type, source)
                .map(|t| TargetWrite::transformed(Arc::clone(&write.metadata), t)),
            _ => Some(write.with_dml(dml_type)),
        }
    }

    async fn fallback_update(
        &self,
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        source: &SourceRow,
        row_override: Option<&Row>,
        changes_only: bool,
    ) -> Result<LoadStatus> {
        let Some(target) = self.retarget(write, DmlType::Update, source, row_override) else {
            return Ok(LoadStatus::Conflict);
        };
        let values = match row_override {
            Some(row) => fit_row(row, &target.metadata),
            None => target.values.clone(),
        };
        let status = self
            .update(run, &target, &values, changes_only, None)
            .await?;
        if status == LoadStatus::Success {
            run.statistics.fallback_update_count += 1;
        }
        Ok(status)
    }

    async fn fallback_insert(
        &self,
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        source: &SourceRow,
        row_override: Option<&Row>,
    ) -> Result<LoadStatus> {
        let Some(target) = self.retarget(write, DmlType::Insert, source, row_override) else {
            return Ok(LoadStatus::Conflict);
        };
        let values = match row_override {
            Some(row) => fit_row(row, &target.metadata),
            None => target.values.clone(),
        };
        let status = self
            .insert(run, &target, &values, write.generated_identity())
            .await?;
        if status == LoadStatus::Success {
            run.statistics.fallback_insert_count += 1;
        }
        Ok(status)
    }

    async fn insert(
        &self,
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        values: &Row,
        generated_identity: bool,
    ) -> Result<LoadStatus> {
        let has_identity_column = write.metadata.columns.iter().any(|c| c.auto_increment);
        let identity = write.metadata.has_identity_in(values)
            || (generated_identity && has_identity_column);

        if identity {
            self.target(
                "enable identity insert",
                self.executor.set_identity_insert(&write.table, true),
            )
            .await?;
        }

        let statement =
            run.statements
                .statement(DmlType::Insert, &write.table, values.clone(), Row::default());
        let status = self.execute(run, statement).await;

        if identity {
            let reset = self
                .target(
                    "disable identity insert",
                    self.executor.set_identity_insert(&write.table, false),
                )
                .await;
            if let Err(e) = reset {
                if status.is_ok() {
                    return Err(e);
                }
                warn!(table = %write.table, error = %e, "Could not disable identity insert");
            }
        }
        status
    }

    /// Update the columns of `values` that need writing.
    ///
    /// With `changes_only`, columns equal to their old value are left out.
    /// An update with nothing left to write succeeds without a statement.
    async fn update(
        &self,
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        values: &Row,
        changes_only: bool,
        detect: Option<&ConflictPolicy>,
    ) -> Result<LoadStatus> {
        let old_values = write.old_values.as_ref().filter(|_| changes_only);
        let columns: Row = values
            .iter()
            .filter(|(column, value)| {
                let changed = old_values
                    .and_then(|old| old.get_by_name(column))
                    .is_none_or(|old| old != *value);
                let unchanged_key = write
                    .key_values
                    .get_by_name(column)
                    .is_some_and(|key| key == *value);
                changed && !unchanged_key
            })
            .map(|(column, value)| (column, value.clone()))
            .collect();

        if columns.is_empty() {
            debug!(
                table = %write.table,
                key = ?write.key_values,
                "No changed columns to update"
            );
            return Ok(LoadStatus::Success);
        }

        let lookup = Self::lookup(write, detect);
        let statement = run
            .statements
            .statement(DmlType::Update, &write.table, columns, lookup);
        self.execute(run, statement).await
    }

    async fn delete(
        &self,
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        detect: Option<&ConflictPolicy>,
    ) -> Result<LoadStatus> {
        let lookup = Self::lookup(write, detect);
        let statement = run
            .statements
            .statement(DmlType::Delete, &write.table, Row::default(), lookup);
        self.execute(run, statement).await
    }

    /// Key predicates, plus the old detect column value when `detect`
    /// compares timestamps or versions
    fn lookup(write: &TargetWrite, detect: Option<&ConflictPolicy>) -> Row {
        let mut lookup = Row::default();
        let detect_column = detect
            .filter(|p| p.detect_type.uses_detect_column())
            .and_then(|p| p.detect_expression.as_deref());
        if let (Some(column), Some(old)) = (detect_column, write.old_values.as_ref()) {
            if let Some(value) = old.get_by_name(column) {
                lookup.set(column, value.clone());
            }
        }
        for (column, value) in write.key_values.iter() {
            if !lookup.contains(column) {
                lookup.set(column, value.clone());
            }
        }
        lookup
    }

    async fn execute(&self, run: &mut BatchRun<'_>, statement: DmlStatement) -> Result<LoadStatus> {
        let started = Instant::now();
        let executed = bounded(self.config.query_timeout(), "execute statement", async {
            Ok::<_, EngineError>(self.executor.execute(&statement).await)
        })
        .await?;
        run.statistics.record_database_time(started.elapsed());
        run.statistics.statement_count += 1;

        match executed {
            Ok(0) => Ok(LoadStatus::Conflict),
            Ok(rows) => {
                match statement.dml_type {
                    DmlType::Insert => run.statistics.insert_count += rows,
                    DmlType::Update => run.statistics.update_count += rows,
                    DmlType::Delete => run.statistics.delete_count += rows,
                }
                Ok(LoadStatus::Success)
            }
            Err(e) if e.is_unique_violation() && statement.dml_type != DmlType::Delete => {
                debug!(
                    table = %statement.table,
                    dml_type = %statement.dml_type,
                    error = %e,
                    "Unique constraint violated"
                );
                Ok(LoadStatus::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_newer(&self, write: &TargetWrite, policy: &ConflictPolicy) -> Result<bool> {
        bounded(
            self.config.query_timeout(),
            "conflict detection read",
            self.detector.is_newer(
                self.executor.as_ref(),
                policy,
                &write.table,
                &write.key_values,
                &write.values,
            ),
        )
        .await
    }

    fn skip_or_abort(
        run: &mut BatchRun<'_>,
        write: &TargetWrite,
        policy: &ConflictPolicy,
        reason: &str,
    ) -> ApplyOutcome {
        if policy.resolve_row_only {
            run.statistics.ignore_count += 1;
            ApplyOutcome::RowSkipped
        } else {
            ApplyOutcome::BatchAborted(format!(
                "{} conflict on {} under policy '{}': {}",
                write.dml_type, write.table, policy.id, reason
            ))
        }
    }

    fn require(
        &self,
        run: &BatchRun<'_>,
        line_number: u64,
        write: &TargetWrite,
        status: LoadStatus,
        message: &str,
    ) -> Result<ApplyOutcome> {
        match status {
            LoadStatus::Success => Ok(ApplyOutcome::Success),
            LoadStatus::Conflict => Err(self.unresolved(run, line_number, write, message)),
        }
    }

    fn unresolved(
        &self,
        run: &BatchRun<'_>,
        line_number: u64,
        write: &TargetWrite,
        message: &str,
    ) -> EngineError {
        EngineError::Conflict {
            batch_id: run.batch.batch_id,
            table: write.table.clone(),
            line_number,
            message: message.to_string(),
        }
    }

    async fn rollback_quietly(&self, batch_id: i64) {
        if let Err(e) = self.target("rollback", self.executor.rollback()).await {
            warn!(batch_id, error = %e, "Rollback failed");
        }
    }

    async fn target<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = rowsync_rdbc::Result<T>>,
    {
        bounded(self.config.query_timeout(), what, async {
            fut.await.map_err(EngineError::from)
        })
        .await
    }

    async fn target_registry<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(self.config.query_timeout(), what, fut).await
    }
}
