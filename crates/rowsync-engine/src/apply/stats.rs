//! Apply statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one applied batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatistics {
    /// Rows read from the batch
    pub line_count: u64,
    /// Statements executed against the target
    pub statement_count: u64,
    /// Rows inserted, including fallback inserts
    pub insert_count: u64,
    /// Rows updated, including fallback updates
    pub update_count: u64,
    /// Rows deleted
    pub delete_count: u64,
    /// Conflicts settled by inserting instead
    pub fallback_insert_count: u64,
    /// Conflicts settled by updating instead
    pub fallback_update_count: u64,
    /// Rows skipped by policy or by resolved data
    pub ignore_count: u64,
    /// Deletes whose row was already gone
    pub missing_delete_count: u64,
    /// Intermediate commits issued before the batch completed
    pub early_commit_count: u64,
    /// SQL texts rendered (statement cache misses)
    pub statements_prepared: u64,
    /// Time spent in target database calls (milliseconds)
    pub database_millis: u64,
}

impl BatchStatistics {
    pub(crate) fn record_database_time(&mut self, elapsed: Duration) {
        self.database_millis += elapsed.as_millis() as u64;
    }
}

/// Cumulative apply statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Batches marked OK
    pub batches_applied: u64,
    /// Batches marked ERROR
    pub batches_failed: u64,
    /// Rows read
    pub rows_loaded: u64,
    /// Rows skipped
    pub rows_ignored: u64,
    /// Fallback inserts
    pub fallback_inserts: u64,
    /// Fallback updates
    pub fallback_updates: u64,
    /// Deletes of already missing rows
    pub missing_deletes: u64,
}

/// Atomic apply statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicApplyStats {
    pub batches_applied: AtomicU64,
    pub batches_failed: AtomicU64,
    pub rows_loaded: AtomicU64,
    pub rows_ignored: AtomicU64,
    pub fallback_inserts: AtomicU64,
    pub fallback_updates: AtomicU64,
    pub missing_deletes: AtomicU64,
}

impl AtomicApplyStats {
    /// Fold a finished batch into the totals
    pub fn record_batch(&self, statistics: &BatchStatistics, applied: bool) {
        if applied {
            self.batches_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.rows_loaded
            .fetch_add(statistics.line_count, Ordering::Relaxed);
        self.rows_ignored
            .fetch_add(statistics.ignore_count, Ordering::Relaxed);
        self.fallback_inserts
            .fetch_add(statistics.fallback_insert_count, Ordering::Relaxed);
        self.fallback_updates
            .fetch_add(statistics.fallback_update_count, Ordering::Relaxed);
        self.missing_deletes
            .fetch_add(statistics.missing_delete_count, Ordering::Relaxed);

        let status = if applied { "ok" } else { "error" };
        metrics::counter!("rowsync_apply_batches_total", "status" => status).increment(1);
        metrics::counter!("rowsync_apply_rows_total").increment(statistics.line_count);
        metrics::counter!("rowsync_apply_fallback_insert_total")
            .increment(statistics.fallback_insert_count);
        metrics::counter!("rowsync_apply_fallback_update_total")
            .increment(statistics.fallback_update_count);
        metrics::counter!("rowsync_apply_ignored_rows_total").increment(statistics.ignore_count);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> ApplyStats {
        ApplyStats {
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            rows_loaded: self.rows_loaded.load(Ordering::Relaxed),
            rows_ignored: self.rows_ignored.load(Ordering::Relaxed),
            fallback_inserts: self.fallback_inserts.load(Ordering::Relaxed),
            fallback_updates: self.fallback_updates.load(Ordering::Relaxed),
            missing_deletes: self.missing_deletes.load(Ordering::Relaxed),
        }
    }
}
