//! Operator-supplied resolutions for MANUAL conflicts

use rowsync_rdbc::types::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolution for one row of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedData {
    /// Replacement column values, written instead of the incoming row
    #[serde(default)]
    pub row: Option<Row>,
    /// Skip the row entirely
    #[serde(default)]
    pub ignore_row: bool,
}

impl ResolvedData {
    /// Resolution writing `row`
    pub fn with_row(row: Row) -> Self {
        Self {
            row: Some(row),
            ignore_row: false,
        }
    }

    /// Resolution skipping the row
    pub fn ignore() -> Self {
        Self {
            row: None,
            ignore_row: true,
        }
    }
}

/// Resolutions for a batch keyed by the row's 1-based line number
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRows {
    rows: HashMap<u64, ResolvedData>,
}

impl ResolvedRows {
    /// No resolutions
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resolution for `line_number`
    pub fn with(mut self, line_number: u64, resolved: ResolvedData) -> Self {
        self.rows.insert(line_number, resolved);
        self
    }

    /// Resolution for `line_number`
    pub fn get(&self, line_number: u64) -> Option<&ResolvedData> {
        self.rows.get(&line_number)
    }

    /// Whether the row at `line_number` is marked to be skipped
    pub fn is_ignored(&self, line_number: u64) -> bool {
        self.get(line_number).is_some_and(|r| r.ignore_row)
    }

    /// Number of resolutions
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no resolutions exist
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
