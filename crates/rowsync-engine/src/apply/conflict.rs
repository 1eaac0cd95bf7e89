//! Conflict policy configuration
//!
//! A policy names how divergence is detected on a target table and how it is
//! resolved. Policies may be scoped to a target table, a channel, or both;
//! the most specific match wins.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// How a detected conflict is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolveType {
    /// Retry as the opposite DML
    #[default]
    Fallback,
    /// Overwrite only when the incoming row is newer
    NewerWins,
    /// Skip the row (or abort the batch)
    Ignore,
    /// Use operator-supplied resolved data
    Manual,
}

/// How a conflict is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectType {
    /// Primary key lookup without extra predicates
    None,
    /// Primary key plus the old value of a timestamp column
    UseTimestamp,
    /// Primary key plus the old value of a version column
    UseVersion,
    /// Primary key lookup
    #[default]
    UsePkData,
}

impl DetectType {
    /// Whether the detect expression joins the lookup predicates
    pub fn uses_detect_column(self) -> bool {
        matches!(self, Self::UseTimestamp | Self::UseVersion)
    }
}

/// Conflict detection and resolution rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    /// Policy id
    pub id: String,

    /// Target table the policy applies to, all tables when absent
    #[serde(default)]
    pub target_table: Option<String>,

    /// Channel the policy applies to, all channels when absent
    #[serde(default)]
    pub channel_id: Option<String>,

    /// Resolution strategy
    #[serde(default)]
    pub resolve_type: ResolveType,

    /// Detection strategy
    #[serde(default)]
    pub detect_type: DetectType,

    /// Timestamp or version column compared by NEWER_WINS
    #[serde(default)]
    pub detect_expression: Option<String>,

    /// Unresolved conflicts skip the row instead of aborting the batch
    #[serde(default = "default_true")]
    pub resolve_row_only: bool,

    /// Fallback updates write only changed columns
    #[serde(default)]
    pub resolve_changes_only: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            target_table: None,
            channel_id: None,
            resolve_type: ResolveType::Fallback,
            detect_type: DetectType::UsePkData,
            detect_expression: None,
            resolve_row_only: true,
            resolve_changes_only: false,
        }
    }
}

impl ConflictPolicy {
    /// Create a policy applying to every table and channel
    pub fn new(id: impl Into<String>, resolve_type: ResolveType, detect_type: DetectType) -> Self {
        Self {
            id: id.into(),
            resolve_type,
            detect_type,
            ..Self::default()
        }
    }

    /// Scope to a target table
    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.target_table = Some(table.into());
        self
    }

    /// Scope to a channel
    pub fn for_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    /// Set the detect column
    pub fn with_detect_expression(mut self, column: impl Into<String>) -> Self {
        self.detect_expression = Some(column.into());
        self
    }

    /// Set row-only resolution
    pub fn with_resolve_row_only(mut self, row_only: bool) -> Self {
        self.resolve_row_only = row_only;
        self
    }

    /// Set changes-only fallback updates
    pub fn with_resolve_changes_only(mut self, changes_only: bool) -> Self {
        self.resolve_changes_only = changes_only;
        self
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.detect_type.uses_detect_column()
            && self
                .detect_expression
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(EngineError::config(format!(
                "Conflict policy '{}' detects by {:?} but has no detect_expression",
                self.id, self.detect_type
            )));
        }
        Ok(())
    }

    fn specificity(&self, table: &str, channel_id: &str) -> Option<u8> {
        let table_match = match &self.target_table {
            Some(t) if t.eq_ignore_ascii_case(table) => Some(true),
            Some(_) => None,
            None => Some(false),
        }?;
        let channel_match = match &self.channel_id {
            Some(c) if c == channel_id => Some(true),
            Some(_) => None,
            None => Some(false),
        }?;
        Some(match (table_match, channel_match) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 1,
            (false, false) => 0,
        })
    }
}

/// Configured conflict policies with most-specific lookup
#[derive(Debug, Clone, Default)]
pub struct ConflictSettings {
    policies: Vec<ConflictPolicy>,
    fallback: ConflictPolicy,
}

impl ConflictSettings {
    /// Wrap configured policies
    pub fn new(policies: Vec<ConflictPolicy>) -> Self {
        Self {
            policies,
            fallback: ConflictPolicy::default(),
        }
    }

    /// Pick the policy for a target table on a channel.
    ///
    /// Table and channel match beats table match, which beats channel match,
    /// which beats an unscoped policy. Without any match the built-in default
    /// (FALLBACK on primary key data, row-only) applies.
    pub fn pick(&self, table: &str, channel_id: &str) -> &ConflictPolicy {
        self.policies
            .iter()
            .filter_map(|p| p.specificity(table, channel_id).map(|s| (s, p)))
            .fold(None, |best: Option<(u8, &ConflictPolicy)>, (s, p)| match best {
                Some((b, _)) if b >= s => best,
                _ => Some((s, p)),
            })
            .map(|(_, p)| p)
            .unwrap_or(&self.fallback)
    }
}
