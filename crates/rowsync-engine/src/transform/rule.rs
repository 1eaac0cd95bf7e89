//! Transform rule configuration
//!
//! A [`TransformRule`] maps one source table onto one target table. Column
//! mappings carry their own "included on" DML set, so a column can be written
//! on INSERT but left alone on DELETE.

use rowsync_rdbc::dml::DmlType;
use rowsync_rdbc::types::Value;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// DML types a rule or column applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncludeOn {
    /// Every DML type
    #[default]
    All,
    /// Inserts only
    Insert,
    /// Updates only
    Update,
    /// Deletes only
    Delete,
}

impl IncludeOn {
    /// Whether this set contains `dml_type`
    pub fn includes(self, dml_type: DmlType) -> bool {
        match self {
            Self::All => true,
            Self::Insert => dml_type == DmlType::Insert,
            Self::Update => dml_type == DmlType::Update,
            Self::Delete => dml_type == DmlType::Delete,
        }
    }

    const PER_DML: [IncludeOn; 3] = [Self::Insert, Self::Update, Self::Delete];
}

/// How unmapped source columns are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnPolicy {
    /// Only mapped columns are written
    #[default]
    Explicit,
    /// Unmapped columns are copied one-to-one
    Implied,
}

/// What a source DELETE does to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteAction {
    /// Delete the target row
    #[default]
    DelRow,
    /// Update the columns included on DELETE (e.g. a status flag)
    UpdateCol,
    /// Leave the target untouched
    None,
}

/// How a target column value is produced
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnTransform {
    /// Source column value, unchanged
    #[default]
    Copy,
    /// Fixed value
    Constant(Value),
}

/// One source → target column mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformColumn {
    /// Source column, absent for constant-only columns
    #[serde(default)]
    pub source_column: Option<String>,

    /// Target column
    pub target_column: String,

    /// DML types this column is written on
    #[serde(default)]
    pub include_on: IncludeOn,

    /// Whether the target column identifies the target row
    #[serde(default)]
    pub primary_key: bool,

    /// Value production
    #[serde(default)]
    pub transform: ColumnTransform,
}

impl TransformColumn {
    /// Copy `source` into `target`
    pub fn copy(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_column: Some(source.into()),
            target_column: target.into(),
            include_on: IncludeOn::All,
            primary_key: false,
            transform: ColumnTransform::Copy,
        }
    }

    /// Write a constant into `target`
    pub fn constant(target: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            source_column: None,
            target_column: target.into(),
            include_on: IncludeOn::All,
            primary_key: false,
            transform: ColumnTransform::Constant(value.into()),
        }
    }

    /// Mark as a primary key column
    pub fn pk(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Restrict to one DML type
    pub fn on(mut self, include_on: IncludeOn) -> Self {
        self.include_on = include_on;
        self
    }

    fn reads(&self, source: &str) -> bool {
        self.source_column
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(source))
    }
}

/// Source table → target table mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRule {
    /// Rule id
    pub id: String,

    /// Source table the rule matches
    pub source_table: String,

    /// Target table written
    pub target_table: String,

    /// Source DML types the rule applies to
    #[serde(default)]
    pub include_on: IncludeOn,

    /// Ordered column mappings
    #[serde(default)]
    pub columns: Vec<TransformColumn>,

    /// Effect of a source DELETE
    #[serde(default)]
    pub delete_action: DeleteAction,

    /// Treatment of unmapped source columns
    #[serde(default)]
    pub column_policy: ColumnPolicy,

    /// Attempt an UPDATE before an INSERT for source inserts
    #[serde(default)]
    pub update_first: bool,

    /// Target keys come from an identity column, so fallback writes may
    /// target a different key and need identity insert
    #[serde(default)]
    pub generated_identity: bool,

    /// Order among rules for the same source table
    #[serde(default)]
    pub transform_order: i32,
}

impl TransformRule {
    /// Create an explicit rule with no columns
    pub fn new(
        id: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_table: source_table.into(),
            target_table: target_table.into(),
            include_on: IncludeOn::All,
            columns: Vec::new(),
            delete_action: DeleteAction::DelRow,
            column_policy: ColumnPolicy::Explicit,
            update_first: false,
            generated_identity: false,
            transform_order: 0,
        }
    }

    /// Append a column mapping
    pub fn with_column(mut self, column: TransformColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Set the column policy
    pub fn with_column_policy(mut self, policy: ColumnPolicy) -> Self {
        self.column_policy = policy;
        self
    }

    /// Set the delete action
    pub fn with_delete_action(mut self, action: DeleteAction) -> Self {
        self.delete_action = action;
        self
    }

    /// Set the update-first flag
    pub fn with_update_first(mut self, update_first: bool) -> Self {
        self.update_first = update_first;
        self
    }

    /// Set the generated identity flag
    pub fn with_generated_identity(mut self, generated: bool) -> Self {
        self.generated_identity = generated;
        self
    }

    /// Set the order among rules of the same source table
    pub fn with_transform_order(mut self, order: i32) -> Self {
        self.transform_order = order;
        self
    }

    /// Whether any mapping marks a primary key column
    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }

    /// Validate the rule
    pub fn validate(&self) -> Result<()> {
        if self.target_table.trim().is_empty() {
            return Err(EngineError::config(format!(
                "Transform '{}' must have a target_table",
                self.id
            )));
        }
        for column in &self.columns {
            if column.source_column.is_none() && column.transform == ColumnTransform::Copy {
                return Err(EngineError::config(format!(
                    "Transform '{}' column '{}' copies without a source_column",
                    self.id, column.target_column
                )));
            }
        }
        Ok(())
    }

    /// Rule with one-to-one mappings added for every unmapped source column.
    ///
    /// Key columns are added first, then the remaining columns, in source
    /// order. A column mapped explicitly for some DML types is implied only
    /// for the DML types it does not cover. `self` is left untouched, so
    /// expanding the same rule twice yields the same column set.
    pub fn with_implied_columns<K, C>(&self, key_columns: &[K], source_columns: &[C]) -> Self
    where
        K: AsRef<str>,
        C: AsRef<str>,
    {
        let mut expanded = self.clone();

        for key in key_columns {
            let key = key.as_ref();
            for include_on in uncovered(&self.columns, key, true) {
                expanded
                    .columns
                    .push(TransformColumn::copy(key, key).pk().on(include_on));
            }
        }

        for column in source_columns {
            let column = column.as_ref();
            if key_columns.iter().any(|k| k.as_ref().eq_ignore_ascii_case(column)) {
                continue;
            }
            for include_on in uncovered(&self.columns, column, false) {
                expanded
                    .columns
                    .push(TransformColumn::copy(column, column).on(include_on));
            }
        }

        expanded
    }
}

/// DML types for which `source` has no mapping yet
fn uncovered(columns: &[TransformColumn], source: &str, key: bool) -> Vec<IncludeOn> {
    let covered: Vec<IncludeOn> = columns
        .iter()
        .filter(|c| c.reads(source) && (!key || c.primary_key))
        .map(|c| c.include_on)
        .collect();

    if covered.is_empty() {
        vec![IncludeOn::All]
    } else if covered.contains(&IncludeOn::All) {
        Vec::new()
    } else {
        IncludeOn::PER_DML
            .into_iter()
            .filter(|i| !covered.contains(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_on() {
        assert!(IncludeOn::All.includes(DmlType::Delete));
        assert!(IncludeOn::Insert.includes(DmlType::Insert));
        assert!(!IncludeOn::Insert.includes(DmlType::Update));
    }

    #[test]
    fn test_implied_adds_keys_then_columns() {
        let rule = TransformRule::new("r", "customer", "client")
            .with_column_policy(ColumnPolicy::Implied)
            .with_column(TransformColumn::copy("name", "full_name"));

        let expanded = rule.with_implied_columns(&["id"], &["id", "name", "city"]);
        let targets: Vec<(&str, bool, IncludeOn)> = expanded
            .columns
            .iter()
            .map(|c| (c.target_column.as_str(), c.primary_key, c.include_on))
            .collect();

        assert_eq!(
            targets,
            vec![
                ("full_name", false, IncludeOn::All),
                ("id", true, IncludeOn::All),
                ("city", false, IncludeOn::All),
            ]
        );
        assert_eq!(rule.columns.len(), 1);
    }

    #[test]
    fn test_implied_fills_uncovered_dml_types() {
        let rule = TransformRule::new("r", "customer", "client")
            .with_column_policy(ColumnPolicy::Implied)
            .with_column(TransformColumn::constant("status", "new").on(IncludeOn::Insert))
            .with_column(TransformColumn::copy("status", "status").on(IncludeOn::Insert));

        let expanded = rule.with_implied_columns::<&str, &str>(&[], &["status"]);
        let implied: Vec<IncludeOn> = expanded.columns[2..].iter().map(|c| c.include_on).collect();
        assert_eq!(implied, vec![IncludeOn::Update, IncludeOn::Delete]);
    }

    #[test]
    fn test_implied_expansion_is_repeatable() {
        let rule = TransformRule::new("r", "a", "b").with_column_policy(ColumnPolicy::Implied);
        let first = rule.with_implied_columns(&["id"], &["id", "x"]);
        let second = rule.with_implied_columns(&["id"], &["id", "x"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_validate() {
        let mut rule = TransformRule::new("r", "a", "");
        assert!(rule.validate().is_err());

        rule.target_table = "b".into();
        rule.columns.push(TransformColumn {
            source_column: None,
            target_column: "x".into(),
            include_on: IncludeOn::All,
            primary_key: false,
            transform: ColumnTransform::Copy,
        });
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_parse_from_yaml() {
        let yaml = r#"
id: order_status
source_table: orders
target_table: order_archive
delete_action: UPDATE_COL
columns:
  - source_column: id
    target_column: order_id
    primary_key: true
  - target_column: deleted
    include_on: DELETE
    transform:
      constant:
        Bool: true
"#;
        let rule: TransformRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.delete_action, DeleteAction::UpdateCol);
        assert_eq!(
            rule.columns[1].transform,
            ColumnTransform::Constant(Value::Bool(true))
        );
        assert!(rule.validate().is_ok());
    }
}
