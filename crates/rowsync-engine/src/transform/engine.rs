//! Transform engine
//!
//! Rewrites one captured change into zero or more target writes. The engine
//! is a pure function of its rules and inputs; the apply engine decides what
//! to execute and drives fallback chaining through [`TransformEngine::fallback`].

use rowsync_rdbc::dml::DmlType;
use rowsync_rdbc::types::{Row, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::{error, warn};

use super::rule::{ColumnPolicy, ColumnTransform, DeleteAction, TransformColumn, TransformRule};

/// Captured change as seen by the transform engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    /// Source table
    pub table: String,
    /// Current column values (empty for deletes)
    pub values: Row,
    /// Source primary key columns and values
    pub key_values: Row,
    /// Column values before the change
    pub old_values: Option<Row>,
}

impl SourceRow {
    /// Value of a source key column: key data, else old row, else current row
    fn key_value(&self, column: &str) -> Option<&Value> {
        self.key_values
            .get_by_name(column)
            .or_else(|| self.old_values.as_ref().and_then(|r| r.get_by_name(column)))
            .or_else(|| self.values.get_by_name(column))
    }

    /// Row that non-key values are read from for a source DML type
    fn data_for(&self, dml_type: DmlType) -> &Row {
        match dml_type {
            DmlType::Delete => self.old_values.as_ref().unwrap_or(&self.key_values),
            DmlType::Insert | DmlType::Update => &self.values,
        }
    }

    /// Copy carrying the removed row as current values, for re-running a delete
    fn with_deleted_data(&self) -> SourceRow {
        SourceRow {
            values: self.data_for(DmlType::Delete).clone(),
            ..self.clone()
        }
    }
}

/// One target write produced by a rule
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedWrite {
    /// Rule that produced the write
    pub rule_id: String,
    /// DML type of the source change
    pub source_dml: DmlType,
    /// DML type to execute first against the target
    pub target_dml: DmlType,
    /// Target table
    pub target_table: String,
    /// Column values to write
    pub values: Row,
    /// Target primary key values identifying the row
    pub key_values: Row,
    /// Target column values before the change, for updates
    pub old_values: Option<Row>,
    /// Rule declares a generated identity key
    pub generated_identity: bool,
}

/// Rule-driven change rewriting
#[derive(Debug, Clone, Default)]
pub struct TransformEngine {
    /// Rules by lower-cased source table, in transform order
    rules: HashMap<String, Vec<TransformRule>>,
}

impl TransformEngine {
    /// Index rules by source table
    pub fn new(rules: impl IntoIterator<Item = TransformRule>) -> Self {
        let mut by_table: HashMap<String, Vec<TransformRule>> = HashMap::new();
        for rule in rules {
            by_table
                .entry(rule.source_table.to_ascii_lowercase())
                .or_default()
                .push(rule);
        }
        for rules in by_table.values_mut() {
            rules.sort_by(|a, b| {
                a.transform_order
                    .cmp(&b.transform_order)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
        Self { rules: by_table }
    }

    /// Whether any rule reads `table`
    pub fn handles(&self, table: &str) -> bool {
        self.rules.contains_key(&table.to_ascii_lowercase())
    }

    /// Rules for a source table, in transform order
    pub fn rules_for(&self, table: &str) -> &[TransformRule] {
        self.rules
            .get(&table.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Transform a source change into target writes, one per matching rule
    pub fn transform(&self, dml_type: DmlType, source: &SourceRow) -> Vec<TransformedWrite> {
        self.rules_for(&source.table)
            .iter()
            .filter(|rule| rule.include_on.includes(dml_type))
            .filter_map(|rule| Self::apply_rule(rule, dml_type, source, None))
            .collect()
    }

    /// Re-run the rule behind `attempted` as `fallback_dml`.
    ///
    /// The result is accepted only when it addresses the same target row as
    /// the attempted write, or when the rule generates its identity keys.
    pub fn fallback(
        &self,
        attempted: &TransformedWrite,
        fallback_dml: DmlType,
        source: &SourceRow,
    ) -> Option<TransformedWrite> {
        let rule = self
            .rules_for(&source.table)
            .iter()
            .find(|r| r.id == attempted.rule_id)?;
        let source: Cow<'_, SourceRow> = match attempted.source_dml {
            DmlType::Delete => Cow::Owned(source.with_deleted_data()),
            DmlType::Insert | DmlType::Update => Cow::Borrowed(source),
        };
        let write = Self::apply_rule(rule, fallback_dml, &source, Some(fallback_dml))?;

        if write.key_values == attempted.key_values || rule.generated_identity {
            Some(write)
        } else {
            warn!(
                rule = %rule.id,
                attempted = ?attempted.key_values,
                fallback = ?write.key_values,
                "Fallback write addresses a different target row, not applying it"
            );
            None
        }
    }

    fn apply_rule(
        rule: &TransformRule,
        dml_type: DmlType,
        source: &SourceRow,
        target_override: Option<DmlType>,
    ) -> Option<TransformedWrite> {
        let rule: Cow<'_, TransformRule> = match rule.column_policy {
            ColumnPolicy::Explicit => Cow::Borrowed(rule),
            ColumnPolicy::Implied => {
                let columns = source.data_for(dml_type).columns();
                Cow::Owned(rule.with_implied_columns(source.key_values.columns(), columns))
            }
        };

        if !rule.has_primary_key() {
            error!(
                rule = %rule.id,
                target_table = %rule.target_table,
                "Transform has no primary key columns, cannot produce target writes"
            );
            return None;
        }

        let target_dml = match target_override {
            Some(dml) => dml,
            None => match dml_type {
                DmlType::Insert if rule.update_first => DmlType::Update,
                DmlType::Insert => DmlType::Insert,
                DmlType::Update => DmlType::Update,
                DmlType::Delete => match rule.delete_action {
                    DeleteAction::DelRow => DmlType::Delete,
                    DeleteAction::UpdateCol => DmlType::Update,
                    DeleteAction::None => return None,
                },
            },
        };

        let data = source.data_for(dml_type);
        let mut key_values = Row::default();
        let mut values = Row::default();
        let mut old_values = source.old_values.as_ref().map(|_| Row::default());

        for column in rule.columns.iter().filter(|c| c.primary_key) {
            match Self::column_value(column, |name| source.key_value(name)) {
                Some(value) => key_values.set(column.target_column.clone(), value),
                None => warn!(
                    rule = %rule.id,
                    column = column.source_column.as_deref().unwrap_or_default(),
                    "Source key column missing, target key will be incomplete"
                ),
            }
        }

        for column in rule.columns.iter().filter(|c| c.include_on.includes(dml_type)) {
            // DELETE rewritten as UPDATE writes only the non-key columns included on DELETE
            if dml_type == DmlType::Delete && column.primary_key {
                continue;
            }
            match Self::column_value(column, |name| data.get_by_name(name)) {
                Some(value) => values.set(column.target_column.clone(), value),
                None => {
                    warn!(
                        rule = %rule.id,
                        column = column.source_column.as_deref().unwrap_or_default(),
                        source_table = %source.table,
                        "Source column missing, skipping target column {}",
                        column.target_column
                    );
                    continue;
                }
            }
            // Constants have no previous value, so changes-only updates always write them
            if column.transform != ColumnTransform::Copy {
                continue;
            }
            if let (Some(old_target), Some(old_source)) = (old_values.as_mut(), &source.old_values)
            {
                if let Some(value) = Self::column_value(column, |name| old_source.get_by_name(name))
                {
                    old_target.set(column.target_column.clone(), value);
                }
            }
        }

        if dml_type == DmlType::Delete && target_dml == DmlType::Delete {
            values = Row::default();
        }

        Some(TransformedWrite {
            rule_id: rule.id.clone(),
            source_dml: dml_type,
            target_dml,
            target_table: rule.target_table.clone(),
            values,
            key_values,
            old_values,
            generated_identity: rule.generated_identity,
        })
    }

    fn column_value<'a>(
        column: &TransformColumn,
        lookup: impl Fn(&str) -> Option<&'a Value>,
    ) -> Option<Value> {
        match &column.transform {
            ColumnTransform::Constant(value) => Some(value.clone()),
            ColumnTransform::Copy => column
                .source_column
                .as_deref()
                .and_then(lookup)
                .cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::rule::IncludeOn;

    fn customer_rule() -> TransformRule {
        TransformRule::new("customer_to_client", "customer", "client")
            .with_column(TransformColumn::copy("id", "client_id").pk())
            .with_column(TransformColumn::copy("name", "client_name"))
    }

    fn customer_row() -> SourceRow {
        SourceRow {
            table: "customer".into(),
            values: Row::default().with("id", 1).with("name", "Ada").with("city", "Paris"),
            key_values: Row::default().with("id", 1),
            old_values: None,
        }
    }

    #[test]
    fn test_explicit_insert() {
        let engine = TransformEngine::new([customer_rule()]);
        let writes = engine.transform(DmlType::Insert, &customer_row());

        assert_eq!(writes.len(), 1);
        let write = &writes[0];
        assert_eq!(write.target_dml, DmlType::Insert);
        assert_eq!(write.target_table, "client");
        assert_eq!(
            write.values,
            Row::default().with("client_id", 1).with("client_name", "Ada")
        );
        assert_eq!(write.key_values, Row::default().with("client_id", 1));
    }

    #[test]
    fn test_unknown_table_yields_nothing() {
        let engine = TransformEngine::new([customer_rule()]);
        let mut row = customer_row();
        row.table = "supplier".into();
        assert!(engine.transform(DmlType::Insert, &row).is_empty());
        assert!(!engine.handles("supplier"));
    }

    #[test]
    fn test_rule_without_primary_key_yields_nothing() {
        let rule = TransformRule::new("r", "customer", "client")
            .with_column(TransformColumn::copy("name", "client_name"));
        let engine = TransformEngine::new([rule]);
        assert!(engine.transform(DmlType::Insert, &customer_row()).is_empty());
    }

    #[test]
    fn test_fan_out_in_transform_order() {
        let audit = TransformRule::new("audit", "customer", "customer_audit")
            .with_transform_order(2)
            .with_column(TransformColumn::copy("id", "customer_id").pk())
            .with_column(TransformColumn::constant("source", "replication"));
        let engine = TransformEngine::new([audit, customer_rule().with_transform_order(1)]);

        let writes = engine.transform(DmlType::Insert, &customer_row());
        let tables: Vec<&str> = writes.iter().map(|w| w.target_table.as_str()).collect();
        assert_eq!(tables, vec!["client", "customer_audit"]);
        assert_eq!(
            writes[1].values.get_by_name("source"),
            Some(&Value::from("replication"))
        );
    }

    #[test]
    fn test_update_first_redirects_insert() {
        let engine = TransformEngine::new([customer_rule().with_update_first(true)]);
        let writes = engine.transform(DmlType::Insert, &customer_row());
        assert_eq!(writes[0].target_dml, DmlType::Update);
        assert_eq!(writes[0].source_dml, DmlType::Insert);
    }

    #[test]
    fn test_delete_actions() {
        let row = SourceRow {
            table: "customer".into(),
            values: Row::default(),
            key_values: Row::default().with("id", 1),
            old_values: Some(Row::default().with("id", 1).with("name", "Ada")),
        };

        let engine = TransformEngine::new([customer_rule()]);
        let writes = engine.transform(DmlType::Delete, &row);
        assert_eq!(writes[0].target_dml, DmlType::Delete);
        assert!(writes[0].values.is_empty());
        assert_eq!(writes[0].key_values, Row::default().with("client_id", 1));

        let flagging = customer_rule()
            .with_delete_action(DeleteAction::UpdateCol)
            .with_column(TransformColumn::constant("active", false).on(IncludeOn::Delete));
        let engine = TransformEngine::new([flagging]);
        let writes = engine.transform(DmlType::Delete, &row);
        assert_eq!(writes[0].target_dml, DmlType::Update);
        assert_eq!(
            writes[0].values,
            Row::default().with("client_name", "Ada").with("active", false)
        );

        let ignoring = customer_rule().with_delete_action(DeleteAction::None);
        let engine = TransformEngine::new([ignoring]);
        assert!(engine.transform(DmlType::Delete, &row).is_empty());
    }

    #[test]
    fn test_implied_columns_follow_source_row() {
        let rule = TransformRule::new("r", "customer", "client")
            .with_column_policy(ColumnPolicy::Implied)
            .with_column(TransformColumn::copy("name", "client_name"));
        let engine = TransformEngine::new([rule]);

        let first = engine.transform(DmlType::Insert, &customer_row());
        let second = engine.transform(DmlType::Insert, &customer_row());
        assert_eq!(first, second);
        assert_eq!(
            first[0].values.columns(),
            &["client_name".to_string(), "id".to_string(), "city".to_string()]
        );
        assert_eq!(first[0].key_values, Row::default().with("id", 1));
    }

    #[test]
    fn test_old_values_mapped_for_updates() {
        let mut row = customer_row();
        row.old_values = Some(Row::default().with("id", 1).with("name", "Ada L."));
        let engine = TransformEngine::new([customer_rule()]);

        let writes = engine.transform(DmlType::Update, &row);
        assert_eq!(
            writes[0].old_values,
            Some(Row::default().with("client_id", 1).with("client_name", "Ada L."))
        );
    }

    #[test]
    fn test_fallback_requires_same_key_or_generated_identity() {
        let engine = TransformEngine::new([customer_rule()]);
        let row = customer_row();
        let attempted = engine.transform(DmlType::Insert, &row).remove(0);

        let fallback = engine.fallback(&attempted, DmlType::Update, &row).unwrap();
        assert_eq!(fallback.target_dml, DmlType::Update);
        assert_eq!(fallback.key_values, attempted.key_values);

        let mut moved = attempted.clone();
        moved.key_values = Row::default().with("client_id", 99);
        assert!(engine.fallback(&moved, DmlType::Update, &row).is_none());

        let engine = TransformEngine::new([customer_rule().with_generated_identity(true)]);
        assert!(engine.fallback(&moved, DmlType::Update, &row).is_some());
    }

    #[test]
    fn test_fallback_of_flagged_delete_reads_removed_row() {
        let flagging = customer_rule()
            .with_delete_action(DeleteAction::UpdateCol)
            .with_column(TransformColumn::constant("active", false).on(IncludeOn::Delete));
        let engine = TransformEngine::new([flagging]);
        let row = SourceRow {
            table: "customer".into(),
            values: Row::default(),
            key_values: Row::default().with("id", 1),
            old_values: Some(Row::default().with("id", 1).with("name", "Ada")),
        };
        let attempted = engine.transform(DmlType::Delete, &row).remove(0);

        let insert = engine.fallback(&attempted, DmlType::Insert, &row).unwrap();
        assert_eq!(insert.target_dml, DmlType::Insert);
        assert_eq!(insert.source_dml, DmlType::Insert);
        assert_eq!(
            insert.values,
            Row::default().with("client_id", 1).with("client_name", "Ada")
        );
        assert_eq!(insert.key_values, attempted.key_values);

        // Without old data the key is all that is left to write
        let keys_only = SourceRow {
            old_values: None,
            ..row
        };
        let attempted = engine.transform(DmlType::Delete, &keys_only).remove(0);
        let insert = engine.fallback(&attempted, DmlType::Insert, &keys_only).unwrap();
        assert_eq!(insert.values, Row::default().with("client_id", 1));
    }
}
