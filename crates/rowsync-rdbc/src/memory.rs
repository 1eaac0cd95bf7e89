//! In-process target database
//!
//! [`MemoryDatabase`] enforces primary keys and identity columns, keeps
//! uncommitted work undoable, and records every executed statement. It backs
//! the test suites and embedders that replicate into local state.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::dml::{DmlStatement, DmlType};
use crate::error::{ConstraintKind, Error, Result};
use crate::executor::DmlExecutor;
use crate::types::{Row, TableMetadata, Value};

#[derive(Debug)]
struct MemoryTable {
    metadata: TableMetadata,
    rows: Vec<Row>,
    next_identity: i64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    identity_insert: HashSet<String>,
    /// Table contents as of the last commit, captured on first write
    snapshots: HashMap<String, (Vec<Row>, i64)>,
    statements: Vec<String>,
}

/// In-memory [`DmlExecutor`]
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

fn table_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Compare values the way a typical SQL backend does for equality predicates
fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
            a.as_i64() == b.as_i64()
        }
        _ => a == b,
    }
}

fn row_matches(row: &Row, lookup: &Row) -> bool {
    lookup.iter().all(|(column, expected)| {
        row.get_by_name(column)
            .is_some_and(|actual| values_match(actual, expected))
    })
}

impl MemoryTable {
    fn pk_of(&self, row: &Row) -> Row {
        let names: Vec<&str> = self
            .metadata
            .primary_key_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        row.project(&names)
    }

    fn pk_conflict(&self, candidate: &Row, skip: Option<usize>) -> bool {
        let pk = self.pk_of(candidate);
        if pk.is_empty() {
            return false;
        }
        self.rows
            .iter()
            .enumerate()
            .any(|(idx, existing)| Some(idx) != skip && row_matches(existing, &pk))
    }

    fn check_columns(&self, row: &Row) -> Result<()> {
        for column in row.columns() {
            if self.metadata.column(column).is_none() {
                return Err(Error::ColumnNotFound {
                    table: self.metadata.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table
    pub fn create_table(&self, metadata: TableMetadata) {
        let mut state = self.state.lock();
        state.tables.insert(
            table_key(&metadata.name),
            MemoryTable {
                metadata,
                rows: Vec::new(),
                next_identity: 1,
            },
        );
    }

    /// Seed a committed row, bypassing constraint checks
    pub fn seed_row(&self, table: &str, row: Row) -> Result<()> {
        let mut state = self.state.lock();
        let t = state
            .tables
            .get_mut(&table_key(table))
            .ok_or_else(|| Error::TableNotFound {
                table: table.to_string(),
            })?;
        t.rows.push(row);
        Ok(())
    }

    /// Current rows of a table, including uncommitted work
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(&table_key(table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// First row matching all of `keys`
    pub fn find(&self, table: &str, keys: &Row) -> Option<Row> {
        self.state
            .lock()
            .tables
            .get(&table_key(table))
            .and_then(|t| t.rows.iter().find(|r| row_matches(r, keys)).cloned())
    }

    /// SQL text of every statement executed so far
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Whether uncommitted work exists
    pub fn has_pending_work(&self) -> bool {
        !self.state.lock().snapshots.is_empty()
    }

    fn execute_locked(state: &mut State, statement: &DmlStatement) -> Result<u64> {
        let key = table_key(&statement.table);
        let identity_allowed = state.identity_insert.contains(&key);
        let table = state
            .tables
            .get_mut(&key)
            .ok_or_else(|| Error::TableNotFound {
                table: statement.table.clone(),
            })?;

        if !state.snapshots.contains_key(&key) {
            state
                .snapshots
                .insert(key.clone(), (table.rows.clone(), table.next_identity));
        }

        match statement.dml_type {
            DmlType::Insert => {
                table.check_columns(&statement.columns)?;
                if table.metadata.has_identity_in(&statement.columns) && !identity_allowed {
                    return Err(Error::query_with_sql(
                        format!(
                            "explicit value for identity column of {} requires identity insert",
                            statement.table
                        ),
                        statement.sql(),
                    ));
                }

                let mut row = Row::default();
                for column in &table.metadata.columns {
                    match statement.columns.get_by_name(&column.name) {
                        Some(value) => {
                            if column.auto_increment {
                                if let Some(n) = value.as_i64() {
                                    table.next_identity = table.next_identity.max(n + 1);
                                }
                            }
                            row.set(column.name.clone(), value.clone());
                        }
                        None if column.auto_increment => {
                            row.set(column.name.clone(), Value::Int64(table.next_identity));
                            table.next_identity += 1;
                        }
                        None if column.is_primary_key() => {
                            return Err(Error::constraint(
                                ConstraintKind::NotNull,
                                &table.metadata.name,
                                &column.name,
                                "primary key column has no value",
                            ));
                        }
                        None => row.set(column.name.clone(), Value::Null),
                    }
                }

                if table.pk_conflict(&row, None) {
                    return Err(Error::unique_violation(
                        &table.metadata.name,
                        format!("pk_{}", table.metadata.name),
                        format!("duplicate key {:?}", table.pk_of(&row)),
                    ));
                }
                table.rows.push(row);
                Ok(1)
            }
            DmlType::Update => {
                table.check_columns(&statement.columns)?;
                if statement.lookup.is_empty() {
                    return Err(Error::query_with_sql("update without lookup", statement.sql()));
                }
                let matched: Vec<usize> = table
                    .rows
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| row_matches(r, &statement.lookup))
                    .map(|(idx, _)| idx)
                    .collect();

                for &idx in &matched {
                    let mut updated = table.rows[idx].clone();
                    for (column, value) in statement.columns.iter() {
                        updated.set(column, value.clone());
                    }
                    if table.pk_conflict(&updated, Some(idx)) {
                        return Err(Error::unique_violation(
                            &table.metadata.name,
                            format!("pk_{}", table.metadata.name),
                            format!("duplicate key {:?}", table.pk_of(&updated)),
                        ));
                    }
                    table.rows[idx] = updated;
                }
                Ok(matched.len() as u64)
            }
            DmlType::Delete => {
                if statement.lookup.is_empty() {
                    return Err(Error::query_with_sql("delete without lookup", statement.sql()));
                }
                let before = table.rows.len();
                table.rows.retain(|r| !row_matches(r, &statement.lookup));
                Ok((before - table.rows.len()) as u64)
            }
        }
    }
}

#[async_trait]
impl DmlExecutor for MemoryDatabase {
    async fn execute(&self, statement: &DmlStatement) -> Result<u64> {
        let mut state = self.state.lock();
        state.statements.push(statement.sql().to_string());
        let affected = Self::execute_locked(&mut state, statement)?;
        trace!(sql = statement.sql(), affected, "executed statement");
        Ok(affected)
    }

    async fn query_value(&self, table: &str, column: &str, keys: &Row) -> Result<Option<Value>> {
        let state = self.state.lock();
        let t = state
            .tables
            .get(&table_key(table))
            .ok_or_else(|| Error::TableNotFound {
                table: table.to_string(),
            })?;
        if t.metadata.column(column).is_none() {
            return Err(Error::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        Ok(t.rows
            .iter()
            .find(|r| row_matches(r, keys))
            .map(|r| r.get_by_name(column).cloned().unwrap_or(Value::Null)))
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableMetadata>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&table_key(table))
            .map(|t| t.metadata.clone()))
    }

    async fn set_identity_insert(&self, table: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        if enabled {
            state.identity_insert.insert(table_key(table));
        } else {
            state.identity_insert.remove(&table_key(table));
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.state.lock().snapshots.clear();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        let snapshots = std::mem::take(&mut state.snapshots);
        for (key, (rows, next_identity)) in snapshots {
            if let Some(table) = state.tables.get_mut(&key) {
                table.rows = rows;
                table.next_identity = next_identity;
            }
        }
        Ok(())
    }
}
