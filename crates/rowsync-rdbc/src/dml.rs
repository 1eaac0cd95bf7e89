//! DML statements issued against a target table
//!
//! A [`DmlStatement`] carries both the values to write and the lookup values
//! that locate the affected row, alongside parameterised ANSI SQL text for
//! backends that execute SQL. Placeholders are bound in the order: written
//! columns, then lookup columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::types::{Row, Value};

/// Kind of row mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DmlType {
    /// Row insertion
    Insert,
    /// Row update
    Update,
    /// Row deletion
    Delete,
}

impl DmlType {
    /// Short code used in logs (`I`, `U`, `D`)
    pub const fn code(self) -> char {
        match self {
            Self::Insert => 'I',
            Self::Update => 'U',
            Self::Delete => 'D',
        }
    }
}

impl fmt::Display for DmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Render parameterised SQL for a statement shape
pub fn render_sql<S: AsRef<str>>(
    dml_type: DmlType,
    table: &str,
    columns: &[S],
    lookup: &[S],
) -> String {
    let where_clause = || {
        if lookup.is_empty() {
            String::new()
        } else {
            let preds: Vec<String> = lookup
                .iter()
                .map(|c| format!("{} = ?", c.as_ref()))
                .collect();
            format!(" WHERE {}", preds.join(" AND "))
        }
    };

    match dml_type {
        DmlType::Insert => {
            let names: Vec<&str> = columns.iter().map(AsRef::as_ref).collect();
            let marks = vec!["?"; names.len()];
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                names.join(", "),
                marks.join(", ")
            )
        }
        DmlType::Update => {
            let sets: Vec<String> = columns
                .iter()
                .map(|c| format!("{} = ?", c.as_ref()))
                .collect();
            format!("UPDATE {} SET {}{}", table, sets.join(", "), where_clause())
        }
        DmlType::Delete => format!("DELETE FROM {}{}", table, where_clause()),
    }
}

/// A single DML statement ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct DmlStatement {
    /// Statement kind
    pub dml_type: DmlType,
    /// Target table
    pub table: String,
    /// Values written (inserted columns, or SET columns of an update)
    pub columns: Row,
    /// Values identifying the affected row (WHERE clause)
    pub lookup: Row,
    sql: Arc<str>,
}

impl DmlStatement {
    /// Build a statement, rendering its SQL
    pub fn new(dml_type: DmlType, table: impl Into<String>, columns: Row, lookup: Row) -> Self {
        let table = table.into();
        let sql = render_sql(dml_type, &table, columns.columns(), lookup.columns());
        Self {
            dml_type,
            table,
            columns,
            lookup,
            sql: sql.into(),
        }
    }

    /// Build a statement around SQL text rendered earlier for the same shape
    pub fn with_sql(
        sql: Arc<str>,
        dml_type: DmlType,
        table: impl Into<String>,
        columns: Row,
        lookup: Row,
    ) -> Self {
        Self {
            dml_type,
            table: table.into(),
            columns,
            lookup,
            sql,
        }
    }

    /// Parameterised SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bind parameters in placeholder order
    pub fn params(&self) -> Vec<Value> {
        self.columns
            .values()
            .iter()
            .chain(self.lookup.values())
            .cloned()
            .collect()
    }
}
