//! DML executor capability
//!
//! The apply engine never talks to a driver directly. Each backend provides
//! one [`DmlExecutor`] that executes statements inside an open unit of work,
//! reads single column values for conflict detection, and exposes enough
//! table metadata to filter columns and detect identity inserts.

use async_trait::async_trait;

use crate::dml::DmlStatement;
use crate::error::Result;
use crate::types::{Row, TableMetadata, Value};

/// Executes DML against a target database
///
/// Statements run inside an implicit unit of work that is ended by
/// [`commit`](DmlExecutor::commit) or [`rollback`](DmlExecutor::rollback).
/// Constraint violations must be reported as
/// [`Error::Constraint`](crate::error::Error::Constraint) so callers can tell
/// them apart from other failures.
#[async_trait]
pub trait DmlExecutor: Send + Sync {
    /// Execute a statement, returning the number of affected rows
    async fn execute(&self, statement: &DmlStatement) -> Result<u64>;

    /// Read one column of the row identified by `keys`
    ///
    /// Returns `Ok(None)` when no row matches, and `Ok(Some(Value::Null))`
    /// when the row exists but the column is NULL.
    async fn query_value(&self, table: &str, column: &str, keys: &Row) -> Result<Option<Value>>;

    /// Describe a table, `Ok(None)` if it does not exist
    async fn describe_table(&self, table: &str) -> Result<Option<TableMetadata>>;

    /// Allow or forbid explicit values for identity columns of `table`
    async fn set_identity_insert(&self, _table: &str, _enabled: bool) -> Result<()> {
        Ok(())
    }

    /// Make all statements executed since the last commit durable
    async fn commit(&self) -> Result<()>;

    /// Discard all statements executed since the last commit
    async fn rollback(&self) -> Result<()>;
}
