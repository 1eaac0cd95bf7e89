//! Target write errors
//!
//! Integrity violations are kept apart from every other failure: the apply
//! engine treats a unique violation as a detected conflict and resolves it,
//! while connection loss or a timeout aborts the batch and is worth retrying.

use std::fmt;
use thiserror::Error;

/// Result type for rowsync-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Target unreachable or connection dropped
    Connection,
    /// Statement rejected by the target
    Statement,
    /// Integrity constraint rejected a row
    Constraint,
    /// Commit or rollback failed
    Transaction,
    /// Call exceeded its time budget
    Timeout,
    /// Table or column unknown to the target
    Schema,
}

impl ErrorCategory {
    /// Transient failures that a later run may get past
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Statement => "statement",
            Self::Constraint => "constraint",
            Self::Transaction => "transaction",
            Self::Timeout => "timeout",
            Self::Schema => "schema",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of integrity constraint that rejected a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Primary key or unique index
    Unique,
    /// Foreign key reference
    ForeignKey,
    /// NOT NULL column
    NotNull,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unique => "unique",
            Self::ForeignKey => "foreign key",
            Self::NotNull => "not null",
        })
    }
}

/// Failure of a target database call
#[derive(Error, Debug)]
pub enum Error {
    /// Target unreachable
    #[error("target connection failed: {0}")]
    Connection(String),

    /// Statement rejected for a reason other than a constraint
    #[error("statement failed: {message}")]
    Query {
        /// Target's description of the failure
        message: String,
        /// SQL text, when known
        sql: Option<String>,
    },

    /// Integrity constraint rejected the row
    #[error("{kind} constraint {constraint} violated on {table}: {message}")]
    Constraint {
        /// Constraint kind
        kind: ConstraintKind,
        /// Table written
        table: String,
        /// Constraint or column name
        constraint: String,
        /// Target's description of the failure
        message: String,
    },

    /// Commit or rollback failed
    #[error("{action} failed: {message}")]
    Transaction {
        /// `commit` or `rollback`
        action: &'static str,
        /// Target's description of the failure
        message: String,
    },

    /// Call exceeded its time budget
    #[error("target call timed out: {0}")]
    Timeout(String),

    /// Table unknown to the target
    #[error("table not found: {table}")]
    TableNotFound {
        /// Table name as written
        table: String,
    },

    /// Column unknown to the target table
    #[error("column {column} not found in table {table}")]
    ColumnNotFound {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
}

impl Error {
    /// Classification of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Statement,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::TableNotFound { .. } | Self::ColumnNotFound { .. } => ErrorCategory::Schema,
        }
    }

    /// Whether a later run may succeed without intervention
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Primary key or unique index violation
    pub fn is_unique_violation(&self) -> bool {
        self.constraint_kind() == Some(ConstraintKind::Unique)
    }

    /// Foreign key violation
    pub fn is_foreign_key_violation(&self) -> bool {
        self.constraint_kind() == Some(ConstraintKind::ForeignKey)
    }

    /// Kind of the violated constraint, if this is a constraint error
    pub fn constraint_kind(&self) -> Option<ConstraintKind> {
        match self {
            Self::Constraint { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Connection failure
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Rejected statement, with its SQL text
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Constraint violation on `table`
    pub fn constraint(
        kind: ConstraintKind,
        table: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Constraint {
            kind,
            table: table.into(),
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    /// Unique violation on `table`
    pub fn unique_violation(
        table: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::constraint(ConstraintKind::Unique, table, constraint, message)
    }

    /// Failed commit or rollback
    pub fn transaction(action: &'static str, message: impl Into<String>) -> Self {
        Self::Transaction {
            action,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_failures_retry() {
        assert!(Error::connection("refused").is_retriable());
        assert!(Error::Timeout("insert".into()).is_retriable());

        assert!(!Error::unique_violation("orders", "pk_orders", "dup").is_retriable());
        assert!(!Error::transaction("commit", "deadlock victim").is_retriable());
        assert!(!Error::TableNotFound {
            table: "orders".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_constraint_kind_drives_fallback_checks() {
        let unique = Error::unique_violation("orders", "pk_orders", "duplicate key");
        assert!(unique.is_unique_violation());
        assert!(!unique.is_foreign_key_violation());
        assert_eq!(unique.category(), ErrorCategory::Constraint);

        let fk = Error::constraint(
            ConstraintKind::ForeignKey,
            "orders",
            "fk_orders_customer",
            "missing parent",
        );
        assert!(fk.is_foreign_key_violation());
        assert!(!fk.is_unique_violation());

        assert_eq!(Error::connection("down").constraint_kind(), None);
    }

    #[test]
    fn test_display() {
        let err = Error::unique_violation("orders", "pk_orders", "duplicate key");
        assert_eq!(
            err.to_string(),
            "unique constraint pk_orders violated on orders: duplicate key"
        );
        assert_eq!(ErrorCategory::Schema.to_string(), "schema");
    }
}
