//! # rowsync-rdbc
//!
//! Target database access for the rowsync replication engine.
//!
//! This crate defines what the apply side needs from a relational backend and
//! nothing more: a value model for replicated rows, DML statements with
//! parameterised SQL, and the [`DmlExecutor`](executor::DmlExecutor)
//! capability that every backend implements.
//!
//! ## Features
//!
//! - **Value model**: `Value` / `Row` with case-insensitive column lookup
//! - **Statements**: `DmlStatement` with ANSI SQL rendering
//! - **Error taxonomy**: constraint violations are distinguishable from
//!   other failures, which drives fallback resolution
//! - **In-memory backend**: `MemoryDatabase` with primary keys, identity
//!   columns and rollback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rowsync_rdbc::prelude::*;
//!
//! let db = MemoryDatabase::new();
//! db.create_table(
//!     TableMetadata::new("orders")
//!         .with_column(ColumnMetadata::new("id", "integer").primary_key(1)),
//! );
//!
//! let insert = DmlStatement::new(DmlType::Insert, "orders", Row::default().with("id", 1), Row::default());
//! db.execute(&insert).await?;
//! db.commit().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod dml;
pub mod error;
pub mod executor;
pub mod memory;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{ConstraintKind, Error, ErrorCategory, Result};

    // Value and metadata types
    pub use crate::types::{ColumnMetadata, Row, TableMetadata, Value};

    // Statements
    pub use crate::dml::{render_sql, DmlStatement, DmlType};

    // Execution
    pub use crate::executor::DmlExecutor;
    pub use crate::memory::MemoryDatabase;
}

pub use error::{Error, Result};
