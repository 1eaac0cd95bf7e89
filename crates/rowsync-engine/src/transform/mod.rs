//! Transform layer
//!
//! Rewrites a captured change on a source table into writes on one or more
//! target tables, each with its own DML type and key values.

mod engine;
mod rule;

pub use engine::{SourceRow, TransformEngine, TransformedWrite};
pub use rule::{
    ColumnPolicy, ColumnTransform, DeleteAction, IncludeOn, TransformColumn, TransformRule,
};
