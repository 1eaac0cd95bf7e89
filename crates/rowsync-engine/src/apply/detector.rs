//! Newer-wins detection
//!
//! Compares the incoming row's detect column against the value currently
//! stored in the target. A missing target row, or a NULL stored value,
//! always loses to the incoming row.

use async_trait::async_trait;
use rowsync_rdbc::executor::DmlExecutor;
use rowsync_rdbc::types::{Row, Value};

use super::conflict::{ConflictPolicy, DetectType};
use crate::error::{EngineError, Result};

/// Decides whether an incoming row should overwrite the stored one
#[async_trait]
pub trait ConflictDetector: Send + Sync {
    /// Whether `incoming` is newer than the target row identified by `keys`
    async fn is_newer(
        &self,
        executor: &dyn DmlExecutor,
        policy: &ConflictPolicy,
        table: &str,
        keys: &Row,
        incoming: &Row,
    ) -> Result<bool>;
}

/// Detector comparing timestamp or version columns
#[derive(Debug, Clone, Copy, Default)]
pub struct NewerWinsDetector;

#[async_trait]
impl ConflictDetector for NewerWinsDetector {
    async fn is_newer(
        &self,
        executor: &dyn DmlExecutor,
        policy: &ConflictPolicy,
        table: &str,
        keys: &Row,
        incoming: &Row,
    ) -> Result<bool> {
        let Some(column) = policy.detect_expression.as_deref() else {
            return Ok(false);
        };
        let compare: fn(Option<&Value>, &Value, &str) -> Result<bool> = match policy.detect_type {
            DetectType::UseTimestamp => is_timestamp_newer,
            DetectType::UseVersion => is_version_newer,
            DetectType::None | DetectType::UsePkData => return Ok(false),
        };

        let incoming_value = incoming.get_by_name(column).ok_or_else(|| {
            EngineError::invalid_data(format!(
                "Incoming row for {} has no detect column '{}'",
                table, column
            ))
        })?;
        let existing = executor.query_value(table, column, keys).await?;
        compare(existing.as_ref(), incoming_value, column)
    }
}

/// Incoming timestamp is strictly after the stored one
pub fn is_timestamp_newer(existing: Option<&Value>, incoming: &Value, column: &str) -> Result<bool> {
    let incoming = incoming.as_timestamp().ok_or_else(|| {
        EngineError::invalid_data(format!(
            "Cannot read incoming '{}' value {:?} as a timestamp",
            column, incoming
        ))
    })?;
    match existing {
        None | Some(Value::Null) => Ok(true),
        Some(value) => {
            let existing = value.as_timestamp().ok_or_else(|| {
                EngineError::invalid_data(format!(
                    "Cannot read stored '{}' value {:?} as a timestamp",
                    column, value
                ))
            })?;
            Ok(incoming > existing)
        }
    }
}

/// Incoming version is strictly greater than the stored one
pub fn is_version_newer(existing: Option<&Value>, incoming: &Value, column: &str) -> Result<bool> {
    let incoming = incoming.as_i64().ok_or_else(|| {
        EngineError::invalid_data(format!(
            "Cannot read incoming '{}' value {:?} as a version",
            column, incoming
        ))
    })?;
    match existing {
        None | Some(Value::Null) => Ok(true),
        Some(value) => {
            let existing = value.as_i64().ok_or_else(|| {
                EngineError::invalid_data(format!(
                    "Cannot read stored '{}' value {:?} as a version",
                    column, value
                ))
            })?;
            Ok(incoming > existing)
        }
    }
}
