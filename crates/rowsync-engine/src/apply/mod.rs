//! Conflict-aware apply
//!
//! Writes batches into a target database and settles conflicts according to
//! configured [`ConflictPolicy`] rules.

mod conflict;
mod detector;
mod engine;
mod resolved;
mod stats;

pub use conflict::{ConflictPolicy, ConflictSettings, DetectType, ResolveType};
pub use detector::{is_timestamp_newer, is_version_newer, ConflictDetector, NewerWinsDetector};
pub use engine::{ApplyEngine, ApplyOutcome, BatchFailure, BatchResult, LoadStatus};
pub use resolved::{ResolvedData, ResolvedRows};
pub use stats::{ApplyStats, AtomicApplyStats, BatchStatistics};
