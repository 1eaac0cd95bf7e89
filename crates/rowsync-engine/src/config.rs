//! Configuration types for the replication engine
//!
//! Each component receives its own section at construction:
//!   `routing` → [`BatchBuilder`](crate::builder::BatchBuilder)
//!   `loading` → [`ApplyEngine`](crate::apply::ApplyEngine)
//!   `transforms` → [`TransformEngine`](crate::transform::TransformEngine)
//!   `conflicts` → [`ConflictSettings`](crate::apply::ConflictSettings)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::apply::ConflictPolicy;
use crate::error::{EngineError, Result};
use crate::model::Channel;
use crate::transform::TransformRule;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Batch builder settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Apply engine settings
    #[serde(default)]
    pub loading: LoadConfig,

    /// Replication channels
    #[serde(default)]
    pub channels: Vec<Channel>,

    /// Conflict policies for the apply side
    #[serde(default)]
    pub conflicts: Vec<ConflictPolicy>,

    /// Table transforms for the apply side
    #[serde(default)]
    pub transforms: Vec<TransformRule>,
}

/// Batch builder settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Events scanned past the size limit without finding an open
    /// transaction before the batch is closed
    #[serde(default = "default_peek_ahead_window")]
    pub peek_ahead_window: u64,

    /// Event tags buffered before they are written to the store
    #[serde(default = "default_tag_flush_size")]
    pub tag_flush_size: usize,

    /// Hard upper bound on events in one batch, open transactions included
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: u64,

    /// Cluster lock action held while building
    #[serde(default = "default_route_action")]
    pub lock_action: String,

    /// Time budget for each store call (milliseconds)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Time to wait for the cluster lock (milliseconds)
    #[serde(default)]
    pub lock_timeout_ms: u64,
}

/// Apply engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadConfig {
    /// Rows applied between intermediate commits
    #[serde(default = "default_max_rows_before_commit")]
    pub max_rows_before_commit: u64,

    /// Updates write only the columns whose value changed
    #[serde(default = "default_true")]
    pub apply_changes_only: bool,

    /// Log resolved conflicts at info level instead of debug
    #[serde(default)]
    pub log_conflict_resolution: bool,

    /// Cluster lock action held while applying
    #[serde(default = "default_pull_action")]
    pub lock_action: String,

    /// Time budget for each target database call (milliseconds)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Time to wait for the cluster lock (milliseconds)
    #[serde(default)]
    pub lock_timeout_ms: u64,
}

fn default_peek_ahead_window() -> u64 {
    100
}

fn default_tag_flush_size() -> usize {
    10_000
}

fn default_max_batch_events() -> u64 {
    100_000
}

fn default_route_action() -> String {
    "route".to_string()
}

fn default_pull_action() -> String {
    "pull".to_string()
}

fn default_query_timeout_ms() -> u64 {
    300_000
}

fn default_max_rows_before_commit() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            peek_ahead_window: default_peek_ahead_window(),
            tag_flush_size: default_tag_flush_size(),
            max_batch_events: default_max_batch_events(),
            lock_action: default_route_action(),
            query_timeout_ms: default_query_timeout_ms(),
            lock_timeout_ms: 0,
        }
    }
}

impl RoutingConfig {
    /// Set the peek-ahead window
    pub fn with_peek_ahead_window(mut self, window: u64) -> Self {
        self.peek_ahead_window = window;
        self
    }

    /// Set the tag flush size
    pub fn with_tag_flush_size(mut self, size: usize) -> Self {
        self.tag_flush_size = size;
        self
    }

    /// Set the hard batch limit
    pub fn with_max_batch_events(mut self, max: u64) -> Self {
        self.max_batch_events = max;
        self
    }

    /// Store call time budget
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Cluster lock wait
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_rows_before_commit: default_max_rows_before_commit(),
            apply_changes_only: true,
            log_conflict_resolution: false,
            lock_action: default_pull_action(),
            query_timeout_ms: default_query_timeout_ms(),
            lock_timeout_ms: 0,
        }
    }
}

impl LoadConfig {
    /// Set rows between intermediate commits
    pub fn with_max_rows_before_commit(mut self, rows: u64) -> Self {
        self.max_rows_before_commit = rows;
        self
    }

    /// Set whether updates write only changed columns
    pub fn with_apply_changes_only(mut self, enabled: bool) -> Self {
        self.apply_changes_only = enabled;
        self
    }

    /// Set whether resolved conflicts are logged at info level
    pub fn with_log_conflict_resolution(mut self, enabled: bool) -> Self {
        self.log_conflict_resolution = enabled;
        self
    }

    /// Target call time budget
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Cluster lock wait
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Look up a channel by id
    pub fn channel(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.routing.peek_ahead_window == 0 {
            return Err(EngineError::config("routing.peek_ahead_window must be > 0"));
        }
        if self.routing.tag_flush_size == 0 {
            return Err(EngineError::config("routing.tag_flush_size must be > 0"));
        }
        if self.loading.max_rows_before_commit == 0 {
            return Err(EngineError::config(
                "loading.max_rows_before_commit must be > 0",
            ));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id.as_str()) {
                return Err(EngineError::config(format!(
                    "Channel '{}' is defined more than once",
                    channel.id
                )));
            }
            if channel.max_batch_size == 0 {
                return Err(EngineError::config(format!(
                    "Channel '{}' must have max_batch_size > 0",
                    channel.id
                )));
            }
            if channel.max_batch_size > self.routing.max_batch_events {
                return Err(EngineError::config(format!(
                    "Channel '{}' max_batch_size {} exceeds routing.max_batch_events {}",
                    channel.id, channel.max_batch_size, self.routing.max_batch_events
                )));
            }
        }

        let mut seen = HashSet::new();
        for policy in &self.conflicts {
            if !seen.insert(policy.id.as_str()) {
                return Err(EngineError::config(format!(
                    "Conflict policy '{}' is defined more than once",
                    policy.id
                )));
            }
            policy.validate()?;
        }

        for rule in &self.transforms {
            rule.validate()?;
        }

        Ok(())
    }
}
