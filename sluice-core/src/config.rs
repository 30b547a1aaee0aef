//! Partition Configuration
//!
//! The only knobs the core exposes. A partition is built from a
//! [`PartitionConfig`], either constructed in code or deserialized from
//! whatever format the application already uses for its settings.

use serde::{Deserialize, Serialize};

/// Default bound on nodes visited during a single rank propagation.
pub const DEFAULT_MAX_RANK_VISITS: usize = 100_000;

/// Settings for a [`Partition`](crate::transaction::Partition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Name used in log output.
    pub name: String,

    /// Maximum number of node visits one `link` may spend repairing ranks
    /// before it gives up with
    /// [`Error::RankPropagationLimit`](crate::Error::RankPropagationLimit).
    pub max_rank_visits: usize,
}

impl PartitionConfig {
    /// Set the partition name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the rank propagation visit bound.
    pub fn with_max_rank_visits(mut self, limit: usize) -> Self {
        self.max_rank_visits = limit;
        self
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_rank_visits: DEFAULT_MAX_RANK_VISITS,
        }
    }
}
