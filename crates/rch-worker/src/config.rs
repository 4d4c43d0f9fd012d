//! Worker configuration.

use serde::{Deserialize, Serialize};

/// Worker configuration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Materialize every recorded file during preload, not only flagged ones.
    pub preload_all: bool,
    /// Re-hash fetched content and reject bytes that differ from the snapshot.
    pub verify_materialized: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            preload_all: false,
            verify_materialized: true,
        }
    }
}
