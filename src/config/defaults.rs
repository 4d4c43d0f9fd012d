//! Built-in defaults (layer 1)
//!
//! The same shape is what every TOML layer may override, section by section.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::settings::OutputDirMode;
use rch_protocol::MAX_METADATA_HEADER_SIZE;

/// `[logs]`: where worker streams and output directories land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub dir: String,
    pub poll_interval_ms: u64,
    pub output_dir_mode: OutputDirMode,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: "rch-out/log".to_string(),
            poll_interval_ms: 1000,
            output_dir_mode: OutputDirMode::OverwriteAndClean,
        }
    }
}

/// `[hashing]`: snapshot recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    pub threads: u64,
    /// Files up to this size ship inline in the snapshot; 0 disables inlining.
    pub inline_max_bytes: u64,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            inline_max_bytes: 0,
        }
    }
}

/// `[cache]`: artifact cache payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_metadata_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_metadata_bytes: MAX_METADATA_HEADER_SIZE as u64,
        }
    }
}

/// Every configurable section; missing sections and keys take the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistbuildConfig {
    pub logs: LogsConfig,
    pub hashing: HashingConfig,
    pub cache: CacheConfig,
}

impl DistbuildConfig {
    /// JSON form, used as the bottom layer of the merge.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "logs": {
                "dir": self.logs.dir,
                "poll_interval_ms": self.logs.poll_interval_ms,
                "output_dir_mode": self.logs.output_dir_mode,
            },
            "hashing": {
                "threads": self.hashing.threads,
                "inline_max_bytes": self.hashing.inline_max_bytes,
            },
            "cache": {
                "max_metadata_bytes": self.cache.max_metadata_bytes,
            },
        })
    }
}
