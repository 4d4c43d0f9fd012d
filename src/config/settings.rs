//! Typed view of the effective configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use super::defaults::DistbuildConfig;
use super::effective::ConfigError;
use rch_protocol::MAX_METADATA_HEADER_SIZE;

const POLL_INTERVAL_MS: RangeInclusive<u64> = 1..=600_000;
const HASHING_THREADS: RangeInclusive<u64> = 1..=256;

/// How an output directory archive lands on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputDirMode {
    /// Replace files present in the archive; leave everything else.
    Overwrite,
    /// Also remove files the archive no longer contains from its directories.
    OverwriteAndClean,
}

/// Settings consumed by the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub logs_dir: PathBuf,
    /// Delay between log poll cycles.
    pub poll_interval: Duration,
    pub output_dir_mode: OutputDirMode,
    pub hashing_threads: usize,
    pub inline_max_bytes: u64,
    pub max_metadata_bytes: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let defaults = DistbuildConfig::default();
        Self {
            logs_dir: PathBuf::from(defaults.logs.dir),
            poll_interval: Duration::from_millis(defaults.logs.poll_interval_ms),
            output_dir_mode: defaults.logs.output_dir_mode,
            hashing_threads: defaults.hashing.threads as usize,
            inline_max_bytes: defaults.hashing.inline_max_bytes,
            max_metadata_bytes: MAX_METADATA_HEADER_SIZE,
        }
    }
}

fn within(key: &str, value: u64, range: RangeInclusive<u64>) -> Result<u64, ConfigError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{} is outside [{}, {}]", value, range.start(), range.end()),
        })
    }
}

impl SyncSettings {
    /// Validate a merged config object and read the settings out of it.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let config = DistbuildConfig::deserialize(value).map_err(|e| ConfigError::Invalid {
            key: "config".to_string(),
            reason: e.to_string(),
        })?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &DistbuildConfig) -> Result<Self, ConfigError> {
        if config.logs.dir.is_empty() {
            return Err(ConfigError::Invalid {
                key: "logs.dir".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let poll_ms = within("logs.poll_interval_ms", config.logs.poll_interval_ms, POLL_INTERVAL_MS)?;
        let threads = within("hashing.threads", config.hashing.threads, HASHING_THREADS)?;
        let max_metadata = within(
            "cache.max_metadata_bytes",
            config.cache.max_metadata_bytes,
            1..=MAX_METADATA_HEADER_SIZE as u64,
        )?;

        Ok(Self {
            logs_dir: PathBuf::from(&config.logs.dir),
            poll_interval: Duration::from_millis(poll_ms),
            output_dir_mode: config.logs.output_dir_mode,
            hashing_threads: threads as usize,
            inline_max_bytes: config.hashing.inline_max_bytes,
            max_metadata_bytes: max_metadata as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rch_protocol::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_defaults_validate() {
        let value = DistbuildConfig::default().to_value();
        assert_eq!(SyncSettings::from_value(&value).unwrap(), SyncSettings::default());
    }

    #[test]
    fn test_overrides() {
        let value = json!({
            "logs": {"dir": "/tmp/logs", "output_dir_mode": "overwrite", "poll_interval_ms": 250},
            "hashing": {"threads": 16}
        });
        let settings = SyncSettings::from_value(&value).unwrap();

        assert_eq!(settings.logs_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(settings.output_dir_mode, OutputDirMode::Overwrite);
        assert_eq!(settings.hashing_threads, 16);
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.max_metadata_bytes, MAX_METADATA_HEADER_SIZE);
    }

    #[test]
    fn test_out_of_range() {
        let err = SyncSettings::from_value(&json!({"logs": {"poll_interval_ms": 0}})).unwrap_err();
        assert!(err.to_string().contains("logs.poll_interval_ms"));
        assert_eq!(err.kind(), ErrorKind::Format);

        let err = SyncSettings::from_value(&json!({"cache": {"max_metadata_bytes": 128 * 1024 * 1024}}))
            .unwrap_err();
        assert!(err.to_string().contains("cache.max_metadata_bytes"));

        let err = SyncSettings::from_value(&json!({"hashing": {"threads": 1000}})).unwrap_err();
        assert!(err.to_string().contains("hashing.threads"));
    }

    #[test]
    fn test_wrong_types() {
        assert!(SyncSettings::from_value(&json!({"logs": {"output_dir_mode": "merge"}})).is_err());
        assert!(SyncSettings::from_value(&json!({"hashing": {"inline_max_bytes": -1}})).is_err());
        assert!(SyncSettings::from_value(&json!({"logs": {"dir": ""}})).is_err());
    }
}
