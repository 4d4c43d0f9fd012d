//! Effective configuration with provenance
//!
//! Layers merge in precedence order. Every file that contributed is kept
//! with its SHA-256 so a run can report which files shaped its settings.

use chrono::{DateTime, Utc};
use rch_protocol::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::defaults::DistbuildConfig;
use super::merge::merge_layers;
use super::settings::SyncSettings;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "rch-distbuild/effective_config@1";

/// Where a layer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Repo,
    Cli,
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Builtin => "builtin",
            Self::Host => "host",
            Self::Repo => "repo",
            Self::Cli => "cli",
        })
    }
}

/// Provenance of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File the layer was read from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// One layer before merging.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub source: ConfigSource,
    pub value: Value,
}

impl ConfigLayer {
    fn unfiled(origin: ConfigOrigin, value: Value) -> Self {
        Self {
            source: ConfigSource {
                origin,
                path: None,
                digest: None,
            },
            value,
        }
    }

    pub fn builtin() -> Self {
        Self::unfiled(ConfigOrigin::Builtin, DistbuildConfig::default().to_value())
    }

    pub fn cli(overrides: Value) -> Self {
        Self::unfiled(ConfigOrigin::Cli, overrides)
    }

    /// Read a TOML layer. A file that does not exist contributes no layer.
    pub fn read(origin: ConfigOrigin, path: &Path) -> Result<Option<Self>, ConfigError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let parse_error = |message: String| ConfigError::Parse { origin, message };

        let text = std::str::from_utf8(&bytes)
            .map_err(|e| parse_error(format!("{}: {}", path.display(), e)))?;
        let value: Value = toml::from_str(text)
            .map_err(|e| parse_error(format!("{}: {}", path.display(), e)))?;

        Ok(Some(Self {
            source: ConfigSource {
                origin,
                path: Some(path.to_path_buf()),
                digest: Some(hex::encode(Sha256::digest(&bytes))),
            },
            value,
        }))
    }
}

/// The merged configuration and the layers behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    /// Merged `logs`/`hashing`/`cache` sections
    pub config: Value,
    /// Contributing layers, lowest precedence first
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Builtin defaults, then the host and repo files when present, then
    /// CLI overrides.
    pub fn build(
        host_config_path: Option<&Path>,
        repo_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![ConfigLayer::builtin()];
        if let Some(path) = host_config_path {
            layers.extend(ConfigLayer::read(ConfigOrigin::Host, path)?);
        }
        if let Some(path) = repo_config_path {
            layers.extend(ConfigLayer::read(ConfigOrigin::Repo, path)?);
        }
        if let Some(overrides) = cli_overrides {
            layers.push(ConfigLayer::cli(overrides));
        }
        Self::from_layers(layers)
    }

    /// Merge layers and reject the result unless it yields valid settings.
    pub fn from_layers(layers: Vec<ConfigLayer>) -> Result<Self, ConfigError> {
        let (sources, values): (Vec<_>, Vec<_>) =
            layers.into_iter().map(|l| (l.source, l.value)).unzip();
        let config = merge_layers(values);
        SyncSettings::from_value(&config)?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config,
            sources,
        })
    }

    /// Typed settings for the synchronization layer.
    pub fn settings(&self) -> Result<SyncSettings, ConfigError> {
        SyncSettings::from_value(&self.config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// A merged value by dotted key, e.g. `logs.dir`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.config, |current, part| current.get(part))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid {origin} config: {message}")]
    Parse {
        origin: ConfigOrigin,
        message: String,
    },

    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Read { .. } => ErrorKind::Io,
            Self::Parse { .. } | Self::Invalid { .. } => ErrorKind::Format,
        }
    }
}
