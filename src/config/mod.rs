//! Layered configuration
//!
//! Four layers, later ones winning:
//! 1. Built-in defaults
//! 2. Host config (~/.config/rch/distbuild.toml)
//! 3. Repo config (.rch/distbuild.toml)
//! 4. CLI overrides (JSON object)

mod defaults;
mod effective;
mod merge;
mod settings;

pub use defaults::{CacheConfig, DistbuildConfig, HashingConfig, LogsConfig};
pub use effective::{ConfigError, ConfigLayer, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, merge_layers};
pub use settings::{OutputDirMode, SyncSettings};

/// Host config location relative to the home directory.
pub const HOST_CONFIG_PATH: &str = ".config/rch/distbuild.toml";

/// Repo config location relative to the repository root.
pub const REPO_CONFIG_PATH: &str = ".rch/distbuild.toml";
