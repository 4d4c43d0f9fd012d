//! Top-level error type of the orchestrator side.

use rch_protocol::ops::RunId;
use rch_protocol::{ErrorKind, ProtocolError, RemoteError};
use std::io;

use crate::config::ConfigError;
use crate::extract::ExtractError;
use crate::snapshot::SnapshotError;

/// Errors surfaced by the synchronization layer and the CLI.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Extract error: {0}")]
    Extract(#[from] ExtractError),

    #[error("worker {run_id} reported {error}")]
    Remote { run_id: RunId, error: RemoteError },

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(e) => e.kind(),
            Self::Config(e) => e.kind(),
            Self::Snapshot(e) => e.kind(),
            Self::Extract(e) => e.kind(),
            Self::Remote { .. } => ErrorKind::Isolated,
            Self::InvalidRunId(_) => ErrorKind::Format,
            Self::ChecksumMismatch { .. } => ErrorKind::Integrity,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}
