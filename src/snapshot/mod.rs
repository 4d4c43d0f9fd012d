//! File hash snapshot recording
//!
//! The orchestrator hashes every input the build touches and records one
//! entry per unique path, grouped by owning cell. Workers load the result
//! read-only and never rehash.

mod hasher;
mod recorder;

pub use hasher::{DefaultHashCache, LocalHashCache};
pub use recorder::SnapshotRecorder;

use rch_protocol::ErrorKind;
use std::io;
use std::path::PathBuf;

/// Errors from local hashing and recording.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error on {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("member '{member}' not found in archive {archive}")]
    MemberNotFound { archive: PathBuf, member: String },

    #[error("not a regular file or directory: {0}")]
    UnsupportedFileType(PathBuf),
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IoError { .. } | Self::WalkError(_) => ErrorKind::Io,
            Self::MemberNotFound { .. } => ErrorKind::Precondition,
            Self::UnsupportedFileType(_) => ErrorKind::Format,
        }
    }
}
