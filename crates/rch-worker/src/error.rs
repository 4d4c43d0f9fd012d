//! Worker-side hash cache errors.

use rch_protocol::{CellIndex, ErrorKind, HashKey};
use std::io;

use crate::provider::ContentError;

/// Errors from remote hash lookups and materialization.
#[derive(Debug, thiserror::Error)]
pub enum HashCacheError {
    /// The snapshot has no entry for a path the build engine asked about.
    #[error("no recorded hash for '{key}' in {cell}")]
    NotRecorded { cell: CellIndex, key: HashKey },

    #[error("{0} has no hash cache on this worker")]
    CellNotRegistered(CellIndex),

    #[error("materialized content of '{key}' hashes to {actual}, snapshot recorded {expected}")]
    ContentMismatch {
        key: HashKey,
        expected: String,
        actual: String,
    },

    /// A relative snapshot path that would land outside the cell root.
    #[error("recorded path '{path}' escapes the root of {cell}")]
    EscapesRoot { cell: CellIndex, path: String },

    #[error("content provider failed: {0}")]
    Content(#[from] ContentError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HashCacheError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRecorded { .. } | Self::CellNotRegistered(_) => ErrorKind::Precondition,
            Self::EscapesRoot { .. } => ErrorKind::Format,
            Self::ContentMismatch { .. } => ErrorKind::Integrity,
            Self::Content(e) => e.kind(),
            Self::Io(_) => ErrorKind::Io,
        }
    }
}
