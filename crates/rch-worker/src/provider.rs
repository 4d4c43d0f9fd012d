//! Pluggable source of file bytes for materialization.

use rch_protocol::ops::FileHashEntry;
use rch_protocol::{ContentHash, ErrorKind};
use std::io;
use std::path::Path;

/// Errors from content providers.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content {0} is not available")]
    NotFound(ContentHash),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ContentError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::Precondition,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Fetches the bytes of a recorded file.
///
/// Implementations write the full content of `entry` to `target`, creating
/// or truncating it. The caller owns placement and verification.
pub trait ContentProvider: Send + Sync {
    fn materialize(&self, entry: &FileHashEntry, target: &Path) -> Result<(), ContentError>;
}
