//! Error types shared by the orchestrator and workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Coarse classification of every failure in the sync layer.
///
/// Callers match on this instead of on concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Oversized or malformed header. Raised before any partial state is committed.
    Format,
    /// Content does not match its recorded checksum or hash.
    Integrity,
    /// A worker response older than what was already applied.
    Stale,
    /// A lookup the upstream contract guarantees would succeed did not.
    Precondition,
    /// A failure confined to one worker or stream.
    Isolated,
    /// Plain I/O failure, including truncated streams.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format => write!(f, "FORMAT"),
            Self::Integrity => write!(f, "INTEGRITY"),
            Self::Stale => write!(f, "STALE"),
            Self::Precondition => write!(f, "PRECONDITION"),
            Self::Isolated => write!(f, "ISOLATED"),
            Self::Io => write!(f, "IO"),
        }
    }
}

/// Errors raised while encoding or decoding the cache wire format.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata header of {size} bytes exceeds maximum {max}")]
    MetadataTooLarge { size: u64, max: u64 },

    #[error("invalid {field} length: {value}")]
    InvalidLength { field: &'static str, value: i64 },

    #[error("string of {len} bytes does not fit a u16 length prefix")]
    StringTooLong { len: usize },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("payload changed between hashing and transmission: expected {expected_len} bytes, sent {actual_len}")]
    PayloadChanged { expected_len: u64, actual_len: u64 },
}

impl ProtocolError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::MetadataTooLarge { .. }
            | Self::InvalidLength { .. }
            | Self::StringTooLong { .. }
            | Self::InvalidUtf8 { .. }
            | Self::MalformedMetadata(_) => ErrorKind::Format,
            Self::PayloadChanged { .. } => ErrorKind::Integrity,
        }
    }
}

/// Stable codes for errors a worker reports inline instead of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The requested log stream could not be read on the worker.
    StreamUnavailable,
    /// The output directory could not be packaged.
    OutputDirUnavailable,
    /// The worker run is unknown.
    RunNotFound,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamUnavailable => write!(f, "STREAM_UNAVAILABLE"),
            Self::OutputDirUnavailable => write!(f, "OUTPUT_DIR_UNAVAILABLE"),
            Self::RunNotFound => write!(f, "RUN_NOT_FOUND"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Error reported by a worker in place of stream or output data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line message.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a STREAM_UNAVAILABLE error.
    pub fn stream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StreamUnavailable, message)
    }

    /// Create an OUTPUT_DIR_UNAVAILABLE error.
    pub fn output_dir_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OutputDirUnavailable, message)
    }

    /// Create a RUN_NOT_FOUND error.
    pub fn run_not_found(run_id: &str) -> Self {
        Self::new(ErrorCode::RunNotFound, format!("run '{}' not found", run_id))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}
