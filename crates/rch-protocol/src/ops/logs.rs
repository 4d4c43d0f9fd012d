//! Log streaming types.
//!
//! Workers split each console stream into numbered batches. A batch may
//! keep growing until the worker starts the next one.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RemoteError;

/// Identifier of one worker run within a distributed build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Wrap a run id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A console stream of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStreamType {
    Stdout,
    Stderr,
}

impl LogStreamType {
    /// Every stream kind, in polling order.
    pub const ALL: [LogStreamType; 2] = [LogStreamType::Stdout, LogStreamType::Stderr];

    /// Name of the local sink file for this stream.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout.log",
            Self::Stderr => "stderr.log",
        }
    }
}

impl fmt::Display for LogStreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "STDOUT"),
            Self::Stderr => write!(f, "STDERR"),
        }
    }
}

/// One stream of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerStream {
    pub run_id: RunId,
    pub stream: LogStreamType,
}

impl WorkerStream {
    pub fn new(run_id: RunId, stream: LogStreamType) -> Self {
        Self { run_id, stream }
    }
}

impl fmt::Display for WorkerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.stream)
    }
}

/// A numbered chunk of log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLineBatch {
    /// Monotonic per stream, starting at 1.
    pub batch_number: u32,
    /// Lines in order.
    pub lines: Vec<String>,
}

impl LogLineBatch {
    pub fn new(batch_number: u32, lines: Vec<String>) -> Self {
        Self {
            batch_number,
            lines,
        }
    }
}

/// How far a worker has produced one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub stream: LogStreamType,
    /// Latest batch produced; 0 when nothing was produced yet.
    pub latest_batch_number: u32,
    /// Lines in the latest batch.
    pub latest_batch_line_count: u32,
}

/// Per-cycle status report of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub run_id: RunId,
    #[serde(default)]
    pub streams: Vec<StreamStatus>,
    /// The worker has packaged its output directory.
    #[serde(default)]
    pub output_dir_ready: bool,
}

impl WorkerStatus {
    /// Status of one stream, if the worker reported it.
    pub fn stream(&self, stream: LogStreamType) -> Option<&StreamStatus> {
        self.streams.iter().find(|s| s.stream == stream)
    }
}

/// Request for batches of one stream starting at `batch_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatchRequest {
    pub worker_stream: WorkerStream,
    pub batch_number: u32,
}

/// Request payload for `multi_get_logs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiGetLogsRequest {
    pub requests: Vec<LogBatchRequest>,
}

/// Batches of one stream, or the error that prevented reading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLogs {
    pub worker_stream: WorkerStream,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batches: Vec<LogLineBatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

/// Response payload for `multi_get_logs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiGetLogsResponse {
    pub stream_logs: Vec<StreamLogs>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_logs_json_shape() {
        let logs = StreamLogs {
            worker_stream: WorkerStream::new(RunId::new("w1"), LogStreamType::Stdout),
            batches: vec![LogLineBatch::new(1, vec!["a".to_string()])],
            error: None,
        };
        let json = serde_json::to_value(&logs).unwrap();
        assert_eq!(json["worker_stream"]["run_id"], "w1");
        assert_eq!(json["worker_stream"]["stream"], "STDOUT");
        assert_eq!(json["batches"][0]["batch_number"], 1);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_worker_status_defaults() {
        let status: WorkerStatus = serde_json::from_str(r#"{"run_id":"w2"}"#).unwrap();
        assert!(status.streams.is_empty());
        assert!(!status.output_dir_ready);
        assert!(status.stream(LogStreamType::Stderr).is_none());
    }
}
