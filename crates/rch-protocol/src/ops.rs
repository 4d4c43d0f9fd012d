//! Operation-specific payload types.

pub mod file_hashes;
pub mod logs;
pub mod output_dir;

pub use file_hashes::{FileHashEntry, FileHashes, HashSnapshot};
pub use logs::{
    LogBatchRequest, LogLineBatch, LogStreamType, MultiGetLogsRequest, MultiGetLogsResponse,
    RunId, StreamLogs, StreamStatus, WorkerStatus, WorkerStream,
};
pub use output_dir::{OutputDir, OutputDirRequest, OutputDirResponse};

/// Known operation names on the orchestrator/worker channel.
pub mod names {
    pub const MULTI_GET_LOGS: &str = "multi_get_logs";
    pub const GET_OUTPUT_DIRS: &str = "get_output_dirs";
    pub const FETCH_FILE_HASHES: &str = "fetch_file_hashes";
}
