//! Incremental log and output-directory synchronization
//!
//! Each poll cycle the orchestrator asks every worker only for the log
//! batches it has not seen yet, merges the answer exactly once per
//! (worker, stream), and extracts packaged output directories.

mod cursor;
mod synchronizer;
mod tracker;

pub use cursor::{merge_batches, LogStreamCursor, MergeOutcome};
pub use synchronizer::{
    CycleReport, MergeReport, MergeStatus, OutputReport, OutputStatus, PollRequests,
    RemoteLogSynchronizer, RunSummary, StreamMerge, WorkerLogClient,
};
pub use tracker::LogCursorTracker;
