//! RCH Distributed Build - orchestrator-side synchronization
//!
//! Records the file hash snapshot workers build against, and mirrors
//! worker console streams and output directories back onto local disk
//! incrementally. The wire codec and shared payload types live in
//! `rch-protocol`; the worker side lives in `rch-worker`.

pub mod config;
pub mod error;
pub mod extract;
pub mod logs;
pub mod snapshot;

pub use config::{EffectiveConfig, OutputDirMode, SyncSettings};
pub use error::SyncError;
pub use extract::{extract_tar, pack_dir, ExistingFileMode, ExtractSummary};
pub use logs::{LogStreamCursor, MergeReport, OutputReport, RemoteLogSynchronizer, WorkerLogClient};
pub use snapshot::{DefaultHashCache, LocalHashCache, SnapshotRecorder};
