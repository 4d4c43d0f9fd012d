//! Poll-cycle driver for worker logs and output directories.

use rch_protocol::ops::{
    MultiGetLogsRequest, MultiGetLogsResponse, OutputDirRequest, OutputDirResponse, RunId,
    StreamLogs, WorkerStatus, WorkerStream,
};
use rch_protocol::{ErrorKind, RemoteError};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cursor::{LogStreamCursor, MergeOutcome};
use super::tracker::LogCursorTracker;
use crate::config::{OutputDirMode, SyncSettings};
use crate::error::SyncError;
use crate::extract::{extract_tar, ExistingFileMode, ExtractSummary};

/// The caller's RPC channel to the workers.
pub trait WorkerLogClient {
    fn multi_get_logs(
        &self,
        request: &MultiGetLogsRequest,
    ) -> Result<MultiGetLogsResponse, RemoteError>;

    fn get_output_dirs(&self, request: &OutputDirRequest) -> Result<OutputDirResponse, RemoteError>;
}

/// Everything to fetch in one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollRequests {
    pub logs: MultiGetLogsRequest,
    pub output_dirs: OutputDirRequest,
}

impl PollRequests {
    pub fn is_empty(&self) -> bool {
        self.logs.requests.is_empty() && self.output_dirs.run_ids.is_empty()
    }
}

/// What happened to one stream's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    Appended { lines: usize, cursor: LogStreamCursor },
    UpToDate,
    Stale { proposed: LogStreamCursor },
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMerge {
    pub worker_stream: WorkerStream,
    pub status: MergeStatus,
}

/// Per-stream results of merging one log response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub streams: Vec<StreamMerge>,
}

impl MergeReport {
    /// Total lines appended to sinks.
    pub fn lines_written(&self) -> usize {
        self.streams
            .iter()
            .map(|s| match s.status {
                MergeStatus::Appended { lines, .. } => lines,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StreamMerge> {
        self.streams
            .iter()
            .filter(|s| matches!(s.status, MergeStatus::Failed { .. }))
    }
}

/// What happened to one worker's output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputStatus {
    Extracted { path: PathBuf, summary: ExtractSummary },
    /// The worker sent an empty archive.
    Empty,
    Failed { kind: ErrorKind, message: String },
}

/// Per-worker results of one output directory response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputReport {
    pub outputs: Vec<(RunId, OutputStatus)>,
}

impl OutputReport {
    pub fn failures(&self) -> impl Iterator<Item = &(RunId, OutputStatus)> {
        self.outputs
            .iter()
            .filter(|(_, status)| matches!(status, OutputStatus::Failed { .. }))
    }
}

/// Results of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub logs: MergeReport,
    pub outputs: OutputReport,
}

impl CycleReport {
    /// No unit failed.
    pub fn is_clean(&self) -> bool {
        self.logs.failures().next().is_none() && self.outputs.failures().next().is_none()
    }
}

/// Totals over every cycle of [`RemoteLogSynchronizer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: usize,
    pub lines_written: usize,
    /// Failed units summed over all cycles.
    pub failures: usize,
}

fn failed(err: &SyncError) -> (ErrorKind, String) {
    (err.kind(), err.to_string())
}

/// Mirrors worker console streams and output directories onto local disk.
///
/// One instance owns all cursors of a build; drop it when the build ends.
#[derive(Debug)]
pub struct RemoteLogSynchronizer {
    logs_dir: PathBuf,
    output_mode: ExistingFileMode,
    poll_interval: Duration,
    tracker: LogCursorTracker,
    materialized: Mutex<HashSet<RunId>>,
}

impl RemoteLogSynchronizer {
    pub fn new(logs_dir: impl Into<PathBuf>, output_mode: ExistingFileMode) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            output_mode,
            poll_interval: SyncSettings::default().poll_interval,
            tracker: LogCursorTracker::new(),
            materialized: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        let mode = match settings.output_dir_mode {
            OutputDirMode::Overwrite => ExistingFileMode::Overwrite,
            OutputDirMode::OverwriteAndClean => ExistingFileMode::OverwriteAndCleanDirectories,
        };
        Self::new(&settings.logs_dir, mode).with_poll_interval(settings.poll_interval)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn tracker(&self) -> &LogCursorTracker {
        &self.tracker
    }

    /// Local directory of one run. Run ids must be a single path component.
    pub fn run_dir(&self, run_id: &RunId) -> Result<PathBuf, SyncError> {
        let id = run_id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(SyncError::InvalidRunId(id.to_string()));
        }
        Ok(self.logs_dir.join(id))
    }

    /// Sink file of one stream.
    pub fn sink_path(&self, key: &WorkerStream) -> Result<PathBuf, SyncError> {
        Ok(self.run_dir(&key.run_id)?.join(key.stream.file_name()))
    }

    /// Extraction target of one run's output directory.
    pub fn output_path(&self, run_id: &RunId) -> Result<PathBuf, SyncError> {
        Ok(self.run_dir(run_id)?.join("output"))
    }

    fn is_materialized(&self, run_id: &RunId) -> bool {
        self.materialized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(run_id)
    }

    fn mark_materialized(&self, run_id: &RunId) {
        self.materialized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.clone());
    }

    /// Requests to issue this cycle.
    pub fn poll_requests(&self, statuses: &[WorkerStatus]) -> PollRequests {
        let logs = MultiGetLogsRequest {
            requests: self.tracker.create_requests(statuses),
        };
        let run_ids = statuses
            .iter()
            .filter(|s| s.output_dir_ready && !self.is_materialized(&s.run_id))
            .map(|s| s.run_id.clone())
            .collect();
        PollRequests {
            logs,
            output_dirs: OutputDirRequest { run_ids },
        }
    }

    /// Merge a log response. Failures stay with their stream.
    pub fn apply_logs(&self, response: &MultiGetLogsResponse) -> MergeReport {
        let streams = response
            .stream_logs
            .iter()
            .map(|logs| StreamMerge {
                worker_stream: logs.worker_stream.clone(),
                status: self.apply_stream(logs),
            })
            .collect();
        MergeReport { streams }
    }

    fn apply_stream(&self, logs: &StreamLogs) -> MergeStatus {
        let key = &logs.worker_stream;
        if let Some(error) = &logs.error {
            let err = SyncError::Remote {
                run_id: key.run_id.clone(),
                error: error.clone(),
            };
            warn!(stream = %key, error = %err, "skipping log stream");
            let (kind, message) = failed(&err);
            return MergeStatus::Failed { kind, message };
        }

        let merged = self.sink_path(key).and_then(|path| {
            self.tracker
                .merge(key, &logs.batches, |lines| append_lines(&path, lines))
                .map_err(SyncError::from)
        });
        match merged {
            Ok(MergeOutcome::Advance { lines, cursor }) => {
                debug!(stream = %key, lines = lines.len(), %cursor, "appended log lines");
                MergeStatus::Appended {
                    lines: lines.len(),
                    cursor,
                }
            }
            Ok(MergeOutcome::UpToDate) => MergeStatus::UpToDate,
            Ok(MergeOutcome::Stale { proposed }) => MergeStatus::Stale { proposed },
            Err(err) => {
                warn!(stream = %key, error = %err, "failed to merge log stream");
                let (kind, message) = failed(&err);
                MergeStatus::Failed { kind, message }
            }
        }
    }

    /// Extract output directories. Failures stay with their worker.
    pub fn apply_output_dirs(&self, response: &OutputDirResponse) -> OutputReport {
        let mut outputs = Vec::with_capacity(response.output_dirs.len());
        for dir in &response.output_dirs {
            let run_id = &dir.run_id;
            let status = if let Some(error) = &dir.error {
                let err = SyncError::Remote {
                    run_id: run_id.clone(),
                    error: error.clone(),
                };
                warn!(run_id = %run_id, error = %err, "skipping output directory");
                let (kind, message) = failed(&err);
                OutputStatus::Failed { kind, message }
            } else if dir.data.is_empty() {
                warn!(run_id = %run_id, "worker sent an empty output directory");
                self.mark_materialized(run_id);
                OutputStatus::Empty
            } else {
                match self.extract_output(run_id, &dir.data) {
                    Ok((path, summary)) => {
                        info!(
                            run_id = %run_id,
                            path = %path.display(),
                            files = summary.files_written,
                            "materialized output directory"
                        );
                        self.mark_materialized(run_id);
                        OutputStatus::Extracted { path, summary }
                    }
                    Err(err) => {
                        warn!(run_id = %run_id, error = %err, "failed to extract output directory");
                        let (kind, message) = failed(&err);
                        OutputStatus::Failed { kind, message }
                    }
                }
            };
            outputs.push((run_id.clone(), status));
        }
        OutputReport { outputs }
    }

    fn extract_output(
        &self,
        run_id: &RunId,
        data: &[u8],
    ) -> Result<(PathBuf, ExtractSummary), SyncError> {
        let path = self.output_path(run_id)?;
        let summary = extract_tar(data, &path, self.output_mode)?;
        Ok((path, summary))
    }

    /// Run one poll cycle over the caller's channel.
    ///
    /// A failed call marks every unit it covered as failed; the other call
    /// still runs.
    pub fn run_cycle(&self, statuses: &[WorkerStatus], client: &dyn WorkerLogClient) -> CycleReport {
        let requests = self.poll_requests(statuses);
        let mut report = CycleReport::default();

        if !requests.logs.requests.is_empty() {
            report.logs = match client.multi_get_logs(&requests.logs) {
                Ok(response) => self.apply_logs(&response),
                Err(error) => {
                    warn!(error = %error, "multi_get_logs failed");
                    let streams = requests
                        .logs
                        .requests
                        .iter()
                        .map(|r| StreamMerge {
                            worker_stream: r.worker_stream.clone(),
                            status: MergeStatus::Failed {
                                kind: ErrorKind::Isolated,
                                message: error.to_string(),
                            },
                        })
                        .collect();
                    MergeReport { streams }
                }
            };
        }

        if !requests.output_dirs.run_ids.is_empty() {
            report.outputs = match client.get_output_dirs(&requests.output_dirs) {
                Ok(response) => self.apply_output_dirs(&response),
                Err(error) => {
                    warn!(error = %error, "get_output_dirs failed");
                    let outputs = requests
                        .output_dirs
                        .run_ids
                        .iter()
                        .map(|id| {
                            let status = OutputStatus::Failed {
                                kind: ErrorKind::Isolated,
                                message: error.to_string(),
                            };
                            (id.clone(), status)
                        })
                        .collect();
                    OutputReport { outputs }
                }
            };
        }
        report
    }

    /// Poll on schedule until `statuses` returns `None`.
    ///
    /// Each snapshot from the feed drives one [`run_cycle`](Self::run_cycle);
    /// the loop sleeps `poll_interval` between cycles.
    pub fn run<F>(&self, mut statuses: F, client: &dyn WorkerLogClient) -> RunSummary
    where
        F: FnMut() -> Option<Vec<WorkerStatus>>,
    {
        let mut summary = RunSummary::default();
        while let Some(snapshot) = statuses() {
            if summary.cycles > 0 {
                thread::sleep(self.poll_interval);
            }
            let report = self.run_cycle(&snapshot, client);
            summary.cycles += 1;
            summary.lines_written += report.logs.lines_written();
            summary.failures += report.logs.failures().count() + report.outputs.failures().count();
        }
        info!(
            cycles = summary.cycles,
            lines = summary.lines_written,
            failures = summary.failures,
            "log sync finished"
        );
        summary
    }
}

/// Append lines to a sink file.
fn append_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    append_with(path, |file| write_lines(file, lines))
}

/// Run `write` against the sink opened for append. A failed write is cut
/// back to the previous length so the lines can be written again whole on
/// the next cycle.
fn append_with<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&File) -> io::Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let start = file.metadata()?.len();
    let written = write(&file);
    if written.is_err() {
        if let Err(e) = file.set_len(start) {
            warn!(path = %path.display(), error = %e, "failed to roll back partial append");
        }
    }
    written
}

fn write_lines<W: Write>(out: W, lines: &[String]) -> io::Result<()> {
    let mut writer = BufWriter::new(out);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}
