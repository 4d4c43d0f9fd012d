//! Cursor bookkeeping for every (worker, stream) pair of a build.

use rch_protocol::ops::{LogBatchRequest, LogLineBatch, LogStreamType, WorkerStatus, WorkerStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::cursor::{merge_batches, LogStreamCursor, MergeOutcome};

type CursorSlot = Arc<Mutex<Option<LogStreamCursor>>>;

/// Cursors of one build, each behind its own lock.
///
/// Merges for the same pair never interleave; distinct pairs proceed
/// independently.
#[derive(Debug, Default)]
pub struct LogCursorTracker {
    slots: Mutex<HashMap<WorkerStream, CursorSlot>>,
}

impl LogCursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &WorkerStream) -> CursorSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    /// Current cursor of a pair; `None` while unseen.
    pub fn cursor(&self, key: &WorkerStream) -> Option<LogStreamCursor> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()?;
        let cursor = *slot.lock().unwrap_or_else(|e| e.into_inner());
        cursor
    }

    /// Number of pairs a merge has touched.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests for every stream a worker has produced beyond our cursor.
    pub fn create_requests(&self, statuses: &[WorkerStatus]) -> Vec<LogBatchRequest> {
        let mut requests = Vec::new();
        for status in statuses {
            for stream in LogStreamType::ALL {
                let Some(reported) = status.stream(stream) else {
                    continue;
                };
                if reported.latest_batch_number == 0 {
                    continue;
                }
                let key = WorkerStream::new(status.run_id.clone(), stream);
                let batch_number = match self.cursor(&key) {
                    None => 1,
                    Some(seen) => {
                        let latest = LogStreamCursor::new(
                            reported.latest_batch_number,
                            reported.latest_batch_line_count,
                        );
                        if latest <= seen {
                            continue;
                        }
                        seen.batch_number.max(1)
                    }
                };
                requests.push(LogBatchRequest {
                    worker_stream: key,
                    batch_number,
                });
            }
        }
        requests
    }

    /// Merge a response for one pair, handing new lines to `sink` before the
    /// cursor advances.
    ///
    /// A sink failure leaves the cursor where it was, so the same lines are
    /// requested again next cycle.
    pub fn merge<F, E>(
        &self,
        key: &WorkerStream,
        batches: &[LogLineBatch],
        sink: F,
    ) -> Result<MergeOutcome, E>
    where
        F: FnOnce(&[String]) -> Result<(), E>,
    {
        let slot = self.slot(key);
        let mut cursor = slot.lock().unwrap_or_else(|e| e.into_inner());

        let outcome = merge_batches(*cursor, batches);
        match &outcome {
            MergeOutcome::Advance { lines, cursor: next } => {
                sink(lines)?;
                *cursor = Some(*next);
            }
            MergeOutcome::Stale { proposed } => {
                warn!(
                    stream = %key,
                    current = ?*cursor,
                    %proposed,
                    "ignoring stale log response"
                );
            }
            MergeOutcome::UpToDate => {}
        }
        Ok(outcome)
    }

    /// Forget every cursor.
    pub fn clear(&self) {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rch_protocol::ops::{RunId, StreamStatus};
    use std::convert::Infallible;

    fn status(run: &str, batch: u32, lines: u32) -> WorkerStatus {
        WorkerStatus {
            run_id: RunId::new(run),
            streams: vec![StreamStatus {
                stream: LogStreamType::Stdout,
                latest_batch_number: batch,
                latest_batch_line_count: lines,
            }],
            output_dir_ready: false,
        }
    }

    fn key(run: &str) -> WorkerStream {
        WorkerStream::new(RunId::new(run), LogStreamType::Stdout)
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn merge(tracker: &LogCursorTracker, run: &str, batches: &[LogLineBatch]) -> Vec<String> {
        let mut written = Vec::new();
        tracker
            .merge::<_, Infallible>(&key(run), batches, |new| {
                written.extend_from_slice(new);
                Ok(())
            })
            .unwrap();
        written
    }

    #[test]
    fn test_lookups_do_not_track_pairs() {
        let tracker = LogCursorTracker::new();
        for run in ["w1", "w2", "w3"] {
            assert_eq!(tracker.cursor(&key(run)), None);
        }
        tracker.create_requests(&[status("w1", 4, 2), status("w2", 1, 1)]);
        assert!(tracker.is_empty());

        merge(&tracker, "w1", &[LogLineBatch::new(1, lines(&["a"]))]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.cursor(&key("w9")), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_no_request_before_first_batch() {
        let tracker = LogCursorTracker::new();
        assert!(tracker.create_requests(&[status("w1", 0, 0)]).is_empty());
    }

    #[test]
    fn test_unseen_stream_backfills_from_one() {
        let tracker = LogCursorTracker::new();
        let requests = tracker.create_requests(&[status("w1", 3, 7)]);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].batch_number, 1);
        assert_eq!(requests[0].worker_stream, key("w1"));
    }

    #[test]
    fn test_requests_resume_at_seen_batch() {
        let tracker = LogCursorTracker::new();
        merge(
            &tracker,
            "w1",
            &[LogLineBatch::new(1, lines(&["a"])), LogLineBatch::new(2, lines(&["b"]))],
        );

        assert!(tracker.create_requests(&[status("w1", 2, 1)]).is_empty());
        let requests = tracker.create_requests(&[status("w1", 2, 4)]);
        assert_eq!(requests[0].batch_number, 2);
    }

    #[test]
    fn test_growing_batch_example() {
        let tracker = LogCursorTracker::new();

        assert_eq!(tracker.create_requests(&[status("w1", 1, 2)])[0].batch_number, 1);
        let written = merge(&tracker, "w1", &[LogLineBatch::new(1, lines(&["a", "b"]))]);
        assert_eq!(written, lines(&["a", "b"]));
        assert_eq!(tracker.cursor(&key("w1")), Some(LogStreamCursor::new(1, 2)));

        assert_eq!(tracker.create_requests(&[status("w1", 1, 3)])[0].batch_number, 1);
        let written = merge(&tracker, "w1", &[LogLineBatch::new(1, lines(&["a", "b", "c"]))]);
        assert_eq!(written, lines(&["c"]));
        assert_eq!(tracker.cursor(&key("w1")), Some(LogStreamCursor::new(1, 3)));
    }

    #[test]
    fn test_stale_leaves_cursor() {
        let tracker = LogCursorTracker::new();
        merge(&tracker, "w1", &[LogLineBatch::new(2, lines(&["a", "b"]))]);
        let written = merge(&tracker, "w1", &[LogLineBatch::new(1, lines(&["z"]))]);
        assert!(written.is_empty());
        assert_eq!(tracker.cursor(&key("w1")), Some(LogStreamCursor::new(2, 2)));
    }

    #[test]
    fn test_sink_failure_keeps_cursor() {
        let tracker = LogCursorTracker::new();
        let result = tracker.merge(&key("w1"), &[LogLineBatch::new(1, lines(&["a"]))], |_| {
            Err("disk full")
        });
        assert_eq!(result, Err("disk full"));
        assert_eq!(tracker.cursor(&key("w1")), None);
    }

    #[test]
    fn test_streams_are_independent() {
        let tracker = LogCursorTracker::new();
        merge(&tracker, "w1", &[LogLineBatch::new(1, lines(&["a"]))]);
        assert_eq!(tracker.cursor(&key("w2")), None);
        let stderr = WorkerStream::new(RunId::new("w1"), LogStreamType::Stderr);
        assert_eq!(tracker.cursor(&stderr), None);
    }
}
