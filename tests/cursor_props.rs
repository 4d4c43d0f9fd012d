//! Property tests for log cursor merging.
//!
//! A worker's stream only ever grows: the current batch gains lines or a
//! new batch starts. Whatever order responses arrive in, and however often
//! they repeat, the mirrored lines must equal the worker's lines up to the
//! furthest response seen, and the cursor must never move backwards.

use proptest::prelude::*;
use rch_distbuild::logs::{LogCursorTracker, MergeOutcome};
use rch_distbuild::LogStreamCursor;
use rch_protocol::ops::{
    LogLineBatch, LogStreamType, RunId, StreamStatus, WorkerStatus, WorkerStream,
};

/// One step of worker output.
#[derive(Debug, Clone, Copy)]
enum Growth {
    Append(u8),
    NewBatch(u8),
}

fn growth() -> impl Strategy<Value = Growth> {
    prop_oneof![
        3 => (1u8..4).prop_map(Growth::Append),
        1 => (0u8..3).prop_map(Growth::NewBatch),
    ]
}

/// A worker stream plus every state it passed through.
struct History {
    batches: Vec<LogLineBatch>,
    snapshots: Vec<Vec<LogLineBatch>>,
    next_line: usize,
}

impl History {
    fn new() -> Self {
        let mut history = Self {
            batches: vec![LogLineBatch::new(1, Vec::new())],
            snapshots: Vec::new(),
            next_line: 0,
        };
        history.push_lines(1);
        history.snapshots.push(history.batches.clone());
        history
    }

    fn push_lines(&mut self, n: u8) {
        for _ in 0..n {
            let line = format!("line-{}", self.next_line);
            self.next_line += 1;
            if let Some(batch) = self.batches.last_mut() {
                batch.lines.push(line);
            }
        }
    }

    fn grow(&mut self, step: Growth) {
        match step {
            Growth::Append(n) => self.push_lines(n),
            Growth::NewBatch(n) => {
                let number = self.batches.len() as u32 + 1;
                self.batches.push(LogLineBatch::new(number, Vec::new()));
                self.push_lines(n);
            }
        }
        self.snapshots.push(self.batches.clone());
    }

    fn all_lines(batches: &[LogLineBatch]) -> Vec<String> {
        batches.iter().flat_map(|b| b.lines.iter().cloned()).collect()
    }

    fn cursor_of(batches: &[LogLineBatch]) -> LogStreamCursor {
        let last = batches.last().expect("history is never empty");
        LogStreamCursor::new(last.batch_number, last.lines.len() as u32)
    }

    fn status(&self, run_id: &RunId) -> WorkerStatus {
        let cursor = Self::cursor_of(&self.batches);
        WorkerStatus {
            run_id: run_id.clone(),
            streams: vec![StreamStatus {
                stream: LogStreamType::Stdout,
                latest_batch_number: cursor.batch_number,
                latest_batch_line_count: cursor.line_count,
            }],
            output_dir_ready: false,
        }
    }
}

fn key() -> WorkerStream {
    WorkerStream::new(RunId::new("w1"), LogStreamType::Stdout)
}

fn apply(
    tracker: &LogCursorTracker,
    sink: &mut Vec<String>,
    batches: &[LogLineBatch],
) -> MergeOutcome {
    tracker
        .merge(&key(), batches, |lines| {
            sink.extend_from_slice(lines);
            Ok::<(), ()>(())
        })
        .expect("sink never fails")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_out_of_order_responses_never_duplicate_or_omit(
        steps in prop::collection::vec(growth(), 1..30),
        deliveries in prop::collection::vec((any::<prop::sample::Index>(), 0u32..4), 1..60),
    ) {
        let mut history = History::new();
        for step in steps {
            history.grow(step);
        }

        let tracker = LogCursorTracker::new();
        let mut sink = Vec::new();
        let mut furthest: Option<usize> = None;
        let mut previous: Option<LogStreamCursor> = None;

        for (pick, lag) in deliveries {
            let index = pick.index(history.snapshots.len());
            let snapshot = &history.snapshots[index];

            // Answer from the cursor's batch, or a few batches earlier.
            let start = tracker
                .cursor(&key())
                .map_or(1, |c| c.batch_number.saturating_sub(lag).max(1));
            let response: Vec<LogLineBatch> = snapshot
                .iter()
                .filter(|b| b.batch_number >= start)
                .cloned()
                .collect();

            apply(&tracker, &mut sink, &response);
            furthest = furthest.max(Some(index));

            let cursor = tracker.cursor(&key());
            prop_assert!(cursor >= previous, "cursor moved backwards: {:?} -> {:?}", previous, cursor);
            previous = cursor;

            let expected = &history.snapshots[furthest.unwrap_or(0)];
            prop_assert_eq!(cursor, Some(History::cursor_of(expected)));
            prop_assert_eq!(&sink, &History::all_lines(expected));
        }
    }

    #[test]
    fn prop_poll_loop_converges_with_redelivery(
        rounds in prop::collection::vec((prop::collection::vec(growth(), 0..4), any::<bool>()), 1..25),
    ) {
        let run_id = RunId::new("w1");
        let mut history = History::new();
        let tracker = LogCursorTracker::new();
        let mut sink = Vec::new();
        let mut delivered: Vec<Vec<LogLineBatch>> = Vec::new();

        for (steps, redeliver) in rounds {
            for step in steps {
                history.grow(step);
            }
            for request in tracker.create_requests(&[history.status(&run_id)]) {
                let response: Vec<LogLineBatch> = history
                    .batches
                    .iter()
                    .filter(|b| b.batch_number >= request.batch_number)
                    .cloned()
                    .collect();
                apply(&tracker, &mut sink, &response);
                delivered.push(response);
            }
            if redeliver {
                if let Some(old) = delivered.first().cloned() {
                    let outcome = apply(&tracker, &mut sink, &old);
                    prop_assert!(!matches!(outcome, MergeOutcome::Advance { .. }), "redelivered batch must not advance the cursor");
                }
            }
        }

        // A final poll catches up on anything left.
        for request in tracker.create_requests(&[history.status(&run_id)]) {
            let response: Vec<LogLineBatch> = history
                .batches
                .iter()
                .filter(|b| b.batch_number >= request.batch_number)
                .cloned()
                .collect();
            apply(&tracker, &mut sink, &response);
        }

        prop_assert_eq!(&sink, &History::all_lines(&history.batches));
        prop_assert_eq!(tracker.cursor(&key()), Some(History::cursor_of(&history.batches)));
        prop_assert!(tracker.create_requests(&[history.status(&run_id)]).is_empty());
    }
}
