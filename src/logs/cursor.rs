//! Per-stream read position and the batch merge rule.

use rch_protocol::ops::LogLineBatch;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How far one worker stream has been mirrored locally.
///
/// Ordered by batch number, then line count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogStreamCursor {
    pub batch_number: u32,
    pub line_count: u32,
}

impl LogStreamCursor {
    pub fn new(batch_number: u32, line_count: u32) -> Self {
        Self {
            batch_number,
            line_count,
        }
    }
}

impl fmt::Display for LogStreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{batch:{},count:{}}}", self.batch_number, self.line_count)
    }
}

/// Result of merging one response into a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New lines to append and the cursor to advance to once they are written.
    Advance {
        lines: Vec<String>,
        cursor: LogStreamCursor,
    },
    /// Nothing beyond the cursor.
    UpToDate,
    /// The response ends before the cursor; nothing may be applied.
    Stale { proposed: LogStreamCursor },
}

fn count(lines: &[String]) -> u32 {
    u32::try_from(lines.len()).unwrap_or(u32::MAX)
}

/// Merge batches of one stream against its current cursor.
///
/// Batches below the cursor are skipped, the batch at the cursor
/// contributes only lines past `line_count`, and later batches contribute
/// everything. A response whose last batch sits below the cursor is stale.
pub fn merge_batches(current: Option<LogStreamCursor>, batches: &[LogLineBatch]) -> MergeOutcome {
    let current = current.unwrap_or_default();

    let mut ordered: Vec<&LogLineBatch> = batches.iter().collect();
    ordered.sort_by_key(|b| b.batch_number);
    let Some(last) = ordered.last() else {
        return MergeOutcome::UpToDate;
    };
    let proposed = LogStreamCursor::new(last.batch_number, count(&last.lines));
    if proposed < current {
        return MergeOutcome::Stale { proposed };
    }

    let mut cursor = current;
    let mut lines = Vec::new();
    for batch in ordered {
        let len = count(&batch.lines);
        if batch.batch_number < cursor.batch_number {
            continue;
        }
        if batch.batch_number == cursor.batch_number {
            if len > cursor.line_count {
                lines.extend_from_slice(&batch.lines[cursor.line_count as usize..]);
                cursor.line_count = len;
            }
            continue;
        }
        lines.extend_from_slice(&batch.lines);
        cursor = LogStreamCursor::new(batch.batch_number, len);
    }

    if cursor == current {
        MergeOutcome::UpToDate
    } else {
        MergeOutcome::Advance { lines, cursor }
    }
}
