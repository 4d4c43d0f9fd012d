//! Records the hash of every input a build touches, once per path.

use rch_protocol::cells::to_unix_path;
use rch_protocol::ops::{FileHashEntry, FileHashes, HashSnapshot};
use rch_protocol::{CellIndex, CellRoots, ContentHash, HashKey, InputPath, ResolvedInput};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::hasher::LocalHashCache;
use super::SnapshotError;

#[derive(Default)]
struct Recorded {
    /// Position of each key within its cell's list.
    index: HashMap<(CellIndex, HashKey), usize>,
    cells: BTreeMap<CellIndex, Vec<FileHashEntry>>,
}

/// Builds a [`HashSnapshot`] from the inputs a build touches.
///
/// Hashing runs outside the lock; only insertion is serialized, and a key
/// recorded twice keeps its first entry.
pub struct SnapshotRecorder {
    roots: CellRoots,
    hasher: Arc<dyn LocalHashCache>,
    inline_max_bytes: u64,
    recorded: Mutex<Recorded>,
}

impl SnapshotRecorder {
    pub fn new(roots: CellRoots, hasher: Arc<dyn LocalHashCache>) -> Self {
        Self {
            roots,
            hasher,
            inline_max_bytes: 0,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Ship files of at most `bytes` inside the snapshot. 0 disables inlining.
    pub fn with_inline_max_bytes(mut self, bytes: u64) -> Self {
        self.inline_max_bytes = bytes;
        self
    }

    pub fn roots(&self) -> &CellRoots {
        &self.roots
    }

    /// Record one input, returning its hash.
    pub fn record(&self, input: &InputPath) -> Result<ContentHash, SnapshotError> {
        self.record_with(input, false)
    }

    /// Record one input and flag it for materialization before the build starts.
    pub fn record_for_preload(&self, input: &InputPath) -> Result<ContentHash, SnapshotError> {
        self.record_with(input, true)
    }

    fn record_with(&self, input: &InputPath, preload: bool) -> Result<ContentHash, SnapshotError> {
        let resolved = self.roots.resolve_input(input);
        if let Some(hash) = self.lookup(&resolved, preload) {
            return Ok(hash);
        }

        let entry = match input {
            InputPath::ArchiveMember { archive, member } => {
                // The worker materializes members by materializing the archive.
                self.record_with(&InputPath::file(archive.clone()), preload)?;
                let mut entry = self.entry(&resolved, self.hasher.hash_member(archive, member)?);
                entry.archive_member = resolved.key.member().map(str::to_string);
                entry
            }
            InputPath::File(path) => self.file_entry(&resolved, path)?,
        };

        let mut entry = entry;
        entry.materialize_during_preloading = preload;
        let hash = entry.hash.clone();
        self.insert(resolved, entry);
        Ok(hash)
    }

    fn lookup(&self, resolved: &ResolvedInput, preload: bool) -> Option<ContentHash> {
        let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
        let position = *recorded.index.get(&(resolved.cell, resolved.key.clone()))?;
        let entry = recorded.cells.get_mut(&resolved.cell)?.get_mut(position)?;
        entry.materialize_during_preloading |= preload;
        Some(entry.hash.clone())
    }

    fn entry(&self, resolved: &ResolvedInput, hash: ContentHash) -> FileHashEntry {
        let mut entry = FileHashEntry::file(resolved.cell, resolved.key.path(), hash);
        entry.path_is_absolute = resolved.is_absolute;
        entry
    }

    fn file_entry(
        &self,
        resolved: &ResolvedInput,
        path: &Path,
    ) -> Result<FileHashEntry, SnapshotError> {
        let metadata = fs::metadata(path).map_err(|e| SnapshotError::io(path, e))?;
        let mut entry = self.entry(resolved, self.hasher.hash(path)?);

        if metadata.is_dir() {
            entry.is_directory = true;
            for child in WalkDir::new(path)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let child = child?;
                self.record(&InputPath::file(child.path()))?;
                entry
                    .children
                    .push(to_unix_path(Path::new(child.file_name())));
            }
        } else if self.inline_max_bytes > 0
            && metadata.len() <= self.inline_max_bytes
            && !resolved.is_absolute
        {
            entry.contents = Some(fs::read(path).map_err(|e| SnapshotError::io(path, e))?);
        }
        Ok(entry)
    }

    fn insert(&self, resolved: ResolvedInput, entry: FileHashEntry) {
        let mut recorded = self.recorded.lock().unwrap_or_else(|e| e.into_inner());
        let key = (resolved.cell, resolved.key);
        if recorded.index.contains_key(&key) {
            return;
        }
        let list = recorded.cells.entry(resolved.cell).or_default();
        list.push(entry);
        let position = list.len() - 1;
        debug!(cell = %key.0, key = %key.1, "recorded hash");
        recorded.index.insert(key, position);
    }

    /// Record many inputs on up to `threads` threads.
    ///
    /// Every input is attempted; the first error is returned after all ran.
    pub fn record_all(&self, inputs: &[InputPath], threads: usize) -> Result<usize, SnapshotError> {
        let next = AtomicUsize::new(0);
        let first_error: Mutex<Option<SnapshotError>> = Mutex::new(None);
        let threads = threads.clamp(1, inputs.len().max(1));

        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(input) = inputs.get(i) else {
                        break;
                    };
                    if let Err(e) = self.record(input) {
                        first_error
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .get_or_insert(e);
                    }
                });
            }
        });

        match first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some(e) => Err(e),
            None => Ok(self.len()),
        }
    }

    /// Number of recorded entries across cells.
    pub fn len(&self) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .index
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The snapshot, with one list for every registered cell.
    pub fn finish(self) -> HashSnapshot {
        let mut recorded = self.recorded.into_inner().unwrap_or_else(|e| e.into_inner());
        let cells = self
            .roots
            .iter()
            .map(|(cell, _)| FileHashes {
                cell_index: cell,
                entries: recorded.cells.remove(&cell).unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        let snapshot = HashSnapshot::new(cells);
        info!(
            cells = snapshot.cells.len(),
            entries = snapshot.entry_count(),
            "snapshot recorded"
        );
        snapshot
    }
}
