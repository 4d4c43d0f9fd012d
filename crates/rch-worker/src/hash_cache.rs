//! Read-only hash lookup over one cell's snapshot.

use rch_protocol::ops::{FileHashEntry, FileHashes};
use rch_protocol::{CellIndex, ContentHash, HashKey};
use std::collections::HashMap;

use crate::error::HashCacheError;

/// Hash lookup for the files of one cell.
pub trait FileHashCache: Send + Sync {
    /// Cell this cache answers for.
    fn cell_index(&self) -> CellIndex;

    /// Whether a hash is recorded for `key`.
    fn will_get(&self, key: &HashKey) -> bool;

    /// Recorded hash of `key`.
    ///
    /// An unrecorded key is a precondition failure: the orchestrator and the
    /// worker disagree on the inputs of the build.
    fn get(&self, key: &HashKey) -> Result<ContentHash, HashCacheError>;

    /// Bring eagerly wanted entries onto local disk, returning how many were handled.
    fn preload(&self) -> Result<usize, HashCacheError> {
        Ok(0)
    }
}

/// Hash cache answering from a recorded snapshot, without touching disk.
#[derive(Debug, Clone)]
pub struct RemoteHashCache {
    cell_index: CellIndex,
    entries: HashMap<HashKey, FileHashEntry>,
}

impl RemoteHashCache {
    /// Index the entries of one cell. Later duplicates of a key are ignored.
    pub fn new(hashes: FileHashes) -> Self {
        let mut entries = HashMap::with_capacity(hashes.entries.len());
        for entry in hashes.entries {
            entries.entry(entry.key()).or_insert(entry);
        }
        Self {
            cell_index: hashes.cell_index,
            entries,
        }
    }

    /// Recorded entry of `key`.
    pub fn entry(&self, key: &HashKey) -> Option<&FileHashEntry> {
        self.entries.get(key)
    }

    /// Recorded entry of `key`, or a precondition error.
    pub fn require(&self, key: &HashKey) -> Result<&FileHashEntry, HashCacheError> {
        self.entry(key).ok_or_else(|| HashCacheError::NotRecorded {
            cell: self.cell_index,
            key: key.clone(),
        })
    }

    /// All recorded entries, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &FileHashEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FileHashCache for RemoteHashCache {
    fn cell_index(&self) -> CellIndex {
        self.cell_index
    }

    fn will_get(&self, key: &HashKey) -> bool {
        self.entries.contains_key(key)
    }

    fn get(&self, key: &HashKey) -> Result<ContentHash, HashCacheError> {
        self.require(key).map(|entry| entry.hash.clone())
    }
}
