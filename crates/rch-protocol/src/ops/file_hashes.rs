//! File hash snapshot types.
//!
//! The orchestrator records the content hash of every input it touches, one
//! list per cell. Workers consume the snapshot read-only for the whole build.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::cells::{CellIndex, HashKey};
use crate::hash::ContentHash;

/// Schema version for the serialized snapshot.
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier for the serialized snapshot.
pub const SCHEMA_ID: &str = "rch-distbuild/file_hashes@1";

/// Recorded hash of one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashEntry {
    /// Owning cell.
    pub cell_index: CellIndex,
    /// Slash-normalized path, relative to the cell root unless `path_is_absolute`.
    pub path: String,
    /// Member inside the archive at `path`, if this entry hashes a member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_member: Option<String>,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub path_is_absolute: bool,
    /// Content hash (of the member when `archive_member` is set).
    pub hash: ContentHash,
    /// File bytes shipped inline with the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<u8>>,
    /// Materialize before the build starts rather than on first use.
    #[serde(default)]
    pub materialize_during_preloading: bool,
    /// Immediate child names of a directory entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl FileHashEntry {
    /// Entry for a plain file.
    pub fn file(cell_index: CellIndex, path: impl Into<String>, hash: ContentHash) -> Self {
        Self {
            cell_index,
            path: path.into(),
            archive_member: None,
            is_directory: false,
            path_is_absolute: false,
            hash,
            contents: None,
            materialize_during_preloading: false,
            children: Vec::new(),
        }
    }

    /// Key this entry is looked up by.
    pub fn key(&self) -> HashKey {
        match &self.archive_member {
            Some(member) => HashKey::archive_member(self.path.clone(), member.clone()),
            None => HashKey::plain(self.path.clone()),
        }
    }
}

/// All recorded entries of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashes {
    pub cell_index: CellIndex,
    pub entries: Vec<FileHashEntry>,
}

impl FileHashes {
    pub fn new(cell_index: CellIndex) -> Self {
        Self {
            cell_index,
            entries: Vec::new(),
        }
    }
}

/// Hashes of every recorded input, per cell, for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSnapshot {
    pub schema_version: u32,
    pub schema_id: String,
    /// One list per cell, ordered by cell index.
    pub cells: Vec<FileHashes>,
}

impl Default for HashSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            cells: Vec::new(),
        }
    }
}

impl HashSnapshot {
    /// Snapshot from per-cell lists.
    pub fn new(mut cells: Vec<FileHashes>) -> Self {
        cells.sort_by_key(|c| c.cell_index);
        Self {
            cells,
            ..Self::default()
        }
    }

    /// Entries of one cell.
    pub fn cell(&self, index: CellIndex) -> Option<&FileHashes> {
        self.cells.iter().find(|c| c.cell_index == index)
    }

    /// Total number of entries across cells.
    pub fn entry_count(&self) -> usize {
        self.cells.iter().map(|c| c.entries.len()).sum()
    }

    /// Write as pretty JSON.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("JSON serialization failed: {}", e),
            )
        })?;
        fs::write(path, json)
    }

    /// Read a snapshot written by [`HashSnapshot::write_to_file`].
    pub fn read_from_file(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        let snapshot: Self = serde_json::from_slice(&bytes).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid snapshot: {}", e))
        })?;
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported snapshot schema version {}", snapshot.schema_version),
            ));
        }
        Ok(snapshot)
    }
}
