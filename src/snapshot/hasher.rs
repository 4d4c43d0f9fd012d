//! Local content hashing with memoization.

use rch_protocol::ContentHash;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tar::Archive;
use walkdir::WalkDir;

use super::SnapshotError;

/// Hashes of files on local disk.
pub trait LocalHashCache: Send + Sync {
    /// Hash of a file, or of a directory's sorted `(name, child hash)` pairs.
    fn hash(&self, path: &Path) -> Result<ContentHash, SnapshotError>;

    /// Hash of one member of a tar archive, streamed without extracting the archive.
    fn hash_member(&self, archive: &Path, member: &str) -> Result<ContentHash, SnapshotError>;
}

/// SHA-256 hasher that remembers every result for the life of a build.
#[derive(Debug, Default)]
pub struct DefaultHashCache {
    files: RwLock<HashMap<PathBuf, ContentHash>>,
    members: RwLock<HashMap<(PathBuf, String), ContentHash>>,
}

impl DefaultHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn compute(&self, path: &Path) -> Result<ContentHash, SnapshotError> {
        let metadata = fs::metadata(path).map_err(|e| SnapshotError::io(path, e))?;
        if metadata.is_file() {
            let file = File::open(path).map_err(|e| SnapshotError::io(path, e))?;
            return ContentHash::of_reader(file).map_err(|e| SnapshotError::io(path, e));
        }
        if !metadata.is_dir() {
            return Err(SnapshotError::UnsupportedFileType(path.to_path_buf()));
        }

        let mut hasher = Sha256::new();
        for child in WalkDir::new(path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let child = child?;
            let child_hash = self.hash(child.path())?;
            hasher.update(child.file_name().to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(child_hash.as_str().as_bytes());
            hasher.update([b'\n']);
        }
        Ok(ContentHash::from_digest(hasher))
    }
}

impl LocalHashCache for DefaultHashCache {
    fn hash(&self, path: &Path) -> Result<ContentHash, SnapshotError> {
        if let Some(hash) = self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
        {
            return Ok(hash.clone());
        }
        let hash = self.compute(path)?;
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), hash.clone());
        Ok(hash)
    }

    fn hash_member(&self, archive: &Path, member: &str) -> Result<ContentHash, SnapshotError> {
        let key = (archive.to_path_buf(), member.to_string());
        if let Some(hash) = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(hash.clone());
        }

        let file = File::open(archive).map_err(|e| SnapshotError::io(archive, e))?;
        let mut tar = Archive::new(file);
        let entries = tar.entries().map_err(|e| SnapshotError::io(archive, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| SnapshotError::io(archive, e))?;
            let name = entry
                .path()
                .map_err(|e| SnapshotError::io(archive, e))?
                .to_string_lossy()
                .replace('\\', "/");
            if name.trim_start_matches("./") != member {
                continue;
            }
            let hash = ContentHash::of_reader(entry).map_err(|e| SnapshotError::io(archive, e))?;
            self.members
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key, hash.clone());
            return Ok(hash);
        }
        Err(SnapshotError::MemberNotFound {
            archive: archive.to_path_buf(),
            member: member.to_string(),
        })
    }
}
