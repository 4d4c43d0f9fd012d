//! Lazy materialization of recorded files onto worker disk.
//!
//! The first `get` of a key writes its bytes under the cell root; later
//! lookups are answered from the recorded hash without touching the
//! provider again. Each key is guarded by its own lock so concurrent
//! requests for the same file fetch it once.

use rch_protocol::ops::FileHashEntry;
use rch_protocol::{CellIndex, ContentHash, HashKey};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::error::HashCacheError;
use crate::hash_cache::{FileHashCache, RemoteHashCache};
use crate::provider::ContentProvider;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// How a key ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// Already done earlier in this build.
    Cached,
    /// Written from inline snapshot contents.
    Inline,
    /// A matching file was already on disk.
    Adopted,
    /// Fetched through the content provider.
    Fetched,
    /// Directory created and children materialized.
    Directory,
    /// Absolute path outside every cell; left alone.
    Skipped,
}

/// Remote hash cache that also materializes file bytes on first use.
pub struct Materializer {
    cache: RemoteHashCache,
    root: PathBuf,
    provider: Arc<dyn ContentProvider>,
    config: WorkerConfig,
    done: Mutex<HashMap<HashKey, Arc<Mutex<bool>>>>,
}

impl Materializer {
    pub fn new(
        cache: RemoteHashCache,
        root: impl Into<PathBuf>,
        provider: Arc<dyn ContentProvider>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            cache,
            root: root.into(),
            provider,
            config,
            done: Mutex::new(HashMap::new()),
        }
    }

    /// Cell root files are written under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The underlying read-only lookup.
    pub fn hash_cache(&self) -> &RemoteHashCache {
        &self.cache
    }

    fn key_lock(&self, key: &HashKey) -> Arc<Mutex<bool>> {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        done.entry(key.clone()).or_default().clone()
    }

    /// Ensure the bytes of `key` are on disk.
    pub fn materialize(&self, key: &HashKey) -> Result<Materialized, HashCacheError> {
        let entry = self.cache.require(key)?;
        if entry.path_is_absolute {
            return Ok(Materialized::Skipped);
        }
        if key.member().is_some() {
            // Members are read from their archive, so the archive is what lands on disk.
            return self.materialize(&key.containing_file());
        }

        let lock = self.key_lock(key);
        let mut done = lock.lock().unwrap_or_else(|e| e.into_inner());
        if *done {
            return Ok(Materialized::Cached);
        }

        let target = contained(&self.root, &entry.path).ok_or_else(|| HashCacheError::EscapesRoot {
            cell: entry.cell_index,
            path: entry.path.clone(),
        })?;
        let outcome = if entry.is_directory {
            self.materialize_directory(entry, &target)?
        } else {
            self.materialize_file(entry, &target)?
        };
        *done = true;
        debug!(cell = %entry.cell_index, key = %key, ?outcome, "materialized");
        Ok(outcome)
    }

    fn materialize_directory(
        &self,
        entry: &FileHashEntry,
        target: &Path,
    ) -> Result<Materialized, HashCacheError> {
        fs::create_dir_all(target)?;
        for child in &entry.children {
            let child_path = if entry.path.is_empty() {
                child.clone()
            } else {
                format!("{}/{}", entry.path, child)
            };
            self.materialize(&HashKey::plain(child_path))?;
        }
        Ok(Materialized::Directory)
    }

    fn materialize_file(
        &self,
        entry: &FileHashEntry,
        target: &Path,
    ) -> Result<Materialized, HashCacheError> {
        if target.is_file() && ContentHash::of_reader(File::open(target)?)? == entry.hash {
            return Ok(Materialized::Adopted);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = temp_path(target);
        let result = match &entry.contents {
            Some(contents) => fs::write(&temp, contents)
                .map_err(HashCacheError::from)
                .map(|_| Materialized::Inline),
            None => self
                .provider
                .materialize(entry, &temp)
                .map_err(HashCacheError::from)
                .map(|_| Materialized::Fetched),
        }
        .and_then(|outcome| {
            self.verify(entry, &temp)?;
            fs::rename(&temp, target)?;
            Ok(outcome)
        });
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }

    fn verify(&self, entry: &FileHashEntry, path: &Path) -> Result<(), HashCacheError> {
        if !self.config.verify_materialized {
            return Ok(());
        }
        let actual = ContentHash::of_reader(File::open(path)?)?;
        if actual != entry.hash {
            return Err(HashCacheError::ContentMismatch {
                key: entry.key(),
                expected: entry.hash.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// `root` joined with `relative`, or `None` when `relative` is absolute or
/// climbs out through `..`.
fn contained(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(
        ".{}.rch-tmp.{}.{}",
        name,
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

impl FileHashCache for Materializer {
    fn cell_index(&self) -> CellIndex {
        self.cache.cell_index()
    }

    fn will_get(&self, key: &HashKey) -> bool {
        self.cache.will_get(key)
    }

    fn get(&self, key: &HashKey) -> Result<ContentHash, HashCacheError> {
        let hash = self.cache.get(key)?;
        self.materialize(key)?;
        Ok(hash)
    }

    fn preload(&self) -> Result<usize, HashCacheError> {
        let keys: Vec<HashKey> = self
            .cache
            .entries()
            .filter(|e| !e.path_is_absolute)
            .filter(|e| self.config.preload_all || e.materialize_during_preloading)
            .map(FileHashEntry::key)
            .collect();
        for key in &keys {
            self.materialize(key)?;
        }
        info!(cell = %self.cell_index(), count = keys.len(), "preloaded");
        Ok(keys.len())
    }
}
