//! Hash lookups across every cell of a build.

use rch_protocol::ops::HashSnapshot;
use rch_protocol::{CellIndex, CellRoots, ContentHash, InputPath, ResolvedInput};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::WorkerConfig;
use crate::error::HashCacheError;
use crate::hash_cache::{FileHashCache, RemoteHashCache};
use crate::materializer::Materializer;
use crate::provider::ContentProvider;

/// Routes absolute build inputs to the cache of their owning cell.
///
/// A lookup is only ever evaluated against the owning cell's entries, even
/// when another cell records the same relative path.
pub struct StackedHashCache {
    roots: CellRoots,
    caches: BTreeMap<CellIndex, Arc<dyn FileHashCache>>,
}

impl StackedHashCache {
    pub fn new(roots: CellRoots) -> Self {
        Self {
            roots,
            caches: BTreeMap::new(),
        }
    }

    /// Materializing caches for every cell of a snapshot.
    ///
    /// Every cell in the snapshot must have a local root.
    pub fn from_snapshot(
        snapshot: HashSnapshot,
        roots: CellRoots,
        provider: Arc<dyn ContentProvider>,
        config: WorkerConfig,
    ) -> Result<Self, HashCacheError> {
        let mut stacked = Self::new(roots);
        for hashes in snapshot.cells {
            let cell = hashes.cell_index;
            let root = stacked
                .roots
                .root(cell)
                .ok_or(HashCacheError::CellNotRegistered(cell))?
                .to_path_buf();
            let materializer = Materializer::new(
                RemoteHashCache::new(hashes),
                root,
                provider.clone(),
                config.clone(),
            );
            stacked.register(Arc::new(materializer));
        }
        Ok(stacked)
    }

    /// Add or replace the cache of a cell.
    pub fn register(&mut self, cache: Arc<dyn FileHashCache>) {
        self.caches.insert(cache.cell_index(), cache);
    }

    pub fn roots(&self) -> &CellRoots {
        &self.roots
    }

    fn route(&self, input: &InputPath) -> (ResolvedInput, Option<&Arc<dyn FileHashCache>>) {
        let resolved = self.roots.resolve_input(input);
        let cache = self.caches.get(&resolved.cell);
        (resolved, cache)
    }

    /// Whether the owning cell records a hash for `input`.
    pub fn will_get(&self, input: &InputPath) -> bool {
        match self.route(input) {
            (resolved, Some(cache)) => cache.will_get(&resolved.key),
            (_, None) => false,
        }
    }

    /// Recorded hash of `input`, materializing it where the cell's cache does so.
    pub fn get(&self, input: &InputPath) -> Result<ContentHash, HashCacheError> {
        match self.route(input) {
            (resolved, Some(cache)) => cache.get(&resolved.key),
            (resolved, None) => Err(HashCacheError::CellNotRegistered(resolved.cell)),
        }
    }

    /// Preload every cell, returning the number of entries handled.
    ///
    /// A failing cell does not stop the others; the first error is returned
    /// after all cells ran.
    pub fn preload(&self) -> Result<usize, HashCacheError> {
        let mut total = 0;
        let mut first_error = None;
        for (cell, cache) in &self.caches {
            match cache.preload() {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(cell = %cell, error = %e, "preload failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}
