//! Cells and the keys used to address files inside them.
//!
//! A build may span several independently rooted source trees ("cells").
//! Every file lookup first picks the owning cell, then indexes strictly
//! within that cell using a slash-normalized path relative to its root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Index of a cell within one build. The root cell is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellIndex(pub u32);

impl CellIndex {
    /// The root cell.
    pub const ROOT: CellIndex = CellIndex(0);
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Render a path with forward slashes regardless of platform.
pub fn to_unix_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Key of one recorded hash: a plain file or a member inside an archive.
///
/// Archive members are addressed independently of the archive's own hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HashKey {
    /// A file or directory.
    Plain { path: String },
    /// A member of an archive file.
    ArchiveMember { archive: String, member: String },
}

impl HashKey {
    /// Key for a plain path.
    pub fn plain(path: impl Into<String>) -> Self {
        Self::Plain { path: path.into() }
    }

    /// Key for an archive member.
    pub fn archive_member(archive: impl Into<String>, member: impl Into<String>) -> Self {
        Self::ArchiveMember {
            archive: archive.into(),
            member: member.into(),
        }
    }

    /// The on-disk path: the file itself, or the containing archive.
    pub fn path(&self) -> &str {
        match self {
            Self::Plain { path } => path,
            Self::ArchiveMember { archive, .. } => archive,
        }
    }

    /// The archive member, if any.
    pub fn member(&self) -> Option<&str> {
        match self {
            Self::Plain { .. } => None,
            Self::ArchiveMember { member, .. } => Some(member),
        }
    }

    /// Key of the file that holds this key's bytes on disk.
    pub fn containing_file(&self) -> HashKey {
        Self::plain(self.path())
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { path } => write!(f, "{}", path),
            Self::ArchiveMember { archive, member } => write!(f, "{}!/{}", archive, member),
        }
    }
}

/// A build input as the build engine names it: by absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputPath {
    /// A file or directory.
    File(PathBuf),
    /// A member of an archive file.
    ArchiveMember { archive: PathBuf, member: String },
}

impl InputPath {
    /// Input naming a plain file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Input naming an archive member.
    pub fn archive_member(archive: impl Into<PathBuf>, member: impl Into<String>) -> Self {
        Self::ArchiveMember {
            archive: archive.into(),
            member: member.into(),
        }
    }

    /// The on-disk path: the file itself, or the containing archive.
    pub fn file_path(&self) -> &Path {
        match self {
            Self::File(path) => path,
            Self::ArchiveMember { archive, .. } => archive,
        }
    }
}

/// An input resolved to its owning cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedInput {
    /// Owning cell.
    pub cell: CellIndex,
    /// Key within that cell.
    pub key: HashKey,
    /// The path lies outside every cell and is keyed absolutely in the root cell.
    pub is_absolute: bool,
}

/// Root directories of the cells participating in a build.
///
/// Indices are assigned in registration order; the first root is the root cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellRoots {
    roots: BTreeMap<CellIndex, PathBuf>,
}

impl CellRoots {
    /// Roots with only the root cell registered.
    pub fn new(root_cell: impl Into<PathBuf>) -> Self {
        let mut roots = BTreeMap::new();
        roots.insert(CellIndex::ROOT, root_cell.into());
        Self { roots }
    }

    /// Register roots in order, starting with the root cell.
    pub fn from_roots<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut cells = Self::default();
        for root in roots {
            cells.add(root);
        }
        cells
    }

    /// Register a cell root, returning its index. Re-registering returns the existing index.
    pub fn add(&mut self, root: impl Into<PathBuf>) -> CellIndex {
        let root = root.into();
        if let Some((index, _)) = self.roots.iter().find(|(_, r)| **r == root) {
            return *index;
        }
        let index = CellIndex(self.roots.len() as u32);
        self.roots.insert(index, root);
        index
    }

    /// Register a root under a fixed index, as a worker does when mirroring the orchestrator's layout.
    pub fn insert(&mut self, index: CellIndex, root: impl Into<PathBuf>) {
        self.roots.insert(index, root.into());
    }

    /// Root directory of a cell.
    pub fn root(&self, index: CellIndex) -> Option<&Path> {
        self.roots.get(&index).map(PathBuf::as_path)
    }

    /// All registered cells.
    pub fn iter(&self) -> impl Iterator<Item = (CellIndex, &Path)> {
        self.roots.iter().map(|(i, r)| (*i, r.as_path()))
    }

    /// Number of registered cells.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether no cell is registered.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Find the cell owning `path` (the deepest matching root) and the path relative to it.
    pub fn resolve(&self, path: &Path) -> Option<(CellIndex, PathBuf)> {
        self.roots
            .iter()
            .filter(|(_, root)| path.starts_with(root))
            .max_by_key(|(_, root)| root.components().count())
            .and_then(|(index, root)| {
                path.strip_prefix(root)
                    .ok()
                    .map(|rel| (*index, rel.to_path_buf()))
            })
    }

    /// Resolve a build input to its cell and key.
    ///
    /// Absolute paths outside every cell are keyed by their absolute path in
    /// the root cell.
    pub fn resolve_input(&self, input: &InputPath) -> ResolvedInput {
        let (cell, path, is_absolute) = match self.resolve(input.file_path()) {
            Some((cell, rel)) => (cell, to_unix_path(&rel), false),
            None => (
                CellIndex::ROOT,
                to_unix_path(input.file_path()),
                input.file_path().is_absolute(),
            ),
        };
        let key = match input {
            InputPath::File(_) => HashKey::Plain { path },
            InputPath::ArchiveMember { member, .. } => HashKey::ArchiveMember {
                archive: path,
                member: member.replace('\\', "/"),
            },
        };
        ResolvedInput {
            cell,
            key,
            is_absolute,
        }
    }

    /// Absolute on-disk location of a key's file within a cell.
    pub fn absolute_path(&self, cell: CellIndex, key: &HashKey) -> Option<PathBuf> {
        let path = Path::new(key.path());
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        self.root(cell).map(|root| root.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> CellRoots {
        CellRoots::from_roots(["/repo", "/repo/third-party/dep", "/other"])
    }

    #[test]
    fn test_root_cell_is_first() {
        let cells = roots();
        assert_eq!(cells.root(CellIndex::ROOT), Some(Path::new("/repo")));
        assert_eq!(cells.len(), 3);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut cells = roots();
        assert_eq!(cells.add("/other"), CellIndex(2));
        assert_eq!(cells.len(), 3);
    }

    #[test]
    fn test_resolve_deepest_root_wins() {
        let cells = roots();
        let (cell, rel) = cells.resolve(Path::new("/repo/third-party/dep/src/a.c")).unwrap();
        assert_eq!(cell, CellIndex(1));
        assert_eq!(rel, PathBuf::from("src/a.c"));

        let (cell, rel) = cells.resolve(Path::new("/repo/src/a.c")).unwrap();
        assert_eq!(cell, CellIndex::ROOT);
        assert_eq!(rel, PathBuf::from("src/a.c"));
    }

    #[test]
    fn test_resolve_is_component_wise() {
        let cells = roots();
        assert!(cells.resolve(Path::new("/repository/a.c")).is_none());
    }

    #[test]
    fn test_resolve_input_outside_cells() {
        let cells = roots();
        let resolved = cells.resolve_input(&InputPath::file("/usr/include/stdio.h"));
        assert_eq!(resolved.cell, CellIndex::ROOT);
        assert!(resolved.is_absolute);
        assert_eq!(resolved.key, HashKey::plain("/usr/include/stdio.h"));
    }

    #[test]
    fn test_resolve_archive_member() {
        let cells = roots();
        let resolved =
            cells.resolve_input(&InputPath::archive_member("/other/lib/deps.tar", "pkg/A.class"));
        assert_eq!(resolved.cell, CellIndex(2));
        assert_eq!(resolved.key, HashKey::archive_member("lib/deps.tar", "pkg/A.class"));
        assert_eq!(resolved.key.containing_file(), HashKey::plain("lib/deps.tar"));
        assert_eq!(resolved.key.to_string(), "lib/deps.tar!/pkg/A.class");
    }

    #[test]
    fn test_hash_key_serde_tagged() {
        let json = serde_json::to_value(HashKey::plain("a/b")).unwrap();
        assert_eq!(json["kind"], "plain");
        assert_eq!(json["path"], "a/b");
    }
}
