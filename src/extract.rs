//! Tar extraction into a destination directory.
//!
//! Entries are validated before anything is written: absolute paths and
//! `..` components are rejected so an archive can never write outside the
//! destination.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::debug;
use walkdir::WalkDir;

use rch_protocol::ErrorKind;

/// What happens to files already present at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingFileMode {
    /// Archive entries replace existing files; other files stay.
    Overwrite,
    /// Like `Overwrite`, and directories present in the archive lose any
    /// file the archive does not contain.
    OverwriteAndCleanDirectories,
}

/// Errors from extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("archive entry escapes destination: {0}")]
    EscapesDestination(PathBuf),
}

impl ExtractError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IoError(_) | Self::WalkError(_) => ErrorKind::Io,
            Self::EscapesDestination(_) => ErrorKind::Format,
        }
    }
}

/// Result of one extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Regular files written.
    pub files_written: usize,
    /// Stale paths removed by cleaning.
    pub paths_removed: usize,
}

#[derive(Default)]
struct Layout {
    files: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
}

impl Layout {
    fn contains(&self, path: &Path) -> bool {
        self.files.contains(path) || self.dirs.contains(path)
    }
}

/// Extract an in-memory tar archive into `dest`.
pub fn extract_tar(
    archive: &[u8],
    dest: &Path,
    mode: ExistingFileMode,
) -> Result<ExtractSummary, ExtractError> {
    let layout = scan(archive)?;
    fs::create_dir_all(dest)?;

    let mut summary = ExtractSummary::default();
    if mode == ExistingFileMode::OverwriteAndCleanDirectories {
        summary.paths_removed = clean(dest, &layout)?;
    }

    let mut tar = Archive::new(archive);
    for entry in tar.entries()? {
        let mut entry = entry?;
        let rel = normalize(&entry.path()?)?;
        let target = dest.join(&rel);
        let is_dir = entry.header().entry_type() == EntryType::Directory;

        // A file may replace a directory and vice versa.
        if is_dir && target.is_file() {
            fs::remove_file(&target)?;
        } else if !is_dir && target.is_dir() {
            fs::remove_dir_all(&target)?;
        }

        if entry.unpack_in(dest)? && entry.header().entry_type().is_file() {
            summary.files_written += 1;
        }
    }
    debug!(
        dest = %dest.display(),
        files = summary.files_written,
        removed = summary.paths_removed,
        "extracted archive"
    );
    Ok(summary)
}

/// Collect and validate every entry path before touching disk.
fn scan(archive: &[u8]) -> Result<Layout, ExtractError> {
    let mut layout = Layout::default();
    layout.dirs.insert(PathBuf::new());

    let mut tar = Archive::new(archive);
    for entry in tar.entries()? {
        let entry = entry?;
        let rel = normalize(&entry.path()?)?;
        for ancestor in rel.ancestors().skip(1) {
            layout.dirs.insert(ancestor.to_path_buf());
        }
        if entry.header().entry_type() == EntryType::Directory {
            layout.dirs.insert(rel);
        } else {
            layout.files.insert(rel);
        }
    }
    Ok(layout)
}

fn normalize(path: &Path) -> Result<PathBuf, ExtractError> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return Err(ExtractError::EscapesDestination(path.to_path_buf())),
        }
    }
    Ok(normalized)
}

/// Remove entries of archive directories that the archive does not contain.
fn clean(dest: &Path, layout: &Layout) -> Result<usize, ExtractError> {
    let mut removed = 0;
    for dir in &layout.dirs {
        let on_disk = dest.join(dir);
        if !on_disk.is_dir() {
            continue;
        }
        for child in WalkDir::new(&on_disk).min_depth(1).max_depth(1) {
            let child = child?;
            let rel = dir.join(child.file_name());
            if layout.contains(&rel) {
                continue;
            }
            if child.file_type().is_dir() {
                fs::remove_dir_all(child.path())?;
            } else {
                fs::remove_file(child.path())?;
            }
            removed += 1;
        }
    }
    Ok(removed)
}

/// Build a tar archive of `root`'s contents with paths relative to `root`.
pub fn pack_dir(root: &Path) -> Result<Vec<u8>, ExtractError> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| ExtractError::EscapesDestination(entry.path().to_path_buf()))?;
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else if entry.file_type().is_file() {
            let mut file = fs::File::open(entry.path())?;
            builder.append_file(rel, &mut file)?;
        }
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_files() {
        let dir = TempDir::new().unwrap();
        let data = archive(&[("bin/app", b"elf"), ("README", b"hi")]);

        let summary = extract_tar(&data, dir.path(), ExistingFileMode::Overwrite).unwrap();
        assert_eq!(summary.files_written, 2);
        assert_eq!(fs::read(dir.path().join("bin/app")).unwrap(), b"elf");
    }

    #[test]
    fn test_overwrite_keeps_unrelated_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/old"), b"old").unwrap();
        fs::write(dir.path().join("bin/app"), b"previous").unwrap();

        let data = archive(&[("bin/app", b"new")]);
        extract_tar(&data, dir.path(), ExistingFileMode::Overwrite).unwrap();

        assert_eq!(fs::read(dir.path().join("bin/app")).unwrap(), b"new");
        assert!(dir.path().join("bin/old").exists());
    }

    #[test]
    fn test_clean_removes_stale_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin/nested")).unwrap();
        fs::write(dir.path().join("bin/old"), b"old").unwrap();
        fs::write(dir.path().join("bin/nested/x"), b"x").unwrap();
        fs::write(dir.path().join("stale.txt"), b"s").unwrap();

        let data = archive(&[("bin/app", b"new")]);
        let summary =
            extract_tar(&data, dir.path(), ExistingFileMode::OverwriteAndCleanDirectories)
                .unwrap();

        assert_eq!(summary.paths_removed, 3);
        assert!(!dir.path().join("bin/old").exists());
        assert!(!dir.path().join("bin/nested").exists());
        assert!(!dir.path().join("stale.txt").exists());
        assert_eq!(fs::read(dir.path().join("bin/app")).unwrap(), b"new");
    }

    #[test]
    fn test_twice_converges() {
        let dir = TempDir::new().unwrap();
        let data = archive(&[("a/b.txt", b"b"), ("c.txt", b"c")]);
        let mode = ExistingFileMode::OverwriteAndCleanDirectories;

        extract_tar(&data, dir.path(), mode).unwrap();
        let second = extract_tar(&data, dir.path(), mode).unwrap();

        assert_eq!(second.paths_removed, 0);
        assert_eq!(fs::read(dir.path().join("a/b.txt")).unwrap(), b"b");
        assert_eq!(fs::read(dir.path().join("c.txt")).unwrap(), b"c");
    }

    #[test]
    fn test_pack_dir_round_trip() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("out/lib")).unwrap();
        fs::write(src.path().join("out/lib/a.so"), b"so").unwrap();

        let data = pack_dir(src.path()).unwrap();
        let dst = TempDir::new().unwrap();
        extract_tar(&data, dst.path(), ExistingFileMode::Overwrite).unwrap();
        assert_eq!(fs::read(dst.path().join("out/lib/a.so")).unwrap(), b"so");
    }

    #[test]
    fn test_normalize_rejects_parent_dir() {
        assert!(matches!(
            normalize(Path::new("a/../../etc/passwd")),
            Err(ExtractError::EscapesDestination(_))
        ));
        assert!(normalize(Path::new("/etc/passwd")).is_err());
        assert_eq!(normalize(Path::new("./a/b")).unwrap(), PathBuf::from("a/b"));
    }
}
