//! Content-addressed file store.
//!
//! Holds file bytes indexed by SHA-256 digest, using a two-level fan-out
//! layout: `<store_root>/<sha256[0:2]>/<sha256>`.
//!
//! Writes go to a temp file under `.tmp/` and are renamed into place, so a
//! concurrent duplicate `put` of the same content is harmless.

use rch_protocol::ops::FileHashEntry;
use rch_protocol::ContentHash;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;

use crate::provider::{ContentError, ContentProvider};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Content-addressed store backed by a local directory.
#[derive(Debug)]
pub struct ContentStore {
    store_root: PathBuf,
}

impl ContentStore {
    /// Open a store, creating its root if missing.
    pub fn new(store_root: impl AsRef<Path>) -> io::Result<Self> {
        let store_root = store_root.as_ref().to_path_buf();
        fs::create_dir_all(&store_root)?;
        Ok(Self { store_root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.store_root
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.as_str();
        let prefix = &hex[..2.min(hex.len())];
        self.store_root.join(prefix).join(hex)
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.store_root.join(".tmp").join(format!(
            ".tmp.{}.{}.{}",
            std::process::id(),
            nanos,
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    /// Whether content with this hash is stored.
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Store bytes from a reader, returning their hash. Idempotent.
    pub fn put<R: Read>(&self, mut reader: R) -> io::Result<ContentHash> {
        let temp_path = self.temp_path();
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let hash = match write_hashed(&temp_path, &mut reader) {
            Ok(hash) => hash,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        let final_path = self.blob_path(&hash);
        if final_path.exists() {
            let _ = fs::remove_file(&temp_path);
            return Ok(hash);
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            if !final_path.exists() {
                return Err(e);
            }
        }
        debug!(hash = %hash, "stored content");
        Ok(hash)
    }

    /// Store a byte slice.
    pub fn put_bytes(&self, bytes: &[u8]) -> io::Result<ContentHash> {
        self.put(bytes)
    }

    /// Store the contents of a file.
    pub fn put_file(&self, path: &Path) -> io::Result<ContentHash> {
        self.put(File::open(path)?)
    }

    /// Open stored content for reading.
    pub fn open(&self, hash: &ContentHash) -> Result<File, ContentError> {
        match File::open(self.blob_path(hash)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ContentError::NotFound(hash.clone()))
            }
            Err(e) => Err(ContentError::Io(e)),
        }
    }
}

fn write_hashed<R: Read>(path: &Path, reader: &mut R) -> io::Result<ContentHash> {
    let mut file = File::create(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
    }
    file.sync_all()?;
    Ok(ContentHash::from_digest(hasher))
}

impl ContentProvider for ContentStore {
    fn materialize(&self, entry: &FileHashEntry, target: &Path) -> Result<(), ContentError> {
        let mut source = self.open(&entry.hash)?;
        let mut out = File::create(target)?;
        io::copy(&mut source, &mut out)?;
        Ok(())
    }
}
