//! Integration tests: snapshot recording on the orchestrator, lazy
//! materialization on a worker.
//!
//! The orchestrator hashes a two-cell source tree, ships the snapshot as
//! JSON, and a worker with different local roots rebuilds the same bytes
//! on demand from a content store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rch_distbuild::{DefaultHashCache, SnapshotRecorder};
use rch_protocol::ops::HashSnapshot;
use rch_protocol::{CellIndex, CellRoots, ContentHash, HashKey, InputPath};
use rch_worker::{ContentStore, HashCacheError, StackedHashCache, WorkerConfig};
use tempfile::TempDir;
use walkdir::WalkDir;

const DEP_CELL: CellIndex = CellIndex(1);

struct Tree {
    _temp: TempDir,
    local: PathBuf,
    worker: PathBuf,
    store: PathBuf,
}

impl Tree {
    fn local_dep(&self) -> PathBuf {
        self.local.join("third_party/lib")
    }

    fn worker_dep(&self) -> PathBuf {
        self.worker.join("third_party/lib")
    }

    fn local_roots(&self) -> CellRoots {
        CellRoots::from_roots([self.local.clone(), self.local_dep()])
    }

    fn worker_roots(&self) -> CellRoots {
        CellRoots::from_roots([self.worker.clone(), self.worker_dep()])
    }
}

fn write(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn write_tar(path: &Path, members: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    write(path, &builder.into_inner().unwrap());
}

fn tree() -> Tree {
    let temp = TempDir::new().unwrap();
    let local = temp.path().join("local/repo");
    let tree = Tree {
        worker: temp.path().join("worker/repo"),
        store: temp.path().join("store"),
        local,
        _temp: temp,
    };

    write(&tree.local.join("BUCK"), b"cxx_binary(name = 'main')");
    write(&tree.local.join("src/main.c"), b"int main(void) { return helper(); }");
    write(&tree.local.join("src/util.h"), b"#pragma");
    write(&tree.local.join("assets/a.txt"), b"first asset");
    write(&tree.local.join("assets/b.txt"), b"second asset");
    write_tar(
        &tree.local.join("deps.tar"),
        &[("pkg/A.class", b"class A bytes"), ("pkg/B.class", b"class B bytes")],
    );
    write(&tree.local_dep().join("src/main.c"), b"int helper(void) { return 0; }");
    tree
}

fn record(tree: &Tree) -> HashSnapshot {
    let recorder = SnapshotRecorder::new(tree.local_roots(), Arc::new(DefaultHashCache::new()))
        .with_inline_max_bytes(8);
    let inputs = [
        InputPath::file(tree.local.join("src/main.c")),
        InputPath::file(tree.local.join("src/util.h")),
        InputPath::file(tree.local.join("assets")),
        InputPath::archive_member(tree.local.join("deps.tar"), "pkg/A.class"),
        InputPath::file(tree.local_dep().join("src/main.c")),
    ];
    recorder.record_all(&inputs, 4).unwrap();
    recorder
        .record_for_preload(&InputPath::file(tree.local.join("BUCK")))
        .unwrap();

    let path = tree.local.join("../snapshot.json");
    recorder.finish().write_to_file(&path).unwrap();
    HashSnapshot::read_from_file(&path).unwrap()
}

/// Upload every local file except the inlined header.
fn upload(tree: &Tree) -> ContentStore {
    let store = ContentStore::new(&tree.store).unwrap();
    for entry in WalkDir::new(&tree.local) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() && entry.file_name() != "util.h" {
            store.put_file(entry.path()).unwrap();
        }
    }
    store
}

fn worker(tree: &Tree, snapshot: HashSnapshot) -> StackedHashCache {
    StackedHashCache::from_snapshot(
        snapshot,
        tree.worker_roots(),
        Arc::new(upload(tree)),
        WorkerConfig::default(),
    )
    .unwrap()
}

// === Recording Tests ===

#[test]
fn test_snapshot_is_cell_relative() {
    let tree = tree();
    let snapshot = record(&tree);

    let root = snapshot.cell(CellIndex::ROOT).unwrap();
    let dep = snapshot.cell(DEP_CELL).unwrap();
    let root_main = root
        .entries
        .iter()
        .find(|e| e.key() == HashKey::plain("src/main.c"))
        .unwrap();
    let dep_main = dep
        .entries
        .iter()
        .find(|e| e.key() == HashKey::plain("src/main.c"))
        .unwrap();

    assert_eq!(
        root_main.hash,
        ContentHash::of_bytes(b"int main(void) { return helper(); }")
    );
    assert_eq!(dep_main.hash, ContentHash::of_bytes(b"int helper(void) { return 0; }"));
    assert!(root_main.contents.is_none());
}

#[test]
fn test_snapshot_records_containers_and_flags() {
    let tree = tree();
    let snapshot = record(&tree);
    let root = snapshot.cell(CellIndex::ROOT).unwrap();
    let find = |key: HashKey| root.entries.iter().find(|e| e.key() == key).unwrap();

    let assets = find(HashKey::plain("assets"));
    assert!(assets.is_directory);
    assert_eq!(assets.children, vec!["a.txt".to_string(), "b.txt".to_string()]);
    assert!(!find(HashKey::plain("assets/a.txt")).is_directory);

    let member = find(HashKey::archive_member("deps.tar", "pkg/A.class"));
    assert_eq!(member.hash, ContentHash::of_bytes(b"class A bytes"));
    assert!(!find(HashKey::plain("deps.tar")).is_directory);

    assert_eq!(find(HashKey::plain("src/util.h")).contents.as_deref(), Some(&b"#pragma"[..]));
    assert!(find(HashKey::plain("BUCK")).materialize_during_preloading);
    assert!(!find(HashKey::plain("src/main.c")).materialize_during_preloading);
}

// === Materialization Tests ===

#[test]
fn test_worker_rebuilds_inputs_lazily() {
    let tree = tree();
    let stacked = worker(&tree, record(&tree));

    assert_eq!(stacked.preload().unwrap(), 1);
    assert!(tree.worker.join("BUCK").exists());
    assert!(!tree.worker.join("src/main.c").exists());

    let hash = stacked
        .get(&InputPath::file(tree.worker.join("src/main.c")))
        .unwrap();
    assert_eq!(hash, ContentHash::of_bytes(b"int main(void) { return helper(); }"));
    assert_eq!(
        fs::read(tree.worker.join("src/main.c")).unwrap(),
        b"int main(void) { return helper(); }"
    );

    stacked
        .get(&InputPath::file(tree.worker_dep().join("src/main.c")))
        .unwrap();
    assert_eq!(
        fs::read(tree.worker_dep().join("src/main.c")).unwrap(),
        b"int helper(void) { return 0; }"
    );
}

#[test]
fn test_inline_contents_need_no_store() {
    let tree = tree();
    let stacked = worker(&tree, record(&tree));

    stacked
        .get(&InputPath::file(tree.worker.join("src/util.h")))
        .unwrap();
    assert_eq!(fs::read(tree.worker.join("src/util.h")).unwrap(), b"#pragma");
}

#[test]
fn test_directory_and_archive_member() {
    let tree = tree();
    let stacked = worker(&tree, record(&tree));

    stacked
        .get(&InputPath::file(tree.worker.join("assets")))
        .unwrap();
    assert_eq!(fs::read(tree.worker.join("assets/a.txt")).unwrap(), b"first asset");
    assert_eq!(fs::read(tree.worker.join("assets/b.txt")).unwrap(), b"second asset");

    let member = InputPath::archive_member(tree.worker.join("deps.tar"), "pkg/A.class");
    assert_eq!(
        stacked.get(&member).unwrap(),
        ContentHash::of_bytes(b"class A bytes")
    );
    assert_eq!(
        fs::read(tree.worker.join("deps.tar")).unwrap(),
        fs::read(tree.local.join("deps.tar")).unwrap()
    );
}

#[test]
fn test_materialization_is_idempotent() {
    let tree = tree();
    let stacked = worker(&tree, record(&tree));
    let input = InputPath::file(tree.worker.join("src/main.c"));

    let first = stacked.get(&input).unwrap();
    fs::remove_dir_all(&tree.store).unwrap();
    let second = stacked.get(&input).unwrap();

    assert_eq!(first, second);
    assert!(tree.worker.join("src/main.c").exists());
}

#[test]
fn test_stale_worker_file_is_replaced() {
    let tree = tree();
    write(&tree.worker.join("src/main.c"), b"left over from another build");
    let stacked = worker(&tree, record(&tree));

    stacked
        .get(&InputPath::file(tree.worker.join("src/main.c")))
        .unwrap();
    assert_eq!(
        fs::read(tree.worker.join("src/main.c")).unwrap(),
        b"int main(void) { return helper(); }"
    );
}

#[test]
fn test_unrecorded_input_is_not_materialized() {
    let tree = tree();
    let stacked = worker(&tree, record(&tree));
    let input = InputPath::file(tree.worker.join("src/never_recorded.c"));

    assert!(!stacked.will_get(&input));
    assert!(matches!(
        stacked.get(&input),
        Err(HashCacheError::NotRecorded { .. })
    ));
    assert!(!tree.worker.join("src/never_recorded.c").exists());
}
