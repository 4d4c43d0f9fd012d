//! RCH Worker Entrypoint
//!
//! Usage: rch-worker preload <snapshot.json> <store-dir> <cell-root>...
//!
//! Loads a file hash snapshot, maps each cell index to the given roots in
//! order (the first root is the root cell), and materializes every entry
//! flagged for preloading from the content store.

use rch_protocol::ops::HashSnapshot;
use rch_protocol::CellRoots;
use rch_worker::{ContentStore, StackedHashCache, WorkerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn usage() -> ExitCode {
    eprintln!("Usage: rch-worker preload [--all] <snapshot.json> <store-dir> <cell-root>...");
    eprintln!();
    eprintln!("Materializes snapshot entries flagged for preloading (every entry with --all).");
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) != Some("preload") {
        return usage();
    }

    let mut config = WorkerConfig::default();
    let mut positional = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "--all" => config.preload_all = true,
            "--no-verify" => config.verify_materialized = false,
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    if positional.len() < 3 {
        return usage();
    }

    let snapshot = match HashSnapshot::read_from_file(&positional[0]) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("Failed to read snapshot {}: {}", positional[0].display(), e);
            return ExitCode::FAILURE;
        }
    };
    let store = match ContentStore::new(&positional[1]) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open store {}: {}", positional[1].display(), e);
            return ExitCode::FAILURE;
        }
    };
    let roots = CellRoots::from_roots(positional[2..].iter().cloned());

    let stacked = match StackedHashCache::from_snapshot(snapshot, roots, Arc::new(store), config) {
        Ok(stacked) => stacked,
        Err(e) => {
            eprintln!("Invalid snapshot layout: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match stacked.preload() {
        Ok(count) => {
            println!("preloaded {} entries", count);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Preload failed ({}): {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}
