//! RCH Distributed Build Worker
//!
//! Remote side of the file hash snapshot: answers hash lookups from the
//! snapshot the orchestrator recorded and materializes file bytes lazily
//! through a pluggable content provider.
//!
//! This crate can be used in two modes:
//! - **Standalone binary**: `rch-worker preload` before a build starts
//! - **In-process library**: embedded in a build engine's executor

pub mod config;
pub mod content_store;
pub mod error;
pub mod hash_cache;
pub mod materializer;
pub mod provider;
pub mod stacked;

pub use config::WorkerConfig;
pub use content_store::ContentStore;
pub use error::HashCacheError;
pub use hash_cache::{FileHashCache, RemoteHashCache};
pub use materializer::{Materialized, Materializer};
pub use provider::{ContentError, ContentProvider};
pub use stacked::StackedHashCache;
