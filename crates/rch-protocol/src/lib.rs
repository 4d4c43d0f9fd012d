//! RCH Distributed Build Protocol Types
//!
//! Wire-level types shared by the orchestrator and remote workers: the
//! checksummed artifact cache codec, cell-aware file hash snapshots, and
//! the log/output-directory payloads pulled back from workers.

pub mod cache;
pub mod cells;
pub mod checksum;
pub mod error;
pub mod hash;
pub mod ops;

pub use cache::{
    read_fetch_response, read_store_request, ArtifactInfo, ByteSource, DecodedArtifact,
    FetchResponse, RuleKey, StoreRequest, MAX_METADATA_HEADER_SIZE,
};
pub use cells::{CellIndex, CellRoots, HashKey, InputPath, ResolvedInput};
pub use error::{ErrorCode, ErrorKind, ProtocolError, RemoteError};
pub use hash::ContentHash;

/// Protocol version spoken on the orchestrator/worker channel.
pub const PROTOCOL_VERSION: i32 = 1;
