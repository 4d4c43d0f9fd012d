//! Output directory transfer types.

use serde::{Deserialize, Serialize};

use super::logs::RunId;
use crate::error::RemoteError;

/// Request payload for `get_output_dirs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirRequest {
    pub run_ids: Vec<RunId>,
}

/// A worker's packaged output directory (a tar archive), or the error that replaced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDir {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

/// Response payload for `get_output_dirs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirResponse {
    pub output_dirs: Vec<OutputDir>,
}
