// file: src/models/media.rs
// description: media artifacts flowing between the extractor and storage
// reference: media transfer pipeline data structures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of a finished extraction. The file at `local_path` belongs to the
/// job that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMedia {
    pub local_path: PathBuf,
    pub title: String,
    pub duration_seconds: Option<f64>,
    pub size_bytes: u64,
    pub thumbnail_path: Option<PathBuf>,
}

impl ExtractedMedia {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1_048_576.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub name: String,
    pub mime_type: String,
    pub parent_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub remote_id: String,
    pub remote_link: String,
    pub bytes_sent: u64,
}
