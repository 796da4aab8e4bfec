// file: src/error.rs
// description: Custom error types and result type aliases
// reference: https://docs.rs/thiserror

use crate::models::{ErrorKind, JobState};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported or malformed link: {0}")]
    InvalidInput(String),

    #[error("Google Drive authorization required")]
    AuthorizationRequired,

    #[error("Authorization code rejected: {0}")]
    InvalidAuthorizationCode(String),

    #[error("No pending authorization for this chat")]
    NoPendingAuthorization,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Download failed: {message}")]
    Download { message: String, transient: bool },

    #[error("Upload failed: {message}")]
    Upload { message: String, retryable: bool },

    #[error("Artifact is {size_bytes} bytes, limit is {limit_bytes} bytes")]
    ArtifactTooLarge { size_bytes: u64, limit_bytes: u64 },

    #[error("A transfer is already in progress ({state})")]
    JobInProgress { state: JobState },

    #[error("Chat transport error: {0}")]
    Chat(String),

    #[error("File operation failed for {path}: {source}")]
    FileOperation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn download(message: impl Into<String>, transient: bool) -> Self {
        Self::Download {
            message: message.into(),
            transient,
        }
    }

    pub fn upload(message: impl Into<String>, retryable: bool) -> Self {
        Self::Upload {
            message: message.into(),
            retryable,
        }
    }

    /// Maps the error onto the kind recorded on a failed job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::AuthorizationRequired | Self::NoPendingAuthorization | Self::RefreshFailed(_) => {
                ErrorKind::AuthorizationRequired
            }
            Self::InvalidAuthorizationCode(_) => ErrorKind::InvalidAuthorizationCode,
            Self::Download { .. } => ErrorKind::DownloadError,
            Self::Upload { .. } => ErrorKind::UploadError,
            Self::ArtifactTooLarge { .. } => ErrorKind::ArtifactTooLarge,
            _ => ErrorKind::InternalError,
        }
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Download { transient, .. } => *transient,
            Self::Upload { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Whether the requester must (re-)authorize before the job can proceed.
    pub fn requires_authorization(&self) -> bool {
        matches!(self, Self::AuthorizationRequired | Self::RefreshFailed(_))
    }

    pub fn file_operation(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileOperation {
            path: path.into(),
            source,
        }
    }
}
