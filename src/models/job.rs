// file: src/models/job.rs
// description: transfer job model and its state machine
// reference: media transfer pipeline lifecycle

use crate::error::{RelayError, Result};
use crate::models::media::{ExtractedMedia, UploadResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Chat identifier of whoever sent the link.
pub type RequesterId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Received,
    AwaitingAuthorization,
    Downloading,
    Uploading,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Received => "received",
            JobState::AwaitingAuthorization => "awaiting_authorization",
            JobState::Downloading => "downloading",
            JobState::Uploading => "uploading",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Edges of the pipeline state machine. Self-loops on the transfer
    /// states are retries.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        match (self, next) {
            (Received, Failed | AwaitingAuthorization | Downloading | Cancelled) => true,
            (AwaitingAuthorization, Downloading | Cancelled) => true,
            (Downloading, Downloading | Uploading | Failed | Cancelled) => true,
            (Uploading, Uploading | Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    AuthorizationRequired,
    InvalidAuthorizationCode,
    DownloadError,
    UploadError,
    ArtifactTooLarge,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&RelayError> for JobError {
    fn from(err: &RelayError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub requester_id: RequesterId,
    pub state: JobState,
    pub source_url: String,
    pub artifact: Option<ExtractedMedia>,
    pub remote: Option<UploadResult>,
    pub last_error: Option<JobError>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(requester_id: RequesterId, source_url: impl Into<String>) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            requester_id,
            state: JobState::Received,
            source_url: source_url.into().trim().to_string(),
            artifact: None,
            remote: None,
            last_error: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::Internal(format!(
                "illegal job transition {} -> {}",
                self.state, next
            )));
        }

        // a new phase gets a fresh attempt budget; terminal states keep the
        // count of the phase that ended the job
        if next != self.state && !next.is_terminal() {
            self.attempt = 0;
        }

        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn attach_artifact(&mut self, media: ExtractedMedia) {
        self.artifact = Some(media);
        self.updated_at = Utc::now();
    }

    pub fn succeed(&mut self, result: UploadResult) -> Result<()> {
        self.transition(JobState::Succeeded)?;
        self.remote = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, err: &RelayError) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.last_error = Some(JobError::from(err));
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(JobState::Cancelled)
    }

    pub fn title(&self) -> Option<&str> {
        self.artifact.as_ref().map(|a| a.title.as_str())
    }

    pub fn remote_link(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.remote_link.as_str())
    }
}
