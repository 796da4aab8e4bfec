// file: src/models/mod.rs
// description: data models module exports
// reference: internal module structure

pub mod credential;
pub mod job;
pub mod media;

pub use credential::Credential;
pub use job::{ErrorKind, Job, JobError, JobState, RequesterId};
pub use media::{ExtractedMedia, UploadMetadata, UploadResult};
