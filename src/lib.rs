// file: src/lib.rs
// description: library entry point and public api exports
// reference: rust library patterns
#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/readme.md"))]

pub mod bot;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extractor;
pub mod models;
pub mod pipeline;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod testing;

pub use bot::Dispatcher;
pub use chat::{ConsoleSink, InboundEvent, NotificationSink, TelegramBot};
pub use config::{Config, DriveConfig, ExtractorConfig, PipelineConfig, ProgressConfig, TelegramConfig};
pub use credentials::{AuthorizationCode, CredentialStore, GoogleOAuthClient, TokenProvider};
pub use error::{RelayError, Result};
pub use extractor::{ExtractionAdapter, MediaExtractor, YtDlpExtractor};
pub use models::{Credential, ErrorKind, ExtractedMedia, Job, JobState, RequesterId};
pub use pipeline::{CancelResult, Orchestrator, PipelineServices, ProgressRelay};
pub use storage::{DriveClient, ResumableStorage, UploadAdapter};
pub use utils::{HealthCheck, HealthReport, HealthStatus, OperationTimer, RetryPolicy, Validator};
