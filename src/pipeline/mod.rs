// file: src/pipeline/mod.rs
// description: job orchestration, progress relay and active job registry
// reference: internal module structure

pub mod orchestrator;
pub mod progress;
pub mod registry;

pub use orchestrator::{CancelReason, CancelResult, JobTicket, Orchestrator, PipelineServices};
pub use progress::{DownloadProgressFn, ProgressEvent, ProgressRelay, ProgressSender, RelayStats};
pub use registry::{ActiveJob, JobRegistry};
