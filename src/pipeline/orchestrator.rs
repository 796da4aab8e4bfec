// file: src/pipeline/orchestrator.rs
// description: drives each transfer job from link to remote file and one final notification
// reference: orchestrates asynchronous transfer workflow, one task per job

use crate::chat::NotificationSink;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{RelayError, Result};
use crate::extractor::{ExtractionAdapter, MediaExtractor};
use crate::models::{ErrorKind, ExtractedMedia, Job, JobState, RequesterId, UploadResult};
use crate::pipeline::progress::ProgressRelay;
use crate::pipeline::registry::{ActiveJob, JobRegistry};
use crate::storage::{ResumableStorage, UploadAdapter, upload_metadata};
use crate::utils::RetryPolicy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// External collaborators of the pipeline.
pub struct PipelineServices {
    pub credentials: Arc<CredentialStore>,
    pub extractor: Arc<dyn MediaExtractor>,
    pub storage: Arc<dyn ResumableStorage>,
    pub sink: Arc<dyn NotificationSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    AuthorizationExpired,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    Cancelled,
    AuthorizationDiscarded,
    NotCancellable(JobState),
    NothingToCancel,
}

enum Outcome {
    Succeeded(UploadResult),
    Failed(RelayError),
    Cancelled(CancelReason),
}

enum Notification {
    Text(String),
    Photo(Vec<u8>, String),
    Video(Vec<u8>, String),
}

pub struct JobTicket {
    pub job_id: Uuid,
    pub handle: JoinHandle<Job>,
}

pub struct Orchestrator {
    config: Config,
    credentials: Arc<CredentialStore>,
    extraction: ExtractionAdapter,
    uploader: UploadAdapter,
    sink: Arc<dyn NotificationSink>,
    relay: ProgressRelay,
    registry: JobRegistry,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime; spawns the progress relay.
    pub fn new(config: Config, services: PipelineServices, shutdown: CancellationToken) -> Arc<Self> {
        let retry = RetryPolicy::from_config(&config.pipeline);
        let (relay, _relay_task) = ProgressRelay::spawn(Arc::clone(&services.sink), &config.progress);

        let extraction =
            ExtractionAdapter::new(services.extractor, config.extractor.clone(), retry.clone());
        let uploader = UploadAdapter::new(
            services.storage,
            Arc::clone(&services.credentials),
            config.drive.chunk_size_bytes(),
            retry,
        );

        Arc::new(Self {
            config,
            credentials: services.credentials,
            extraction,
            uploader,
            sink: services.sink,
            relay,
            registry: JobRegistry::new(),
            shutdown,
        })
    }

    /// Starts a job for the link unless the requester already has one.
    pub async fn submit(self: &Arc<Self>, requester: RequesterId, url: &str) -> Result<JobTicket> {
        let job = Job::new(requester, url);

        let cancel = match self.registry.try_register(requester, job.id) {
            Ok(cancel) => cancel,
            Err(err) => {
                info!(requester, "Rejected link while a transfer is active");
                if let RelayError::JobInProgress { state } = &err {
                    self.send(requester, &in_progress_message(*state)).await;
                }
                return Err(err);
            }
        };

        info!(job_id = %job.id, requester, "Job received");
        let job_id = job.id;
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.run(job, cancel).await });

        Ok(JobTicket { job_id, handle })
    }

    /// Only a job waiting for authorization can be cancelled by its requester.
    pub fn cancel(&self, requester: RequesterId) -> CancelResult {
        match self.registry.get(requester) {
            Some(active) if active.state == JobState::AwaitingAuthorization => {
                active.cancel.cancel();
                CancelResult::Cancelled
            }
            Some(active) => CancelResult::NotCancellable(active.state),
            None if self.credentials.cancel_authorization(requester) => {
                CancelResult::AuthorizationDiscarded
            }
            None => CancelResult::NothingToCancel,
        }
    }

    pub fn status(&self, requester: RequesterId) -> Option<ActiveJob> {
        self.registry.get(requester)
    }

    pub fn active_jobs(&self) -> usize {
        self.registry.len()
    }

    /// Waits for in-flight jobs to finish after shutdown was requested.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.registry.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("{} job(s) still active after {:?}", self.registry.len(), timeout);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Removes job directories left behind by a previous process.
    pub async fn sweep_stale_artifacts(&self) -> Result<usize> {
        let root = self.config.extractor.download_dir.clone();
        if !root.exists() {
            return Ok(0);
        }

        let active = self.registry.job_ids();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for entry in WalkDir::new(&root)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
            {
                let job_id = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| Uuid::parse_str(name).ok());
                match job_id {
                    Some(id) if !active.contains(&id) => {}
                    _ => continue,
                }

                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove stale {:?}: {}", entry.path(), e),
                }
            }
            removed
        })
        .await
        .map_err(|e| RelayError::Internal(format!("sweep task failed: {}", e)))?;

        if removed > 0 {
            info!("Removed {} stale job director(ies)", removed);
        }
        Ok(removed)
    }

    fn workdir(&self, job_id: Uuid) -> PathBuf {
        self.config.extractor.download_dir.join(job_id.to_string())
    }

    async fn run(self: Arc<Self>, mut job: Job, cancel: CancellationToken) -> Job {
        let workdir = self.workdir(job.id);
        let mut guard = JobGuard::new(Arc::clone(&self), &job, workdir.clone());

        let outcome = self.advance(&mut job, &workdir, &cancel).await;
        self.finalize(&mut job, outcome, &mut guard).await;
        job
    }

    async fn advance(&self, job: &mut Job, workdir: &Path, cancel: &CancellationToken) -> Outcome {
        if let Err(err) = self.extraction.validate(&job.source_url) {
            return Outcome::Failed(err);
        }

        // subscribed first so an install racing the failed check still wakes the wait
        let generation = self.credentials.subscribe();
        match self.credentials.ensure_valid().await {
            Ok(_) => {}
            Err(err) if err.requires_authorization() => {
                if let Err(outcome) = self.await_authorization(job, cancel, generation).await {
                    return outcome;
                }
            }
            Err(err) => return Outcome::Failed(err),
        }

        let media = match self.download(job, workdir).await {
            Ok(media) => media,
            Err(outcome) => return outcome,
        };

        let limit = self.config.pipeline.max_artifact_bytes();
        let size = media.size_bytes;
        job.attach_artifact(media.clone());
        if size > limit {
            return Outcome::Failed(RelayError::ArtifactTooLarge {
                size_bytes: size,
                limit_bytes: limit,
            });
        }

        match self.upload(job, &media).await {
            Ok(result) => Outcome::Succeeded(result),
            Err(outcome) => outcome,
        }
    }

    async fn await_authorization(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
        mut generation: watch::Receiver<u64>,
    ) -> std::result::Result<(), Outcome> {
        self.enter(job, JobState::AwaitingAuthorization)
            .map_err(Outcome::Failed)?;

        let requester = job.requester_id;
        let url = self.credentials.begin_authorization(requester);
        let ttl = self.config.pipeline.authorization_ttl();
        self.notify(job, &authorization_message(&url, ttl)).await;

        let resumed = tokio::select! {
            changed = generation.changed() => changed.is_ok(),
            _ = tokio::time::sleep(ttl) => {
                self.credentials.cancel_authorization(requester);
                return Err(Outcome::Cancelled(CancelReason::AuthorizationExpired));
            }
            _ = cancel.cancelled() => {
                self.credentials.cancel_authorization(requester);
                return Err(Outcome::Cancelled(CancelReason::Requested));
            }
            _ = self.shutdown.cancelled() => {
                return Err(Outcome::Cancelled(CancelReason::Shutdown));
            }
        };

        if !resumed {
            return Err(Outcome::Cancelled(CancelReason::Shutdown));
        }
        if cancel.is_cancelled() {
            return Err(Outcome::Cancelled(CancelReason::Requested));
        }

        // completed by someone else's exchange or a refresh
        self.credentials.cancel_authorization(requester);
        info!(job_id = %job.id, requester, "Authorization available, resuming");
        Ok(())
    }

    async fn download(
        &self,
        job: &mut Job,
        workdir: &Path,
    ) -> std::result::Result<ExtractedMedia, Outcome> {
        self.enter(job, JobState::Downloading)
            .map_err(Outcome::Failed)?;
        self.notify(job, "📥 Downloading your video…").await;

        let progress = self.relay.sender(job.id, job.requester_id);
        let mut attempt = 0;
        let result = tokio::select! {
            result = self.extraction.download(&job.source_url, workdir, &progress, &mut attempt) => result,
            _ = self.shutdown.cancelled() => {
                return Err(Outcome::Cancelled(CancelReason::Shutdown));
            }
        };

        job.attempt = attempt;
        self.registry
            .update(job.requester_id, job.id, job.state, job.attempt);
        debug!(job_id = %job.id, attempt, "Download phase finished");
        result.map_err(Outcome::Failed)
    }

    async fn upload(
        &self,
        job: &mut Job,
        media: &ExtractedMedia,
    ) -> std::result::Result<UploadResult, Outcome> {
        self.enter(job, JobState::Uploading)
            .map_err(Outcome::Failed)?;
        self.notify(
            job,
            &format!(
                "☁️ Uploading \"{}\" ({:.1} MB) to Google Drive…",
                media.title,
                media.size_mb()
            ),
        )
        .await;

        let metadata = upload_metadata(&self.config.drive, media);
        let progress = self.relay.sender(job.id, job.requester_id);
        let mut attempt = 0;
        let result = tokio::select! {
            result = self.uploader.upload(&media.local_path, &metadata, &progress, &mut attempt) => result,
            _ = self.shutdown.cancelled() => {
                return Err(Outcome::Cancelled(CancelReason::Shutdown));
            }
        };

        job.attempt = attempt;
        self.registry
            .update(job.requester_id, job.id, job.state, job.attempt);
        result.map_err(Outcome::Failed)
    }

    fn enter(&self, job: &mut Job, state: JobState) -> Result<()> {
        job.transition(state)?;
        self.registry
            .update(job.requester_id, job.id, job.state, job.attempt);
        info!(job_id = %job.id, requester = job.requester_id, state = %state, "Job state changed");
        Ok(())
    }

    async fn finalize(&self, job: &mut Job, outcome: Outcome, guard: &mut JobGuard) {
        self.relay.settle(job.id).await;

        let notification = match outcome {
            Outcome::Succeeded(result) => {
                let caption = success_caption(job, &result);
                if let Err(e) = job.succeed(result) {
                    error!(job_id = %job.id, "Cannot record success: {}", e);
                }
                self.success_notification(job, caption).await
            }
            Outcome::Failed(err) => {
                warn!(job_id = %job.id, kind = ?err.kind(), "Job failed: {}", err);
                if let Err(e) = job.fail(&err) {
                    error!(job_id = %job.id, "Cannot record failure: {}", e);
                }
                Notification::Text(failure_message(&err))
            }
            Outcome::Cancelled(reason) => {
                if let Err(e) = job.cancel() {
                    error!(job_id = %job.id, "Cannot record cancellation: {}", e);
                }
                Notification::Text(cancel_message(reason).to_string())
            }
        };

        guard.release().await;
        self.deliver(job.requester_id, notification).await;

        info!(
            job_id = %job.id,
            requester = job.requester_id,
            state = %job.state,
            attempt = job.attempt,
            "Job finished"
        );
    }

    async fn success_notification(&self, job: &Job, caption: String) -> Notification {
        let Some(media) = &job.artifact else {
            return Notification::Text(caption);
        };

        if let Some(thumbnail) = &media.thumbnail_path {
            match fs::read(thumbnail).await {
                Ok(bytes) => return Notification::Photo(bytes, caption),
                Err(e) => debug!("Thumbnail unreadable, sending text: {}", e),
            }
        }

        let video_limit = self.config.pipeline.send_video_max_mb * 1_048_576;
        if video_limit > 0 && media.size_bytes <= video_limit {
            match fs::read(&media.local_path).await {
                Ok(bytes) => return Notification::Video(bytes, caption),
                Err(e) => debug!("Video unreadable, sending text: {}", e),
            }
        }

        Notification::Text(caption)
    }

    async fn deliver(&self, requester: RequesterId, notification: Notification) {
        let (attachment, caption) = match notification {
            Notification::Text(text) => {
                self.send(requester, &text).await;
                return;
            }
            Notification::Photo(bytes, caption) => {
                (self.sink.send_photo(requester, bytes, &caption).await, caption)
            }
            Notification::Video(bytes, caption) => {
                (self.sink.send_video(requester, bytes, &caption).await, caption)
            }
        };

        if let Err(e) = attachment {
            warn!(requester, "Attachment delivery failed, sending text: {}", e);
            self.send(requester, &caption).await;
        }
    }

    /// Phase notification; earlier progress for the job is settled first.
    async fn notify(&self, job: &Job, text: &str) {
        self.relay.settle(job.id).await;
        self.send(job.requester_id, text).await;
    }

    async fn send(&self, requester: RequesterId, text: &str) {
        if let Err(e) = self.sink.send_text(requester, text).await {
            warn!(requester, "Notification failed: {}", e);
        }
    }
}

/// Owns a job's artifact directory and registry slot. Released explicitly on
/// completion; dropping it unreleased (panic or task abort) cleans up synchronously.
struct JobGuard {
    orchestrator: Arc<Orchestrator>,
    requester: RequesterId,
    job_id: Uuid,
    workdir: PathBuf,
    armed: bool,
}

impl JobGuard {
    fn new(orchestrator: Arc<Orchestrator>, job: &Job, workdir: PathBuf) -> Self {
        Self {
            orchestrator,
            requester: job.requester_id,
            job_id: job.id,
            workdir,
            armed: true,
        }
    }

    async fn release(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        match fs::remove_dir_all(&self.workdir).await {
            Ok(()) => debug!("Removed artifacts at {:?}", self.workdir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {:?}: {}", self.workdir, e),
        }
        self.orchestrator.registry.remove(self.requester, self.job_id);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!(job_id = %self.job_id, "Job task ended abnormally, cleaning up");
        if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {:?}: {}", self.workdir, e);
            }
        }
        self.orchestrator.registry.remove(self.requester, self.job_id);
    }
}

fn in_progress_message(state: JobState) -> String {
    let phase = match state {
        JobState::AwaitingAuthorization => "waiting for Google Drive authorization",
        JobState::Downloading => "downloading",
        JobState::Uploading => "uploading",
        _ => "starting",
    };
    format!(
        "⏳ A transfer is already in progress ({}). Please wait for it to finish.",
        phase
    )
}

fn authorization_message(url: &str, ttl: Duration) -> String {
    format!(
        "🔑 Google Drive access is needed before I can upload.\n\n\
         1. Open this link and allow access:\n{}\n\n\
         2. Send me the code (or the whole address you were redirected to).\n\n\
         The link expires in {} minutes. Send /cancel to give up.",
        url,
        ttl.as_secs().div_ceil(60)
    )
}

fn success_caption(job: &Job, result: &UploadResult) -> String {
    let title = job.title().unwrap_or("Your video");
    let size = job.artifact.as_ref().map(|a| a.size_mb()).unwrap_or(0.0);
    format!(
        "✅ Uploaded to Google Drive\n🎬 {}\n📦 {:.1} MB\n🔗 {}",
        title, size, result.remote_link
    )
}

fn failure_message(err: &RelayError) -> String {
    match err.kind() {
        ErrorKind::InvalidInput => {
            "❌ That doesn't look like a supported YouTube video link.".to_string()
        }
        ErrorKind::AuthorizationRequired => {
            "🔑 Google Drive access was lost. Send /auth to reconnect, then send the link again."
                .to_string()
        }
        ErrorKind::InvalidAuthorizationCode => {
            "❌ Google rejected the authorization code. Send /auth to try again.".to_string()
        }
        ErrorKind::DownloadError => format!("❌ Download failed: {}", short_reason(err)),
        ErrorKind::UploadError => {
            format!("❌ Upload to Google Drive failed: {}", short_reason(err))
        }
        ErrorKind::ArtifactTooLarge => match err {
            RelayError::ArtifactTooLarge {
                size_bytes,
                limit_bytes,
            } => format!(
                "❌ The video is {:.1} MB, above the {:.0} MB limit.",
                *size_bytes as f64 / 1_048_576.0,
                *limit_bytes as f64 / 1_048_576.0
            ),
            _ => "❌ The video is too large.".to_string(),
        },
        ErrorKind::InternalError => "❌ Something went wrong. Please try again later.".to_string(),
    }
}

fn short_reason(err: &RelayError) -> String {
    let text = match err {
        RelayError::Download { message, .. } | RelayError::Upload { message, .. } => {
            message.as_str()
        }
        _ => return err.to_string(),
    };
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or(text)
        .trim();
    crate::utils::Validator::truncate_text(line, 300)
}

fn cancel_message(reason: CancelReason) -> &'static str {
    match reason {
        CancelReason::Requested => "🛑 Transfer cancelled.",
        CancelReason::AuthorizationExpired => {
            "⌛ Authorization timed out. Send the link again when you're ready."
        }
        CancelReason::Shutdown => "🛑 Transfer cancelled: the bot is shutting down.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AuthorizationCode;
    use crate::testing::{
        DeliveryKind, RecordingSink, ScriptedExtractor, ScriptedStorage, authorized_store,
        revoked_store, unauthorized_store,
    };
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const REQUESTER: RequesterId = 11;
    const LINK: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        sink: Arc<RecordingSink>,
        extractor: Arc<ScriptedExtractor>,
        storage: Arc<ScriptedStorage>,
        credentials: Arc<CredentialStore>,
        shutdown: CancellationToken,
        downloads: PathBuf,
        _temp: TempDir,
    }

    enum Auth {
        Valid,
        Missing,
        Revoked,
    }

    async fn harness(
        extractor: ScriptedExtractor,
        storage: ScriptedStorage,
        authorized: bool,
        tweak: impl FnOnce(&mut Config),
    ) -> Harness {
        let auth = if authorized { Auth::Valid } else { Auth::Missing };
        harness_with(extractor, storage, auth, tweak).await
    }

    async fn harness_with(
        extractor: ScriptedExtractor,
        storage: ScriptedStorage,
        auth: Auth,
        tweak: impl FnOnce(&mut Config),
    ) -> Harness {
        let temp = TempDir::new().unwrap();
        let downloads = temp.path().join("downloads");

        let mut config = Config::default_config();
        config.extractor.download_dir = downloads.clone();
        config.drive.chunk_size_kb = 256;
        config.pipeline.backoff_base_ms = 5;
        config.pipeline.backoff_max_ms = 20;
        config.progress.min_interval_ms = 10;
        tweak(&mut config);

        let credentials = match auth {
            Auth::Valid => authorized_store(temp.path()).await,
            Auth::Missing => unauthorized_store(temp.path()).await,
            Auth::Revoked => revoked_store(temp.path()).await,
        };
        let sink = Arc::new(RecordingSink::new());
        let extractor = Arc::new(extractor);
        let storage = Arc::new(storage);
        let shutdown = CancellationToken::new();

        let orchestrator = Orchestrator::new(
            config,
            PipelineServices {
                credentials: credentials.clone(),
                extractor: extractor.clone(),
                storage: storage.clone(),
                sink: sink.clone(),
            },
            shutdown.clone(),
        );

        Harness {
            orchestrator,
            sink,
            extractor,
            storage,
            credentials,
            shutdown,
            downloads,
            _temp: temp,
        }
    }

    fn leftover_files(root: &Path) -> Vec<PathBuf> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_successful_job_leaves_no_artifact() {
        let h = harness(
            ScriptedExtractor::succeeding(300_000).with_thumbnail(),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let ticket = h.orchestrator.submit(REQUESTER, LINK).await.unwrap();
        let job = ticket.handle.await.unwrap();

        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.remote_link(), Some("https://drive.test/file/remote-1"));
        assert_eq!(h.storage.received().len(), 300_000);
        assert_eq!(h.storage.last_metadata().unwrap().name, "Scripted Clip.mp4");

        let deliveries = h.sink.deliveries(REQUESTER);
        let last = deliveries.last().unwrap();
        assert_eq!(last.kind, DeliveryKind::Photo);
        assert!(last.text.contains("https://drive.test/file/remote-1"));
        assert_eq!(
            deliveries
                .iter()
                .filter(|d| d.kind == DeliveryKind::Photo)
                .count(),
            1
        );

        assert!(leftover_files(&h.downloads).is_empty());
        assert!(h.orchestrator.status(REQUESTER).is_none());
    }

    #[tokio::test]
    async fn test_oversized_artifact_is_never_uploaded() {
        let h = harness(
            ScriptedExtractor::succeeding(75 * 1_048_576),
            ScriptedStorage::new(),
            true,
            |config| config.pipeline.max_artifact_size_mb = 50,
        )
        .await;

        let job = h
            .orchestrator
            .submit(REQUESTER, LINK)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.last_error.as_ref().unwrap().kind,
            ErrorKind::ArtifactTooLarge
        );
        assert_eq!(h.storage.sessions_created(), 0);
        assert!(h.storage.chunk_offsets().is_empty());
        assert!(leftover_files(&h.downloads).is_empty());

        let last = h.sink.texts(REQUESTER).pop().unwrap();
        assert!(last.contains("75.0 MB"), "{}", last);
    }

    #[tokio::test]
    async fn test_transient_download_failures_then_upload() {
        let h = harness(
            ScriptedExtractor::succeeding(1024)
                .then_fail_first(&["HTTP Error 503", "Connection reset by peer"]),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let job = h
            .orchestrator
            .submit(REQUESTER, LINK)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(h.extractor.calls(), 3);
        assert_eq!(h.storage.sessions_created(), 1);
        assert_eq!(job.state, JobState::Succeeded);

        // retries are silent: exactly one download and one upload announcement
        let texts = h.sink.texts(REQUESTER);
        assert_eq!(texts.iter().filter(|t| t.starts_with("📥")).count(), 1);
        assert_eq!(texts.iter().filter(|t| t.starts_with("☁️")).count(), 1);
    }

    #[tokio::test]
    async fn test_download_attempts_exhausted() {
        let h = harness(
            ScriptedExtractor::succeeding(1024).then_fail_first(&[
                "Read timed out",
                "Read timed out",
                "Read timed out",
            ]),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let job = h
            .orchestrator
            .submit(REQUESTER, LINK)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt, 3);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::DownloadError);
        assert_eq!(h.storage.sessions_created(), 0);
        assert!(leftover_files(&h.downloads).is_empty());
    }

    #[tokio::test]
    async fn test_upload_attempts_exhausted() {
        let h = harness(
            ScriptedExtractor::succeeding(4096),
            ScriptedStorage::new().stalling(),
            true,
            |_| {},
        )
        .await;

        let job = h
            .orchestrator
            .submit(REQUESTER, LINK)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt, 3);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::UploadError);
        assert_eq!(h.storage.sessions_created(), 1);
        assert_eq!(h.storage.chunk_offsets(), vec![0, 0, 0]);
        assert!(leftover_files(&h.downloads).is_empty());
        assert!(h.orchestrator.status(REQUESTER).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_during_upload_cleans_up() {
        let h = harness(
            ScriptedExtractor::succeeding(4096),
            ScriptedStorage::new().hanging(),
            true,
            |_| {},
        )
        .await;

        let ticket = h.orchestrator.submit(REQUESTER, LINK).await.unwrap();
        let storage = h.storage.clone();
        wait_until(|| storage.chunk_offsets().len() == 1).await;

        assert_eq!(
            h.orchestrator.cancel(REQUESTER),
            CancelResult::NotCancellable(JobState::Uploading)
        );

        h.shutdown.cancel();
        let job = ticket.handle.await.unwrap();

        assert_eq!(job.state, JobState::Cancelled);
        assert!(leftover_files(&h.downloads).is_empty());
        assert!(h.orchestrator.drain(Duration::from_secs(1)).await);
        assert!(h.sink.texts(REQUESTER).pop().unwrap().contains("shutting down"));
    }

    #[tokio::test]
    async fn test_revoked_refresh_waits_for_authorization() {
        let h = harness_with(
            ScriptedExtractor::succeeding(2048),
            ScriptedStorage::new(),
            Auth::Revoked,
            |_| {},
        )
        .await;

        let ticket = h.orchestrator.submit(REQUESTER, LINK).await.unwrap();
        let credentials = h.credentials.clone();
        wait_until(|| credentials.has_pending_authorization(REQUESTER)).await;

        assert_eq!(
            h.orchestrator.status(REQUESTER).unwrap().state,
            JobState::AwaitingAuthorization
        );
        assert!(h.credentials.get().await.is_err());
        assert_eq!(h.extractor.calls(), 0);

        h.credentials
            .complete_authorization(REQUESTER, &AuthorizationCode::bare("4/reapproved"))
            .await
            .unwrap();

        let job = ticket.handle.await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(h.storage.received().len(), 2048);
    }

    #[tokio::test]
    async fn test_credential_installed_before_wait_resumes_immediately() {
        let h = harness(
            ScriptedExtractor::succeeding(10),
            ScriptedStorage::new(),
            false,
            |_| {},
        )
        .await;

        let generation = h.credentials.subscribe();
        assert!(h.credentials.ensure_valid().await.unwrap_err().requires_authorization());

        // another requester finishes authorizing before this job starts waiting
        h.credentials.begin_authorization(99);
        h.credentials
            .complete_authorization(99, &AuthorizationCode::bare("4/other-requester"))
            .await
            .unwrap();

        let mut job = Job::new(REQUESTER, LINK);
        let cancel = CancellationToken::new();
        let waited = tokio::time::timeout(
            Duration::from_secs(1),
            h.orchestrator.await_authorization(&mut job, &cancel, generation),
        )
        .await
        .expect("installed credential must end the wait");

        assert!(waited.is_ok());
        assert_eq!(job.state, JobState::AwaitingAuthorization);
        assert!(!h.credentials.has_pending_authorization(REQUESTER));
    }

    #[tokio::test]
    async fn test_unsupported_link_fails_without_download() {
        let h = harness(
            ScriptedExtractor::succeeding(10),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let job = h
            .orchestrator
            .submit(REQUESTER, "https://vimeo.com/123456")
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::InvalidInput);
        assert_eq!(h.extractor.calls(), 0);
        assert_eq!(h.sink.texts(REQUESTER).len(), 1);
    }

    #[tokio::test]
    async fn test_job_resumes_after_authorization() {
        let h = harness(
            ScriptedExtractor::succeeding(2048),
            ScriptedStorage::new(),
            false,
            |_| {},
        )
        .await;

        let ticket = h.orchestrator.submit(REQUESTER, LINK).await.unwrap();
        let credentials = h.credentials.clone();
        wait_until(|| credentials.has_pending_authorization(REQUESTER)).await;

        assert_eq!(
            h.orchestrator.status(REQUESTER).unwrap().state,
            JobState::AwaitingAuthorization
        );
        assert!(
            h.sink
                .texts(REQUESTER)
                .iter()
                .any(|t| t.contains("https://auth.test/authorize"))
        );

        h.credentials
            .complete_authorization(REQUESTER, &AuthorizationCode::bare("4/approved"))
            .await
            .unwrap();

        let job = ticket.handle.await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(!h.credentials.has_pending_authorization(REQUESTER));
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_authorization() {
        let h = harness(
            ScriptedExtractor::succeeding(10),
            ScriptedStorage::new(),
            false,
            |_| {},
        )
        .await;

        let ticket = h.orchestrator.submit(REQUESTER, LINK).await.unwrap();
        let credentials = h.credentials.clone();
        wait_until(|| credentials.has_pending_authorization(REQUESTER)).await;

        assert_eq!(h.orchestrator.cancel(REQUESTER), CancelResult::Cancelled);
        let job = ticket.handle.await.unwrap();

        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(h.extractor.calls(), 0);
        assert!(!h.credentials.has_pending_authorization(REQUESTER));
        assert_eq!(h.sink.texts(REQUESTER).pop().unwrap(), "🛑 Transfer cancelled.");
        assert_eq!(h.orchestrator.cancel(REQUESTER), CancelResult::NothingToCancel);
    }

    #[tokio::test]
    async fn test_authorization_timeout_cancels_job() {
        let h = harness(
            ScriptedExtractor::succeeding(10),
            ScriptedStorage::new(),
            false,
            |config| config.pipeline.authorization_ttl_secs = 1,
        )
        .await;

        let job = h
            .orchestrator
            .submit(REQUESTER, LINK)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Cancelled);
        assert!(h.sink.texts(REQUESTER).pop().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_second_link_is_rejected_while_active() {
        let h = harness(
            ScriptedExtractor::succeeding(10).hanging(),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let first = h.orchestrator.submit(REQUESTER, LINK).await.unwrap();
        let extractor = h.extractor.clone();
        wait_until(|| extractor.calls() == 1).await;

        let second = h.orchestrator.submit(REQUESTER, LINK).await;
        assert!(matches!(
            second,
            Err(RelayError::JobInProgress {
                state: JobState::Downloading
            })
        ));
        assert!(
            h.sink
                .texts(REQUESTER)
                .iter()
                .any(|t| t.contains("already in progress"))
        );
        assert_eq!(h.extractor.calls(), 1);
        assert_eq!(
            h.orchestrator.cancel(REQUESTER),
            CancelResult::NotCancellable(JobState::Downloading)
        );

        h.shutdown.cancel();
        let job = first.handle.await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_during_download_cleans_up() {
        let h = harness(
            ScriptedExtractor::succeeding(10).hanging(),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let ticket = h.orchestrator.submit(REQUESTER, LINK).await.unwrap();
        let extractor = h.extractor.clone();
        wait_until(|| extractor.calls() == 1).await;
        std::fs::write(h.downloads.join(ticket.job_id.to_string()).join("partial.part"), b"x")
            .unwrap();

        h.shutdown.cancel();
        let job = ticket.handle.await.unwrap();

        assert_eq!(job.state, JobState::Cancelled);
        assert!(leftover_files(&h.downloads).is_empty());
        assert!(h.orchestrator.drain(Duration::from_secs(1)).await);
        assert!(h.sink.texts(REQUESTER).pop().unwrap().contains("shutting down"));
    }

    #[tokio::test]
    async fn test_concurrent_requesters_run_independently() {
        let h = harness(
            ScriptedExtractor::succeeding(4096),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let a = h.orchestrator.submit(1, LINK).await.unwrap();
        let b = h.orchestrator.submit(2, "https://youtu.be/dQw4w9WgXcQ").await;
        let b = b.unwrap();

        let (a, b) = (a.handle.await.unwrap(), b.handle.await.unwrap());
        assert!(a.state.is_terminal());
        assert!(b.state.is_terminal());
        assert_eq!(h.orchestrator.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_job_directories() {
        let h = harness(
            ScriptedExtractor::succeeding(10),
            ScriptedStorage::new(),
            true,
            |_| {},
        )
        .await;

        let stale = h.downloads.join(Uuid::new_v4().to_string());
        let other = h.downloads.join("keep-me");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(stale.join("video.mp4.part"), b"partial").unwrap();

        assert_eq!(h.orchestrator.sweep_stale_artifacts().await.unwrap(), 1);
        assert!(!stale.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_failure_messages() {
        let too_large = RelayError::ArtifactTooLarge {
            size_bytes: 75 * 1_048_576,
            limit_bytes: 50 * 1_048_576,
        };
        assert_eq!(
            failure_message(&too_large),
            "❌ The video is 75.0 MB, above the 50 MB limit."
        );

        let download = RelayError::download("WARNING: x\nERROR: Private video\n", false);
        assert_eq!(
            failure_message(&download),
            "❌ Download failed: ERROR: Private video"
        );
    }
}
