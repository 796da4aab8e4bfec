// file: src/storage/uploader.rs
// description: chunked resumable upload with offset recovery after transient failures
// reference: retry-with-backoff over a resumable upload session

use crate::config::DriveConfig;
use crate::credentials::CredentialStore;
use crate::error::{RelayError, Result};
use crate::models::{ExtractedMedia, UploadMetadata, UploadResult};
use crate::pipeline::progress::{ProgressEvent, ProgressSender};
use crate::utils::{OperationTimer, Validator};
use crate::utils::retry::{RetryPolicy, retry_with_backoff};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Handle to one server-side upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub uri: String,
}

/// Remote object created when the last byte is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Server has persisted `acknowledged` bytes and expects more.
    Incomplete { acknowledged: u64 },
    Complete(RemoteFile),
}

/// The storage black box. Errors are `RelayError::Upload` with the
/// `retryable` flag set by the implementation.
#[async_trait]
pub trait ResumableStorage: Send + Sync {
    async fn create_session(
        &self,
        access_token: &str,
        metadata: &UploadMetadata,
        total_bytes: u64,
    ) -> Result<UploadSession>;

    async fn upload_chunk(
        &self,
        access_token: &str,
        session: &UploadSession,
        offset: u64,
        chunk: Vec<u8>,
        total_bytes: u64,
    ) -> Result<ChunkOutcome>;

    async fn query_status(
        &self,
        access_token: &str,
        session: &UploadSession,
        total_bytes: u64,
    ) -> Result<ChunkOutcome>;
}

pub struct UploadAdapter {
    storage: Arc<dyn ResumableStorage>,
    credentials: Arc<CredentialStore>,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl UploadAdapter {
    pub fn new(
        storage: Arc<dyn ResumableStorage>,
        credentials: Arc<CredentialStore>,
        chunk_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            credentials,
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    /// Uploads the file through a single session. Retryable failures resume
    /// from the offset the server acknowledged and consume `attempt`.
    pub async fn upload(
        &self,
        local_path: &Path,
        metadata: &UploadMetadata,
        progress: &ProgressSender,
        attempt: &mut u32,
    ) -> Result<UploadResult> {
        let mut file = File::open(local_path)
            .await
            .map_err(|source| RelayError::file_operation(local_path, source))?;
        let total = file
            .metadata()
            .await
            .map_err(|source| RelayError::file_operation(local_path, source))?
            .len();

        let timer = OperationTimer::new(format!("upload {}", progress.job_id()));

        let storage = &self.storage;
        let credentials = &self.credentials;
        let session = retry_with_backoff(&self.retry, attempt, "create upload session", |_| async move {
            let credential = credentials.ensure_valid().await?;
            storage
                .create_session(&credential.access_token, metadata, total)
                .await
        })
        .await?;
        info!(total_bytes = total, "Upload session opened");

        let mut offset = 0u64;

        loop {
            let chunk = read_chunk(&mut file, local_path, offset, self.chunk_size, total).await?;
            let credential = self.credentials.ensure_valid().await?;

            let (outcome, resumed) = match self
                .storage
                .upload_chunk(&credential.access_token, &session, offset, chunk, total)
                .await
            {
                Ok(outcome) => (outcome, false),
                Err(err) if err.is_transient() && self.retry.has_attempts_left(*attempt) => {
                    let delay = self.retry.delay_for_attempt(*attempt);
                    warn!(
                        attempt = *attempt,
                        offset,
                        error = %err,
                        "Chunk upload failed, resuming in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    *attempt += 1;

                    let credential = self.credentials.ensure_valid().await?;
                    match self
                        .storage
                        .query_status(&credential.access_token, &session, total)
                        .await
                    {
                        Ok(outcome) => (outcome, true),
                        Err(err) if err.is_transient() => {
                            debug!("Status query failed, retrying from offset {}: {}", offset, err);
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            };

            match outcome {
                ChunkOutcome::Complete(remote) => {
                    progress.report(ProgressEvent::Upload {
                        bytes_sent: total,
                        total_bytes: total,
                    });
                    timer.finish_with_bytes(total);
                    return Ok(UploadResult {
                        remote_id: remote.id,
                        remote_link: remote.link,
                        bytes_sent: total,
                    });
                }
                ChunkOutcome::Incomplete { acknowledged } => {
                    if acknowledged > total {
                        return Err(RelayError::upload(
                            format!("server acknowledged {} of {} bytes", acknowledged, total),
                            false,
                        ));
                    }
                    // a resumed offset was already paid for by the failed chunk
                    if !resumed && acknowledged <= offset {
                        if !self.retry.has_attempts_left(*attempt) {
                            return Err(RelayError::upload(
                                format!("upload stalled at byte {} of {}", offset, total),
                                true,
                            ));
                        }
                        let delay = self.retry.delay_for_attempt(*attempt);
                        warn!(
                            attempt = *attempt,
                            offset,
                            acknowledged,
                            "Chunk made no progress, retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        *attempt += 1;
                    }
                    offset = acknowledged;
                    progress.report(ProgressEvent::Upload {
                        bytes_sent: offset,
                        total_bytes: total,
                    });
                }
            }
        }
    }
}

/// Remote name is the sanitized title with the artifact's extension.
pub fn upload_metadata(config: &DriveConfig, media: &ExtractedMedia) -> UploadMetadata {
    let extension = media
        .local_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");

    UploadMetadata {
        name: format!("{}.{}", Validator::sanitize_file_name(&media.title), extension),
        mime_type: config.mime_type.clone(),
        parent_folder: config.folder_id.clone().filter(|f| !f.is_empty()),
    }
}

async fn read_chunk(
    file: &mut File,
    path: &Path,
    offset: u64,
    chunk_size: usize,
    total: u64,
) -> Result<Vec<u8>> {
    let len = (total.saturating_sub(offset)).min(chunk_size as u64) as usize;
    let mut buffer = vec![0u8; len];

    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|source| RelayError::file_operation(path, source))?;
    file.read_exact(&mut buffer)
        .await
        .map_err(|source| RelayError::file_operation(path, source))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::progress::ProgressRelay;
    use crate::testing::{RecordingSink, ScriptedStorage, authorized_store, unauthorized_store};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    const CHUNK: usize = 256 * 1024;

    fn metadata() -> UploadMetadata {
        UploadMetadata {
            name: "clip.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            parent_folder: None,
        }
    }

    fn sender() -> ProgressSender {
        let config = Config::default_config().progress;
        let (relay, _task) = ProgressRelay::spawn(Arc::new(RecordingSink::new()), &config);
        relay.sender(Uuid::new_v4(), 1)
    }

    fn write_artifact(temp: &TempDir, len: usize) -> std::path::PathBuf {
        let path = temp.path().join("clip.mp4");
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn adapter(storage: Arc<ScriptedStorage>, credentials: Arc<CredentialStore>) -> UploadAdapter {
        let retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50));
        UploadAdapter::new(storage, credentials, CHUNK, retry)
    }

    #[test]
    fn test_upload_metadata() {
        let mut config = Config::default_config().drive;
        config.folder_id = Some("folder123".to_string());
        let media = ExtractedMedia {
            local_path: std::path::PathBuf::from("/work/abc.webm"),
            title: "AC/DC: Live?".to_string(),
            duration_seconds: None,
            size_bytes: 1,
            thumbnail_path: None,
        };

        let metadata = upload_metadata(&config, &media);
        assert_eq!(metadata.name, "AC_DC_ Live_.webm");
        assert_eq!(metadata.parent_folder.as_deref(), Some("folder123"));
        assert_eq!(metadata.mime_type, "video/mp4");

        config.folder_id = Some(String::new());
        assert!(upload_metadata(&config, &media).parent_folder.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploads_in_chunks_through_one_session() {
        let temp = TempDir::new().unwrap();
        let path = write_artifact(&temp, CHUNK * 2 + 100);
        let storage = Arc::new(ScriptedStorage::new());
        let adapter = adapter(storage.clone(), authorized_store(temp.path()).await);
        let mut attempt = 0;

        let result = adapter
            .upload(&path, &metadata(), &sender(), &mut attempt)
            .await
            .unwrap();

        assert_eq!(result.bytes_sent, (CHUNK * 2 + 100) as u64);
        assert_eq!(storage.sessions_created(), 1);
        assert_eq!(
            storage.chunk_offsets(),
            vec![0, CHUNK as u64, (CHUNK * 2) as u64]
        );
        assert_eq!(storage.received(), std::fs::read(&path).unwrap());
        assert_eq!(attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_resumes_from_acknowledged_offset() {
        let temp = TempDir::new().unwrap();
        let path = write_artifact(&temp, CHUNK * 3);
        let storage = Arc::new(ScriptedStorage::new().fail_chunk_at(CHUNK as u64, true));
        let adapter = adapter(storage.clone(), authorized_store(temp.path()).await);
        let mut attempt = 0;

        adapter
            .upload(&path, &metadata(), &sender(), &mut attempt)
            .await
            .unwrap();

        assert_eq!(storage.sessions_created(), 1);
        assert_eq!(storage.query_calls(), 1);
        assert_eq!(
            storage.chunk_offsets(),
            vec![0, CHUNK as u64, CHUNK as u64, (CHUNK * 2) as u64]
        );
        assert_eq!(storage.received(), std::fs::read(&path).unwrap());
        assert_eq!(attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_stops_immediately() {
        let temp = TempDir::new().unwrap();
        let path = write_artifact(&temp, CHUNK * 2);
        let storage = Arc::new(ScriptedStorage::new().fail_chunk_at(0, false));
        let adapter = adapter(storage.clone(), authorized_store(temp.path()).await);
        let mut attempt = 0;

        let err = adapter
            .upload(&path, &metadata(), &sender(), &mut attempt)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Upload { retryable: false, .. }));
        assert_eq!(storage.query_calls(), 0);
        assert_eq!(storage.chunk_offsets(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_shared_with_session_creation() {
        let temp = TempDir::new().unwrap();
        let path = write_artifact(&temp, CHUNK);
        let storage = Arc::new(
            ScriptedStorage::new()
                .fail_sessions(2)
                .fail_chunk_at(0, true),
        );
        let adapter = adapter(storage.clone(), authorized_store(temp.path()).await);
        let mut attempt = 0;

        let err = adapter
            .upload(&path, &metadata(), &sender(), &mut attempt)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(attempt, 3);
        assert_eq!(storage.sessions_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_chunks_spend_the_retry_budget() {
        let temp = TempDir::new().unwrap();
        let path = write_artifact(&temp, 1000);
        let storage = Arc::new(ScriptedStorage::new().stalling());
        let adapter = adapter(storage.clone(), authorized_store(temp.path()).await);
        let mut attempt = 0;

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            adapter.upload(&path, &metadata(), &sender(), &mut attempt),
        )
        .await
        .expect("stalled upload must give up")
        .unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().contains("stalled at byte 0 of 1000"), "{}", err);
        assert_eq!(attempt, 3);
        assert_eq!(storage.chunk_offsets(), vec![0, 0, 0]);
        assert_eq!(storage.query_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_requires_authorization() {
        let temp = TempDir::new().unwrap();
        let path = write_artifact(&temp, 10);
        let storage = Arc::new(ScriptedStorage::new());
        let adapter = adapter(storage.clone(), unauthorized_store(temp.path()).await);
        let mut attempt = 0;

        let err = adapter
            .upload(&path, &metadata(), &sender(), &mut attempt)
            .await
            .unwrap_err();

        assert!(err.requires_authorization());
        assert_eq!(storage.sessions_created(), 0);
    }
}
