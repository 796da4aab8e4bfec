// file: src/testing.rs
// description: in-crate fakes shared by unit tests
// reference: scripted collaborators behind the pipeline traits

use crate::chat::{MessageRef, NotificationSink};
use crate::credentials::{CredentialStore, TokenGrant, TokenProvider};
use crate::error::{RelayError, Result};
use crate::extractor::{ExtractOptions, MediaExtractor};
use crate::models::{Credential, ExtractedMedia, RequesterId, UploadMetadata};
use crate::pipeline::progress::DownloadProgressFn;
use crate::storage::{ChunkOutcome, RemoteFile, ResumableStorage, UploadSession};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

pub struct FakeTokenProvider {
    pub refresh_calls: AtomicUsize,
    refresh_delay: Duration,
    fail_refresh: bool,
}

impl FakeTokenProvider {
    pub fn new() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            refresh_delay: Duration::ZERO,
            fail_refresh: false,
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn failing_refresh(mut self) -> Self {
        self.fail_refresh = true;
        self
    }

    pub fn state_from_url(url: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        format!(
            "https://auth.test/authorize?state={}&code_challenge={}",
            state, code_challenge
        )
    }

    fn scopes(&self) -> Vec<String> {
        vec![DRIVE_SCOPE.to_string()]
    }

    async fn exchange_code(&self, code: &str, _code_verifier: &str) -> Result<TokenGrant> {
        if !code.starts_with("4/") {
            return Err(RelayError::InvalidAuthorizationCode("invalid_grant".into()));
        }
        Ok(TokenGrant {
            access_token: format!("exchanged-{}", code),
            refresh_token: Some("refresh-token".to_string()),
            expires_in: 3600,
            scope: None,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if self.fail_refresh {
            return Err(RelayError::RefreshFailed("invalid_grant".into()));
        }
        Ok(TokenGrant {
            access_token: format!("refreshed-{}", n),
            refresh_token: None,
            expires_in: 3600,
            scope: None,
        })
    }
}

fn drive_scopes() -> BTreeSet<String> {
    [DRIVE_SCOPE.to_string()].into_iter().collect()
}

/// Store holding a credential valid for an hour.
pub async fn authorized_store(dir: &Path) -> Arc<CredentialStore> {
    let path = dir.join("token.json");
    let credential = Credential::new("live".into(), Some("refresh".into()), 3600, drive_scopes());
    std::fs::write(&path, serde_json::to_vec(&credential).unwrap()).unwrap();
    Arc::new(
        CredentialStore::open(path, Arc::new(FakeTokenProvider::new()), Duration::from_secs(600))
            .await
            .unwrap(),
    )
}

/// Store whose credential has expired and whose refresh token is revoked.
pub async fn revoked_store(dir: &Path) -> Arc<CredentialStore> {
    let path = dir.join("token.json");
    let credential = Credential::new("stale".into(), Some("revoked".into()), -10, drive_scopes());
    std::fs::write(&path, serde_json::to_vec(&credential).unwrap()).unwrap();
    Arc::new(
        CredentialStore::open(
            path,
            Arc::new(FakeTokenProvider::new().failing_refresh()),
            Duration::from_secs(600),
        )
        .await
        .unwrap(),
    )
}

pub async fn unauthorized_store(dir: &Path) -> Arc<CredentialStore> {
    Arc::new(
        CredentialStore::open(
            dir.join("token.json"),
            Arc::new(FakeTokenProvider::new()),
            Duration::from_secs(600),
        )
        .await
        .unwrap(),
    )
}

/// Extractor that writes a file of the requested size, optionally after
/// failing with scripted error text.
pub struct ScriptedExtractor {
    size: u64,
    reported_size: Option<u64>,
    thumbnail: bool,
    hang: bool,
    failures: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    last_options: Mutex<Option<ExtractOptions>>,
}

impl ScriptedExtractor {
    pub fn succeeding(size: u64) -> Self {
        Self {
            size,
            reported_size: None,
            thumbnail: false,
            hang: false,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        }
    }

    pub fn then_fail_first(self, messages: &[&str]) -> Self {
        *self.failures.lock().unwrap() = messages.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn misreporting_size(mut self, reported: u64) -> Self {
        self.reported_size = Some(reported);
        self
    }

    pub fn with_thumbnail(mut self) -> Self {
        self.thumbnail = true;
        self
    }

    /// Never finishes; used to interrupt a download in flight.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ExtractOptions> {
        self.last_options.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        _url: &str,
        options: &ExtractOptions,
        on_progress: DownloadProgressFn,
    ) -> anyhow::Result<ExtractedMedia> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());

        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(message) = failure {
            return Err(anyhow!(message));
        }

        on_progress(0.25, Some(3));
        if self.hang {
            std::future::pending::<()>().await;
        }

        let local_path = options.output_dir.join("scripted.mp4");
        let file = std::fs::File::create(&local_path)?;
        file.set_len(self.size)?;

        let thumbnail_path = if self.thumbnail {
            let path = options.output_dir.join("scripted.jpg");
            std::fs::write(&path, b"\xFF\xD8\xFFthumbnail")?;
            Some(path)
        } else {
            None
        };

        on_progress(1.0, Some(0));
        Ok(ExtractedMedia {
            local_path,
            title: "Scripted Clip".to_string(),
            duration_seconds: Some(10.0),
            size_bytes: self.reported_size.unwrap_or(self.size),
            thumbnail_path,
        })
    }

    async fn version(&self) -> anyhow::Result<String> {
        Ok("scripted".to_string())
    }
}

#[derive(Default)]
struct StorageState {
    received: Vec<u8>,
    total: u64,
    chunk_offsets: Vec<u64>,
    failed_offsets: HashSet<u64>,
    metadata: Option<UploadMetadata>,
}

/// In-memory resumable storage with failure injection.
#[derive(Default)]
pub struct ScriptedStorage {
    state: Mutex<StorageState>,
    sessions_created: AtomicUsize,
    session_failures: AtomicUsize,
    query_calls: AtomicUsize,
    fail_at: Option<(u64, bool)>,
    stall: bool,
    hang: bool,
}

impl ScriptedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first chunk sent at `offset` fails once.
    pub fn fail_chunk_at(mut self, offset: u64, retryable: bool) -> Self {
        self.fail_at = Some((offset, retryable));
        self
    }

    /// Chunks are answered without being stored, so the offset never moves.
    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Chunk uploads never finish; used to interrupt an upload in flight.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// The next `count` session creations fail with a retryable error.
    pub fn fail_sessions(self, count: usize) -> Self {
        self.session_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn chunk_offsets(&self) -> Vec<u64> {
        self.state.lock().unwrap().chunk_offsets.clone()
    }

    pub fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn last_metadata(&self) -> Option<UploadMetadata> {
        self.state.lock().unwrap().metadata.clone()
    }

    fn outcome(state: &StorageState) -> ChunkOutcome {
        if state.received.len() as u64 == state.total {
            ChunkOutcome::Complete(RemoteFile {
                id: "remote-1".to_string(),
                link: "https://drive.test/file/remote-1".to_string(),
            })
        } else {
            ChunkOutcome::Incomplete {
                acknowledged: state.received.len() as u64,
            }
        }
    }
}

#[async_trait]
impl ResumableStorage for ScriptedStorage {
    async fn create_session(
        &self,
        _access_token: &str,
        metadata: &UploadMetadata,
        total_bytes: u64,
    ) -> Result<UploadSession> {
        let remaining = self.session_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.session_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::upload("scripted session failure", true));
        }

        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().unwrap();
        state.received.clear();
        state.total = total_bytes;
        state.metadata = Some(metadata.clone());

        Ok(UploadSession {
            uri: format!("https://upload.test/session/{}", n),
        })
    }

    async fn upload_chunk(
        &self,
        _access_token: &str,
        _session: &UploadSession,
        offset: u64,
        chunk: Vec<u8>,
        _total_bytes: u64,
    ) -> Result<ChunkOutcome> {
        if self.hang {
            self.state.lock().unwrap().chunk_offsets.push(offset);
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.chunk_offsets.push(offset);

        if self.stall {
            return Ok(ChunkOutcome::Incomplete {
                acknowledged: state.received.len() as u64,
            });
        }

        if let Some((fail_offset, retryable)) = self.fail_at {
            if fail_offset == offset && state.failed_offsets.insert(offset) {
                return Err(RelayError::upload("scripted chunk failure", retryable));
            }
        }

        if offset != state.received.len() as u64 {
            return Err(RelayError::upload("offset mismatch", false));
        }

        state.received.extend_from_slice(&chunk);
        Ok(Self::outcome(&state))
    }

    async fn query_status(
        &self,
        _access_token: &str,
        _session: &UploadSession,
        _total_bytes: u64,
    ) -> Result<ChunkOutcome> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(Self::outcome(&state))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Text,
    Edit,
    Photo,
    Video,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub requester: RequesterId,
    pub kind: DeliveryKind,
    pub text: String,
}

/// Sink that keeps every delivery in order.
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
    next_ref: AtomicI64,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, requester: RequesterId, kind: DeliveryKind, text: &str) -> MessageRef {
        self.deliveries.lock().unwrap().push(Delivery {
            requester,
            kind,
            text: text.to_string(),
        });
        self.next_ref.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn deliveries(&self, requester: RequesterId) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.requester == requester)
            .cloned()
            .collect()
    }

    pub fn texts(&self, requester: RequesterId) -> Vec<String> {
        self.deliveries(requester)
            .into_iter()
            .map(|d| d.text)
            .collect()
    }

    pub fn progress_texts(&self, requester: RequesterId) -> Vec<String> {
        self.texts(requester)
            .into_iter()
            .filter(|t| t.starts_with("⏬ Downloading:") || t.starts_with("⏫ Uploading:"))
            .collect()
    }

    pub fn sent_count(&self, requester: RequesterId) -> usize {
        self.count(requester, DeliveryKind::Text)
    }

    pub fn edit_count(&self, requester: RequesterId) -> usize {
        self.count(requester, DeliveryKind::Edit)
    }

    fn count(&self, requester: RequesterId, kind: DeliveryKind) -> usize {
        self.deliveries(requester)
            .iter()
            .filter(|d| d.kind == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_text(&self, requester: RequesterId, text: &str) -> Result<MessageRef> {
        Ok(self.record(requester, DeliveryKind::Text, text))
    }

    async fn edit_text(&self, requester: RequesterId, _message: MessageRef, text: &str) -> Result<()> {
        self.record(requester, DeliveryKind::Edit, text);
        Ok(())
    }

    async fn send_photo(
        &self,
        requester: RequesterId,
        _bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        Ok(self.record(requester, DeliveryKind::Photo, caption))
    }

    async fn send_video(
        &self,
        requester: RequesterId,
        _bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        Ok(self.record(requester, DeliveryKind::Video, caption))
    }
}
