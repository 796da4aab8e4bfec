// file: src/credentials/store.rs
// description: process-wide credential holder with single-flight refresh and JSON persistence
// reference: credential refresh service with per-scope refresh locks

use crate::credentials::oauth::{
    AuthorizationCode, TokenProvider, code_challenge, generate_code_verifier, generate_state,
};
use crate::credentials::pending::{PendingAuthorization, PendingAuthorizations};
use crate::error::{RelayError, Result};
use crate::models::{Credential, RequesterId};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

/// Tokens are refreshed this long before their nominal expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

pub struct CredentialStore {
    token_path: PathBuf,
    provider: Arc<dyn TokenProvider>,
    current: RwLock<Option<Credential>>,
    /// Serializes every mutation of `current`; refreshes are double-checked under it.
    refresh_lock: Mutex<()>,
    pending: PendingAuthorizations,
    generation: watch::Sender<u64>,
}

impl CredentialStore {
    pub fn new(
        token_path: PathBuf,
        provider: Arc<dyn TokenProvider>,
        authorization_ttl: Duration,
    ) -> Self {
        let (generation, _) = watch::channel(0);

        Self {
            token_path,
            provider,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            pending: PendingAuthorizations::new(authorization_ttl),
            generation,
        }
    }

    /// Creates the store and loads a previously persisted credential, if any.
    pub async fn open(
        token_path: PathBuf,
        provider: Arc<dyn TokenProvider>,
        authorization_ttl: Duration,
    ) -> Result<Self> {
        let store = Self::new(token_path, provider, authorization_ttl);
        store.load().await?;
        Ok(store)
    }

    async fn load(&self) -> Result<()> {
        if !self.token_path.exists() {
            debug!("No stored credential at {:?}", self.token_path);
            return Ok(());
        }

        let contents = fs::read(&self.token_path)
            .await
            .map_err(|source| RelayError::file_operation(&self.token_path, source))?;

        match serde_json::from_slice::<Credential>(&contents) {
            Ok(credential) => {
                info!("Loaded stored credential (expires {})", credential.expiry);
                *self.current.write().await = Some(credential);
            }
            Err(e) => {
                warn!("Ignoring unreadable credential file {:?}: {}", self.token_path, e);
            }
        }

        Ok(())
    }

    /// Current credential without any network I/O.
    pub async fn get(&self) -> Result<Credential> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(RelayError::AuthorizationRequired)
    }

    /// Returns a usable credential, refreshing it first when expired. Only
    /// one refresh runs at a time; callers queued behind it see its result.
    pub async fn ensure_valid(&self) -> Result<Credential> {
        let skew = chrono::Duration::seconds(EXPIRY_SKEW_SECS);

        match self.current.read().await.as_ref() {
            None => return Err(RelayError::AuthorizationRequired),
            Some(credential) if !credential.is_expired(skew) => return Ok(credential.clone()),
            Some(_) => {}
        }

        let _guard = self.refresh_lock.lock().await;

        let stale = match self.current.read().await.as_ref() {
            None => return Err(RelayError::AuthorizationRequired),
            Some(credential) if !credential.is_expired(skew) => {
                debug!("Credential refreshed by a concurrent caller");
                return Ok(credential.clone());
            }
            Some(credential) => credential.clone(),
        };

        let Some(refresh_token) = stale.refresh_token.clone().filter(|t| !t.is_empty()) else {
            info!("Credential expired and cannot be refreshed");
            return Err(RelayError::AuthorizationRequired);
        };

        info!("Refreshing expired access token");
        match self.provider.refresh(&refresh_token).await {
            Ok(grant) => {
                let refreshed =
                    stale.refreshed(grant.access_token, grant.refresh_token, grant.expires_in);
                self.install(refreshed.clone()).await?;
                Ok(refreshed)
            }
            Err(e) => {
                warn!("Token refresh failed, credential invalidated: {}", e);
                self.invalidate().await?;
                if matches!(e, RelayError::RefreshFailed(_)) {
                    Err(e)
                } else {
                    Err(RelayError::RefreshFailed(e.to_string()))
                }
            }
        }
    }

    /// Starts an exchange for the requester and returns the URL they must
    /// visit. Any earlier pending exchange for them is replaced.
    pub fn begin_authorization(&self, requester: RequesterId) -> String {
        let state = generate_state();
        let verifier = generate_code_verifier();
        let challenge = code_challenge(&verifier);
        let url = self.provider.authorization_url(&state, &challenge);

        self.pending
            .upsert(requester, PendingAuthorization::new(state, verifier));
        info!(requester, "Authorization started");
        url
    }

    pub async fn complete_authorization(
        &self,
        requester: RequesterId,
        code: &AuthorizationCode,
    ) -> Result<Credential> {
        let pending = self
            .pending
            .for_code(requester, code.state.as_deref())
            .ok_or(RelayError::NoPendingAuthorization)?;

        let _guard = self.refresh_lock.lock().await;

        let grant = self
            .provider
            .exchange_code(&code.code, &pending.code_verifier)
            .await?;

        let mut scopes: BTreeSet<String> = grant.scopes().into_iter().collect();
        if scopes.is_empty() {
            scopes = self.provider.scopes().into_iter().collect();
        }

        let credential = Credential::new(
            grant.access_token,
            grant.refresh_token,
            grant.expires_in,
            scopes,
        );

        self.install(credential.clone()).await?;
        self.pending.remove_if_state(requester, &pending.state);
        info!(requester, "Authorization completed");
        Ok(credential)
    }

    pub fn cancel_authorization(&self, requester: RequesterId) -> bool {
        self.pending.remove(requester)
    }

    pub fn has_pending_authorization(&self, requester: RequesterId) -> bool {
        self.pending.get(requester, None).is_some()
    }

    pub fn purge_expired_authorizations(&self) -> usize {
        self.pending.purge_expired()
    }

    /// Bumped every time a new credential is installed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    async fn install(&self, credential: Credential) -> Result<()> {
        self.persist(&credential).await?;
        *self.current.write().await = Some(credential);
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    async fn invalidate(&self) -> Result<()> {
        *self.current.write().await = None;

        match fs::remove_file(&self.token_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RelayError::file_operation(&self.token_path, source)),
        }
    }

    async fn persist(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.token_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| RelayError::file_operation(parent, source))?;
            }
        }

        let contents = serde_json::to_vec_pretty(credential)?;
        let tmp_path = self.token_path.with_extension("json.tmp");

        fs::write(&tmp_path, contents)
            .await
            .map_err(|source| RelayError::file_operation(&tmp_path, source))?;
        fs::rename(&tmp_path, &self.token_path)
            .await
            .map_err(|source| RelayError::file_operation(&self.token_path, source))?;

        debug!("Persisted credential to {:?}", self.token_path);
        Ok(())
    }
}
