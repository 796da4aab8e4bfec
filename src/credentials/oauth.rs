// file: src/credentials/oauth.rs
// description: Google OAuth2 authorization-code exchange with PKCE
// reference: https://developers.google.com/identity/protocols/oauth2/native-app

use crate::config::DriveConfig;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Token material returned by a code exchange or a refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenGrant {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// The storage provider's authorization server.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String;

    fn scopes(&self) -> Vec<String>;

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenGrant>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

pub struct GoogleOAuthClient {
    client: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl GoogleOAuthClient {
    pub fn new(config: &DriveConfig) -> Result<Self> {
        if config.client_id.is_empty() {
            return Err(RelayError::Config(
                "drive.client_id is not configured".to_string(),
            ));
        }

        Ok(Self {
            client: Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
        })
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .client
            .post(TOKEN_ENDPOINT)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let grant: TokenGrant = response.json().await?;
            debug!("Received token grant valid for {}s", grant.expires_in);
            return Ok(grant);
        }

        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<TokenErrorResponse>(&body).ok();
        let message = match parsed {
            Some(err) => match err.error_description {
                Some(description) => format!("{}: {}", err.error, description),
                None => err.error,
            },
            None => format!("token endpoint returned {}", status),
        };

        warn!("Token endpoint rejected request: {}", message);

        if status.is_server_error() {
            Err(RelayError::Internal(message))
        } else {
            Err(RelayError::InvalidAuthorizationCode(message))
        }
    }
}

#[async_trait]
impl TokenProvider for GoogleOAuthClient {
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        let scope = self.scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ];

        match Url::parse_with_params(AUTH_ENDPOINT, &params) {
            Ok(url) => url.to_string(),
            Err(_) => AUTH_ENDPOINT.to_string(),
        }
    }

    fn scopes(&self) -> Vec<String> {
        self.scopes.clone()
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .await
        .map_err(|e| RelayError::RefreshFailed(e.to_string()))
    }
}

/// Random PKCE verifier (64 chars from the unreserved set).
pub fn generate_code_verifier() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

pub fn generate_state() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Code pasted back by the requester, optionally with the `state` parameter
/// when the whole redirect URL was pasted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub state: Option<String>,
}

impl AuthorizationCode {
    pub fn bare(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            state: None,
        }
    }

    /// Reads `code` and `state` from a pasted redirect URL.
    pub fn from_redirect(url: &str) -> Option<Self> {
        let parsed = Url::parse(url.trim()).ok()?;
        let mut code = None;
        let mut state = None;

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }

        code.filter(|c| !c.is_empty())
            .map(|code| Self { code, state })
    }
}
