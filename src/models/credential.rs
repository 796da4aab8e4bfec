// file: src/models/credential.rs
// description: OAuth2 credential for the storage provider
// reference: https://developers.google.com/identity/protocols/oauth2

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl Credential {
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: i64,
        scopes: BTreeSet<String>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expiry: Utc::now() + Duration::seconds(expires_in_secs),
            scopes,
        }
    }

    /// Expired, or about to expire within `skew`.
    pub fn is_expired(&self, skew: Duration) -> bool {
        Utc::now() + skew >= self.expiry
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    /// Replaces the token material after a refresh. Scopes stay as issued and
    /// the old refresh token is kept when the provider does not rotate it.
    pub fn refreshed(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: i64,
    ) -> Self {
        Self {
            access_token,
            refresh_token: refresh_token.or_else(|| self.refresh_token.clone()),
            expiry: Utc::now() + Duration::seconds(expires_in_secs),
            scopes: self.scopes.clone(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expiry", &self.expiry)
            .field("scopes", &self.scopes)
            .finish()
    }
}
