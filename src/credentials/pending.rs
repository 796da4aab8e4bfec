// file: src/credentials/pending.rs
// description: in-memory table of authorization exchanges awaiting a code
// reference: per-key locked registry over dashmap

use crate::models::RequesterId;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// State needed to finish one OAuth exchange: the `state` nonce echoed back
/// on the redirect and the PKCE verifier matching the issued challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub state: String,
    pub code_verifier: String,
    pub issued_at: Instant,
    /// Set when this entry took the place of an earlier one for the same requester.
    pub replaced: bool,
}

impl PendingAuthorization {
    pub fn new(state: String, code_verifier: String) -> Self {
        Self {
            state,
            code_verifier,
            issued_at: Instant::now(),
            replaced: false,
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() >= ttl
    }
}

pub struct PendingAuthorizations {
    entries: DashMap<RequesterId, PendingAuthorization>,
    ttl: Duration,
}

impl PendingAuthorizations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replaces any existing entry for the requester.
    pub fn upsert(&self, requester: RequesterId, mut pending: PendingAuthorization) {
        pending.replaced = self.entries.contains_key(&requester);
        if self.entries.insert(requester, pending).is_some() {
            debug!(requester, "Replaced pending authorization");
        }
    }

    /// Live entry for the requester. When `state` is given it must match the
    /// stored nonce. Expired entries are dropped on the way.
    pub fn get(&self, requester: RequesterId, state: Option<&str>) -> Option<PendingAuthorization> {
        let expired = self
            .entries
            .remove_if(&requester, |_, pending| pending.is_expired(self.ttl))
            .is_some();
        if expired {
            debug!(requester, "Pending authorization expired");
            return None;
        }

        let entry = self.entries.get(&requester)?;
        match state {
            Some(state) if state != entry.state => None,
            _ => Some(entry.clone()),
        }
    }

    /// Entry a submitted code may be exchanged against. A code without `state`
    /// cannot tell a replaced link from the current one, so it is refused
    /// after a replacement and the entry is dropped.
    pub fn for_code(
        &self,
        requester: RequesterId,
        state: Option<&str>,
    ) -> Option<PendingAuthorization> {
        let entry = self.get(requester, state)?;
        if state.is_none() && entry.replaced {
            self.remove_if_state(requester, &entry.state);
            debug!(requester, "Bare code refused after pending authorization was replaced");
            return None;
        }
        Some(entry)
    }

    /// Removes the entry only if it is still the one identified by `state`.
    pub fn remove_if_state(&self, requester: RequesterId, state: &str) -> bool {
        self.entries
            .remove_if(&requester, |_, pending| pending.state == state)
            .is_some()
    }

    pub fn remove(&self, requester: RequesterId) -> bool {
        self.entries.remove(&requester).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, pending| !pending.is_expired(self.ttl));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
