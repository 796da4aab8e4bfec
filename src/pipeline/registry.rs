// file: src/pipeline/registry.rs
// description: one active job per requester over a sharded concurrent map
// reference: dashmap entry api for atomic check-and-insert

use crate::error::{RelayError, Result};
use crate::models::{JobState, RequesterId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the registry knows about a running job.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_id: Uuid,
    pub state: JobState,
    pub attempt: u32,
    /// Cancels the job while it waits for authorization.
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct JobRegistry {
    active: DashMap<RequesterId, ActiveJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the job unless the requester already has one running.
    pub fn try_register(&self, requester: RequesterId, job_id: Uuid) -> Result<CancellationToken> {
        match self.active.entry(requester) {
            Entry::Occupied(existing) => Err(RelayError::JobInProgress {
                state: existing.get().state,
            }),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(ActiveJob {
                    job_id,
                    state: JobState::Received,
                    attempt: 0,
                    cancel: cancel.clone(),
                });
                Ok(cancel)
            }
        }
    }

    pub fn update(&self, requester: RequesterId, job_id: Uuid, state: JobState, attempt: u32) {
        if let Some(mut entry) = self.active.get_mut(&requester) {
            if entry.job_id == job_id {
                entry.state = state;
                entry.attempt = attempt;
            }
        }
    }

    pub fn get(&self, requester: RequesterId) -> Option<ActiveJob> {
        self.active.get(&requester).map(|entry| entry.clone())
    }

    /// Removes the entry only if it still belongs to `job_id`.
    pub fn remove(&self, requester: RequesterId, job_id: Uuid) -> bool {
        self.active
            .remove_if(&requester, |_, entry| entry.job_id == job_id)
            .is_some()
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.active.iter().map(|entry| entry.job_id).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
