// file: src/bot.rs
// description: routes inbound chat messages to authorization, job control and new transfers
// reference: command dispatch loop over an mpsc stream

use crate::chat::{Command, InboundEvent, MessageClassifier, NotificationSink};
use crate::credentials::{AuthorizationCode, CredentialStore};
use crate::error::RelayError;
use crate::models::{JobState, RequesterId};
use crate::pipeline::{CancelResult, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub const HELP_TEXT: &str = "🎬 Send me a YouTube link and I'll upload the video to your Google Drive.\n\n\
Commands:\n\
/auth - connect Google Drive\n\
/code <code> - finish connecting with the code Google showed you\n\
/status - show your current transfer\n\
/cancel - cancel a transfer waiting for authorization\n\
/help - show this message";

const WELCOME_TEXT: &str = "👋 Hi! I fetch YouTube videos and save them to Google Drive.";

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    credentials: Arc<CredentialStore>,
    sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        credentials: Arc<CredentialStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            orchestrator,
            credentials,
            sink,
        }
    }

    /// Handles inbound messages until shutdown or until every sender is gone.
    /// Expired pending authorizations are purged on a fixed interval.
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundEvent>, shutdown: CancellationToken) {
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = purge.tick() => {
                    let purged = self.credentials.purge_expired_authorizations();
                    if purged > 0 {
                        debug!("Purged {} expired authorization(s)", purged);
                    }
                }
                event = inbound.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        info!("Dispatcher stopped");
    }

    pub async fn handle(&self, event: InboundEvent) {
        let requester = event.requester_id;
        let command = MessageClassifier::classify(&event.text);
        debug!(requester, ?command, "Inbound message");

        match command {
            Command::Start => self.reply(requester, &format!("{}\n\n{}", WELCOME_TEXT, HELP_TEXT)).await,
            Command::Help | Command::Unknown => self.reply(requester, HELP_TEXT).await,
            Command::Auth => self.start_authorization(requester).await,
            Command::AuthorizationCode(code) => self.finish_authorization(requester, code).await,
            Command::Cancel => {
                let text = cancel_reply(self.orchestrator.cancel(requester));
                self.reply(requester, text).await;
            }
            Command::Status => {
                let text = match self.orchestrator.status(requester) {
                    Some(job) => format!(
                        "📊 Current transfer: {} (attempt {})",
                        job.state, job.attempt
                    ),
                    None => "📭 No active transfer.".to_string(),
                };
                self.reply(requester, &text).await;
            }
            Command::SubmitUrl(url) => {
                // rejections are reported to the requester by the orchestrator
                if let Err(e) = self.orchestrator.submit(requester, &url).await {
                    debug!(requester, "Link not accepted: {}", e);
                }
            }
        }
    }

    async fn start_authorization(&self, requester: RequesterId) {
        let url = self.credentials.begin_authorization(requester);
        let text = format!(
            "🔑 Open this link and allow access to Google Drive:\n{}\n\n\
             Then send me the code, or paste the whole address you were redirected to.",
            url
        );
        self.reply(requester, &text).await;
    }

    async fn finish_authorization(&self, requester: RequesterId, code: AuthorizationCode) {
        let text = match self
            .credentials
            .complete_authorization(requester, &code)
            .await
        {
            Ok(_) => {
                let waiting = self
                    .orchestrator
                    .status(requester)
                    .is_some_and(|job| job.state == JobState::AwaitingAuthorization);
                if waiting {
                    "✅ Google Drive connected. Resuming your transfer…".to_string()
                } else {
                    "✅ Google Drive connected. Send me a link to upload.".to_string()
                }
            }
            Err(RelayError::NoPendingAuthorization) => {
                "ℹ️ No authorization is pending (or it expired). Send /auth first.".to_string()
            }
            Err(RelayError::InvalidAuthorizationCode(_)) => {
                "❌ Google rejected that code. Send /auth to get a fresh link.".to_string()
            }
            Err(e) => {
                warn!(requester, "Authorization failed: {}", e);
                format!("❌ Could not complete authorization: {}", e)
            }
        };
        self.reply(requester, &text).await;
    }

    async fn reply(&self, requester: RequesterId, text: &str) {
        if let Err(e) = self.sink.send_text(requester, text).await {
            warn!(requester, "Reply failed: {}", e);
        }
    }
}

fn cancel_reply(result: CancelResult) -> &'static str {
    match result {
        CancelResult::Cancelled => "🛑 Cancelling your transfer…",
        CancelResult::AuthorizationDiscarded => "🛑 Pending authorization discarded.",
        CancelResult::NotCancellable(JobState::Downloading) => {
            "⏳ Your video is downloading and can no longer be cancelled."
        }
        CancelResult::NotCancellable(JobState::Received) => {
            "⏳ Your transfer is starting and can no longer be cancelled."
        }
        CancelResult::NotCancellable(_) => {
            "⏳ Your video is uploading and can no longer be cancelled."
        }
        CancelResult::NothingToCancel => "📭 Nothing to cancel.",
    }
}
