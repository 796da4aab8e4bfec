// file: src/chat/mod.rs
// description: chat transport abstraction used by the pipeline
// reference: notification channel trait with pluggable transports

pub mod classifier;
pub mod console;
pub mod telegram;

pub use classifier::{Command, MessageClassifier};
pub use console::ConsoleSink;
pub use telegram::TelegramBot;

use crate::error::Result;
use crate::models::RequesterId;
use async_trait::async_trait;

/// Identifier of a delivered message, used to edit it later.
pub type MessageRef = i64;

/// Text received from a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub requester_id: RequesterId,
    pub text: String,
}

impl InboundEvent {
    pub fn new(requester_id: RequesterId, text: impl Into<String>) -> Self {
        Self {
            requester_id,
            text: text.into(),
        }
    }
}

/// Outbound side of the chat transport.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_text(&self, requester: RequesterId, text: &str) -> Result<MessageRef>;

    /// Replaces the text of an earlier message. Transports without edits
    /// post a new message instead.
    async fn edit_text(&self, requester: RequesterId, message: MessageRef, text: &str) -> Result<()> {
        let _ = message;
        self.send_text(requester, text).await.map(|_| ())
    }

    async fn send_photo(
        &self,
        requester: RequesterId,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef>;

    async fn send_video(
        &self,
        requester: RequesterId,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef>;
}
