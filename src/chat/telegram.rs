// file: src/chat/telegram.rs
// description: Telegram Bot API transport with long polling and rate-limit handling
// reference: https://core.telegram.org/bots/api

use crate::chat::{InboundEvent, MessageRef, NotificationSink};
use crate::config::TelegramConfig;
use crate::error::{RelayError, Result};
use crate::models::RequesterId;
use crate::utils::Validator;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// `sendMessage` text limit (characters).
const MESSAGE_LIMIT: usize = 4096;

/// Caption limit for photos and videos.
const CAPTION_LIMIT: usize = 1024;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    username: Option<String>,
    first_name: String,
}

pub struct TelegramBot {
    client: Client,
    endpoint: String,
    poll_timeout: Duration,
    allowed: HashSet<i64>,
}

impl TelegramBot {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if config.bot_token.is_empty() {
            return Err(RelayError::Config(
                "telegram.bot_token is not configured (TELEGRAM_BOT_TOKEN)".to_string(),
            ));
        }

        let poll_timeout = Duration::from_secs(config.poll_timeout_secs);
        let client = Client::builder()
            .timeout(poll_timeout + Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
            poll_timeout,
            allowed: config.allowed_chat_ids.iter().copied().collect(),
        })
    }

    /// An empty allow-list admits every chat.
    pub fn is_allowed(&self, chat_id: i64) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&chat_id)
    }

    /// Bot display name, used by `doctor` to verify the token.
    pub async fn get_me(&self) -> Result<String> {
        let me: BotUser = self.call("getMe", &json!({})).await?;
        Ok(me
            .username
            .map(|u| format!("@{}", u))
            .unwrap_or(me.first_name))
    }

    /// Polls `getUpdates` until shutdown and forwards text messages.
    pub fn spawn_listener(
        self: Arc<Self>,
        tx: mpsc::Sender<InboundEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut offset = 0i64;
            info!("Telegram long polling started");

            loop {
                let updates = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = self.get_updates(offset) => result,
                };

                let updates = match updates {
                    Ok(updates) => updates,
                    Err(e) => {
                        warn!("getUpdates failed: {}", e);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                        }
                    }
                };

                for update in updates {
                    offset = offset.max(update.update_id + 1);

                    let Some(message) = update.message else {
                        continue;
                    };
                    let Some(text) = message.text else {
                        continue;
                    };
                    if !self.is_allowed(message.chat.id) {
                        debug!(chat_id = message.chat.id, "Ignoring message from chat outside allow-list");
                        continue;
                    }

                    if tx.send(InboundEvent::new(message.chat.id, text)).await.is_err() {
                        debug!("Inbound receiver dropped, stopping listener");
                        return;
                    }
                }
            }

            info!("Telegram long polling stopped");
        })
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": self.poll_timeout.as_secs(),
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: &Value) -> Result<T> {
        let url = format!("{}/{}", self.endpoint, method);
        self.with_rate_limit(method, || self.client.post(&url).json(payload))
            .await
    }

    async fn call_multipart<T, F>(&self, method: &str, build_form: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> Form,
    {
        let url = format!("{}/{}", self.endpoint, method);
        self.with_rate_limit(method, || self.client.post(&url).multipart(build_form()))
            .await
    }

    async fn with_rate_limit<T, F>(&self, method: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let response = build().send().await?;
            let status = response.status();
            let body: ApiResponse<T> = response
                .json()
                .await
                .map_err(|e| RelayError::Chat(format!("{} returned {}: {}", method, status, e)))?;

            if body.ok {
                return body
                    .result
                    .ok_or_else(|| RelayError::Chat(format!("{} returned no result", method)));
            }

            if status.as_u16() == 429 {
                let retry_after = body
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(1));

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    return Err(RelayError::Chat(format!(
                        "{} rate limited after {} attempts",
                        method, attempts
                    )));
                }

                debug!(
                    "Telegram rate limited on {}, waiting {:?} (attempt {}/{})",
                    method, retry_after, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(retry_after).await;
                continue;
            }

            return Err(RelayError::Chat(format!(
                "{} failed: {} {}",
                method,
                status,
                body.description.unwrap_or_default()
            )));
        }
    }

    fn media_form(
        requester: RequesterId,
        field: &'static str,
        file_name: &'static str,
        bytes: Vec<u8>,
        caption: String,
    ) -> impl Fn() -> Form {
        move || {
            Form::new()
                .text("chat_id", requester.to_string())
                .text("caption", caption.clone())
                .part(field, Part::bytes(bytes.clone()).file_name(file_name))
        }
    }
}

fn limit(text: &str, max: usize) -> String {
    Validator::truncate_text(text, max.saturating_sub(3))
}

#[async_trait]
impl NotificationSink for TelegramBot {
    async fn send_text(&self, requester: RequesterId, text: &str) -> Result<MessageRef> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": requester,
                    "text": limit(text, MESSAGE_LIMIT),
                    "disable_web_page_preview": true,
                }),
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn edit_text(&self, requester: RequesterId, message: MessageRef, text: &str) -> Result<()> {
        let result: Result<Value> = self
            .call(
                "editMessageText",
                &json!({
                    "chat_id": requester,
                    "message_id": message,
                    "text": limit(text, MESSAGE_LIMIT),
                }),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(RelayError::Chat(msg)) if msg.contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_photo(
        &self,
        requester: RequesterId,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        let form = Self::media_form(
            requester,
            "photo",
            "thumbnail.jpg",
            bytes,
            limit(caption, CAPTION_LIMIT),
        );
        let sent: SentMessage = self.call_multipart("sendPhoto", form).await?;
        Ok(sent.message_id)
    }

    async fn send_video(
        &self,
        requester: RequesterId,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef> {
        let form = Self::media_form(
            requester,
            "video",
            "video.mp4",
            bytes,
            limit(caption, CAPTION_LIMIT),
        );
        let sent: SentMessage = self.call_multipart("sendVideo", form).await?;
        Ok(sent.message_id)
    }
}
