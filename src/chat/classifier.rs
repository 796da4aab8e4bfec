// file: src/chat/classifier.rs
// description: routes inbound chat text to commands, authorization codes or new jobs
// reference: regex-driven message classification

use crate::credentials::AuthorizationCode;
use crate::extractor::patterns::{GOOGLE_AUTH_CODE, HTTP_URL};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Auth,
    Cancel,
    Status,
    AuthorizationCode(AuthorizationCode),
    SubmitUrl(String),
    Unknown,
}

pub struct MessageClassifier;

impl MessageClassifier {
    /// First match wins: slash commands, then authorization codes (pasted
    /// redirect URL or bare code), then any http(s) link, then help.
    pub fn classify(text: &str) -> Command {
        let text = text.trim();

        if let Some(command) = Self::slash_command(text) {
            return command;
        }

        if let Some(code) = Self::authorization_code(text) {
            return Command::AuthorizationCode(code);
        }

        if HTTP_URL.is_match(text) {
            return Command::SubmitUrl(text.to_string());
        }

        Command::Unknown
    }

    fn slash_command(text: &str) -> Option<Command> {
        if !text.starts_with('/') {
            return None;
        }

        let mut parts = text.splitn(2, char::is_whitespace);
        let head = parts.next().unwrap_or_default();
        // "/start@SomeBot" in group chats
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
        let argument = parts.next().map(str::trim).unwrap_or_default();

        let command = match name.as_str() {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/auth" => Command::Auth,
            "/cancel" => Command::Cancel,
            "/status" => Command::Status,
            "/code" => match Self::authorization_code(argument) {
                Some(code) => Command::AuthorizationCode(code),
                None if !argument.is_empty() => {
                    Command::AuthorizationCode(AuthorizationCode::bare(argument))
                }
                None => Command::Help,
            },
            _ => Command::Unknown,
        };

        Some(command)
    }

    fn authorization_code(text: &str) -> Option<AuthorizationCode> {
        if GOOGLE_AUTH_CODE.is_match(text) {
            return Some(AuthorizationCode::bare(text));
        }

        if !HTTP_URL.is_match(text) {
            return None;
        }

        let has_code = Url::parse(text)
            .ok()?
            .query_pairs()
            .any(|(key, _)| key == "code");
        if has_code {
            AuthorizationCode::from_redirect(text)
        } else {
            None
        }
    }
}
