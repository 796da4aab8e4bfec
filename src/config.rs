// file: src/config.rs
// description: application configuration management with toml support
// reference: https://docs.rs/config

use crate::error::{RelayError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Google Drive requires every non-final chunk to be a multiple of 256 KiB.
pub const UPLOAD_CHUNK_GRANULARITY: usize = 256 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub drive: DriveConfig,
    pub extractor: ExtractorConfig,
    pub pipeline: PipelineConfig,
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub api_base: String,
    pub poll_timeout_secs: u64,
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriveConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    pub redirect_uri: String,
    pub token_path: PathBuf,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub chunk_size_kb: usize,
    pub mime_type: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractorConfig {
    pub binary: String,
    pub format_hint: String,
    #[serde(default)]
    pub cookies_base64: Option<String>,
    pub download_dir: PathBuf,
    pub timeout_secs: u64,
    pub supported_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_artifact_size_mb: u64,
    pub authorization_ttl_secs: u64,
    #[serde(default)]
    pub send_video_max_mb: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgressConfig {
    pub min_interval_ms: u64,
    pub min_step_percent: f64,
    pub channel_capacity: usize,
}

/// Shape of the `credentials.json` file downloaded from the Google console.
#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecretEntry>,
    web: Option<ClientSecretEntry>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretEntry {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv().ok();

        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        } else {
            builder = builder.add_source(config::File::from(Path::new("config/default.toml")));
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix("TUBE_RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("telegram.bot_token", std::env::var("TELEGRAM_BOT_TOKEN").ok())
            .map_err(|e| RelayError::Config(e.to_string()))?
            .set_override_option("extractor.cookies_base64", std::env::var("YOUTUBE_COOKIES").ok())
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let settings = builder
            .build()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        config.apply_client_secret_file()?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            telegram: TelegramConfig {
                bot_token: String::new(),
                api_base: "https://api.telegram.org".to_string(),
                poll_timeout_secs: 30,
                allowed_chat_ids: vec![],
            },
            drive: DriveConfig {
                client_id: String::new(),
                client_secret: String::new(),
                client_secret_file: None,
                redirect_uri: "http://localhost:8080/".to_string(),
                token_path: PathBuf::from("data/token.json"),
                scopes: vec!["https://www.googleapis.com/auth/drive.file".to_string()],
                folder_id: None,
                chunk_size_kb: 8192,
                mime_type: "video/mp4".to_string(),
            },
            extractor: ExtractorConfig {
                binary: "yt-dlp".to_string(),
                format_hint: "best[ext=mp4]/best".to_string(),
                cookies_base64: None,
                download_dir: PathBuf::from("downloads"),
                timeout_secs: 1800,
                supported_hosts: vec![
                    "youtube.com".to_string(),
                    "youtu.be".to_string(),
                    "youtube-nocookie.com".to_string(),
                ],
            },
            pipeline: PipelineConfig {
                max_attempts: 3,
                backoff_base_ms: 1000,
                backoff_max_ms: 30_000,
                max_artifact_size_mb: 2048,
                authorization_ttl_secs: 600,
                send_video_max_mb: 0,
            },
            progress: ProgressConfig {
                min_interval_ms: 3000,
                min_step_percent: 5.0,
                channel_capacity: 256,
            },
        }
    }

    fn apply_client_secret_file(&mut self) -> Result<()> {
        let Some(path) = self.drive.client_secret_file.clone() else {
            return Ok(());
        };

        let contents = std::fs::read_to_string(&path)
            .map_err(|source| RelayError::file_operation(&path, source))?;
        let file: ClientSecretFile = serde_json::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Invalid client secret file: {}", e)))?;

        let entry = file.installed.or(file.web).ok_or_else(|| {
            RelayError::Config("client secret file has no installed/web section".to_string())
        })?;

        if self.drive.client_id.is_empty() {
            self.drive.client_id = entry.client_id;
        }
        if self.drive.client_secret.is_empty() {
            self.drive.client_secret = entry.client_secret;
        }
        if let Some(uri) = entry.redirect_uris.into_iter().next() {
            self.drive.redirect_uri = uri;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.max_attempts == 0 {
            return Err(RelayError::Config(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.drive.scopes.is_empty() {
            return Err(RelayError::Config(
                "at least one drive scope is required".to_string(),
            ));
        }

        let chunk_bytes = self.drive.chunk_size_bytes();
        if chunk_bytes == 0 || chunk_bytes % UPLOAD_CHUNK_GRANULARITY != 0 {
            return Err(RelayError::Config(format!(
                "chunk_size_kb must be a non-zero multiple of {}",
                UPLOAD_CHUNK_GRANULARITY / 1024
            )));
        }

        if self.progress.min_step_percent <= 0.0 || self.progress.min_step_percent > 100.0 {
            return Err(RelayError::Config(
                "min_step_percent must be within (0, 100]".to_string(),
            ));
        }

        if self.progress.channel_capacity == 0 {
            return Err(RelayError::Config(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.extractor.supported_hosts.is_empty() {
            return Err(RelayError::Config(
                "supported_hosts cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DriveConfig {
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_kb * 1024
    }
}

impl PipelineConfig {
    pub fn max_artifact_bytes(&self) -> u64 {
        self.max_artifact_size_mb * 1_048_576
    }

    pub fn authorization_ttl(&self) -> Duration {
        Duration::from_secs(self.authorization_ttl_secs)
    }
}

impl ProgressConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl ExtractorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
