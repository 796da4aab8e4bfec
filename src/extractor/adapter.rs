// file: src/extractor/adapter.rs
// description: retrying download adapter around the media extractor black box
// reference: classified retry with exponential backoff over an opaque extractor

use crate::config::ExtractorConfig;
use crate::error::{RelayError, Result};
use crate::extractor::patterns::{FailureClass, classify_failure};
use crate::models::ExtractedMedia;
use crate::pipeline::progress::{DownloadProgressFn, ProgressSender};
use crate::utils::retry::{RetryPolicy, retry_with_backoff};
use crate::utils::{OperationTimer, Validator};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

const COOKIES_FILE: &str = "cookies.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub format_hint: String,
    pub cookies_path: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// The extractor black box. Failures are opaque text; the adapter decides
/// whether they are worth retrying.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn extract(
        &self,
        url: &str,
        options: &ExtractOptions,
        on_progress: DownloadProgressFn,
    ) -> anyhow::Result<ExtractedMedia>;

    async fn version(&self) -> anyhow::Result<String> {
        Ok("unknown".to_string())
    }
}

pub struct ExtractionAdapter {
    extractor: Arc<dyn MediaExtractor>,
    config: ExtractorConfig,
    retry: RetryPolicy,
}

impl ExtractionAdapter {
    pub fn new(extractor: Arc<dyn MediaExtractor>, config: ExtractorConfig, retry: RetryPolicy) -> Self {
        Self {
            extractor,
            config,
            retry,
        }
    }

    pub fn validate(&self, url: &str) -> Result<url::Url> {
        Validator::validate_source_url(url, &self.config.supported_hosts)
    }

    pub fn extractor(&self) -> &Arc<dyn MediaExtractor> {
        &self.extractor
    }

    /// Downloads `url` into `workdir`. `attempt` is the job's counter for
    /// this phase and ends at the number of extractor runs made.
    pub async fn download(
        &self,
        url: &str,
        workdir: &Path,
        progress: &ProgressSender,
        attempt: &mut u32,
    ) -> Result<ExtractedMedia> {
        let url = self.validate(url)?.to_string();

        fs::create_dir_all(workdir)
            .await
            .map_err(|source| RelayError::file_operation(workdir, source))?;

        let options = ExtractOptions {
            format_hint: self.config.format_hint.clone(),
            cookies_path: self.write_cookies(workdir).await?,
            output_dir: workdir.to_path_buf(),
        };

        let timer = OperationTimer::new(format!("download {}", progress.job_id()));
        let on_progress = progress.download_callback();

        let media = retry_with_backoff(&self.retry, attempt, "download", |n| {
            let extractor = Arc::clone(&self.extractor);
            let options = options.clone();
            let on_progress = Arc::clone(&on_progress);
            let url = url.clone();
            async move {
                info!(attempt = n, "Starting extractor for {}", url);
                extractor
                    .extract(&url, &options, on_progress)
                    .await
                    .map_err(classify)
            }
        })
        .await?;

        Validator::validate_file_size(&media.local_path, media.size_bytes)?;
        timer.finish_with_bytes(media.size_bytes);
        Ok(media)
    }

    async fn write_cookies(&self, workdir: &Path) -> Result<Option<PathBuf>> {
        let Some(encoded) = self
            .config
            .cookies_base64
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        else {
            return Ok(None);
        };

        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| RelayError::Config(format!("cookies are not valid base64: {}", e)))?;

        let path = workdir.join(COOKIES_FILE);
        fs::write(&path, decoded)
            .await
            .map_err(|source| RelayError::file_operation(&path, source))?;
        Ok(Some(path))
    }
}

fn classify(err: anyhow::Error) -> RelayError {
    let message = format!("{:#}", err);
    let transient = classify_failure(&message) == FailureClass::Transient;
    if !transient {
        warn!("Extractor failed permanently: {}", message);
    }
    RelayError::download(message, transient)
}
