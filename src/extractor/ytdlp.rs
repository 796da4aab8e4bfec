// file: src/extractor/ytdlp.rs
// description: yt-dlp driven through tokio::process with line-based progress parsing
// reference: https://github.com/yt-dlp/yt-dlp#output-template

use crate::extractor::adapter::{ExtractOptions, MediaExtractor};
use crate::extractor::patterns::PROGRESS_LINE;
use crate::models::ExtractedMedia;
use crate::pipeline::progress::DownloadProgressFn;
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};
use walkdir::WalkDir;

const PROGRESS_TEMPLATE: &str = "download:relay-progress %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.eta)s";

const STDERR_TAIL_LINES: usize = 20;

const THUMBNAIL_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Subset of the info JSON printed after the file is moved into place.
#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(default)]
    filepath: Option<PathBuf>,
    #[serde(default, rename = "_filename")]
    filename: Option<PathBuf>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    #[serde(default)]
    filepath: Option<PathBuf>,
}

pub struct YtDlpExtractor {
    binary: String,
    timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn build_args(url: &str, options: &ExtractOptions) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--print".to_string(),
            "after_move:%()j".to_string(),
            "--no-playlist".to_string(),
            "--no-simulate".to_string(),
            "--write-thumbnail".to_string(),
            "-f".to_string(),
            options.format_hint.clone(),
            "-o".to_string(),
            options
                .output_dir
                .join("%(id)s.%(ext)s")
                .to_string_lossy()
                .into_owned(),
        ];

        if let Some(cookies) = &options.cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }

        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    async fn run(
        &self,
        url: &str,
        options: &ExtractOptions,
        on_progress: DownloadProgressFn,
    ) -> anyhow::Result<ExtractedMedia> {
        let mut child = Command::new(&self.binary)
            .args(Self::build_args(url, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("extractor stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("extractor stderr not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(target: "yt-dlp", "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let mut info_line = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some((fraction, eta)) = parse_progress_line(&line) {
                on_progress(fraction, eta);
            } else if line.starts_with('{') {
                info_line = Some(line);
            } else {
                debug!(target: "yt-dlp", "{}", line);
            }
        }

        let status = child.wait().await.context("failed to wait for extractor")?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let detail = stderr_tail
                .lines()
                .rev()
                .find(|l| l.starts_with("ERROR"))
                .map(str::to_string)
                .unwrap_or(stderr_tail);
            bail!("{} exited with {}: {}", self.binary, status, detail);
        }

        let info_line =
            info_line.ok_or_else(|| anyhow!("extractor finished without printing media info"))?;
        let media = parse_info_json(&info_line, &options.output_dir)?;
        on_progress(1.0, Some(0));
        Ok(media)
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn extract(
        &self,
        url: &str,
        options: &ExtractOptions,
        on_progress: DownloadProgressFn,
    ) -> anyhow::Result<ExtractedMedia> {
        match tokio::time::timeout(self.timeout, self.run(url, options, on_progress)).await {
            Ok(result) => result,
            Err(_) => bail!("extractor timed out after {}s", self.timeout.as_secs()),
        }
    }

    async fn version(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {} --version", self.binary))?;

        if !output.status.success() {
            bail!("{} --version exited with {}", self.binary, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn parse_number(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parses one `relay-progress` line into `(fraction, eta_seconds)`.
pub fn parse_progress_line(line: &str) -> Option<(f64, Option<u64>)> {
    let caps = PROGRESS_LINE.captures(line.trim())?;

    let downloaded = parse_number(&caps[1])?;
    let total = parse_number(&caps[2])
        .or_else(|| parse_number(&caps[3]))
        .filter(|t| *t > 0.0)?;
    let eta = parse_number(&caps[4]).map(|e| e.max(0.0) as u64);

    Some(((downloaded / total).clamp(0.0, 1.0), eta))
}

/// Builds the artifact description from the printed info JSON. The size is
/// what landed on disk.
pub fn parse_info_json(line: &str, output_dir: &Path) -> anyhow::Result<ExtractedMedia> {
    let info: InfoJson = serde_json::from_str(line).context("unreadable extractor info JSON")?;

    let local_path = info
        .filepath
        .or(info.filename)
        .ok_or_else(|| anyhow!("extractor info has no file path"))?;
    let size_bytes = std::fs::metadata(&local_path)
        .with_context(|| format!("downloaded file missing at {}", local_path.display()))?
        .len();

    let thumbnail_path = info
        .thumbnails
        .into_iter()
        .rev()
        .filter_map(|t| t.filepath)
        .find(|p| p.exists())
        .or_else(|| find_thumbnail(output_dir, &local_path));

    let title = info.title.unwrap_or_else(|| {
        local_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string())
    });

    Ok(ExtractedMedia {
        local_path,
        title,
        duration_seconds: info.duration,
        size_bytes,
        thumbnail_path,
    })
}

fn find_thumbnail(output_dir: &Path, media: &Path) -> Option<PathBuf> {
    let stem = media.file_stem()?.to_string_lossy().into_owned();

    WalkDir::new(output_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .find(|path| {
            let same_stem = path
                .file_stem()
                .map(|s| s.to_string_lossy() == stem)
                .unwrap_or(false);
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| THUMBNAIL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            same_stem && is_image && path != media
        })
}
