// file: src/utils/validation.rs
// description: input validation utilities and helpers
// reference: input validation patterns

use crate::error::{RelayError, Result};
use crate::extractor::patterns::{HTTP_URL, YOUTUBE_URL};
use std::fs;
use std::path::Path;
use url::Url;

pub struct Validator;

impl Validator {
    /// Accepts only http(s) links whose host is one of `supported_hosts`
    /// (or a subdomain of one). YouTube hosts must also carry a video id.
    pub fn validate_source_url(url: &str, supported_hosts: &[String]) -> Result<Url> {
        let trimmed = url.trim();

        if !HTTP_URL.is_match(trimmed) {
            return Err(RelayError::InvalidInput(format!(
                "Invalid URL format: {}",
                Self::truncate_text(trimmed, 80)
            )));
        }

        let parsed = Url::parse(trimmed)
            .map_err(|e| RelayError::InvalidInput(format!("Cannot parse {}: {}", trimmed, e)))?;

        let host = parsed
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| RelayError::InvalidInput(format!("URL has no host: {}", trimmed)))?;

        let supported = supported_hosts.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{}", allowed))
        });

        if !supported {
            return Err(RelayError::InvalidInput(format!(
                "Unsupported source: {}",
                host
            )));
        }

        if host.contains("youtu") && !YOUTUBE_URL.is_match(trimmed) {
            return Err(RelayError::InvalidInput(format!(
                "Not a video link: {}",
                Self::truncate_text(trimmed, 80)
            )));
        }

        Ok(parsed)
    }

    pub fn validate_directory(path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(RelayError::Config(format!(
                "Directory does not exist: {}",
                path.display()
            )));
        }

        if !path.is_dir() {
            return Err(RelayError::Config(format!(
                "Path is not a directory: {}",
                path.display()
            )));
        }

        Ok(())
    }

    /// Checks that the artifact on disk has exactly the size the extractor reported.
    pub fn validate_file_size(path: &Path, expected: u64) -> Result<u64> {
        let metadata = fs::metadata(path).map_err(|e| {
            RelayError::download(
                format!("Artifact missing at {}: {}", path.display(), e),
                false,
            )
        })?;

        if !metadata.is_file() {
            return Err(RelayError::download(
                format!("Artifact is not a file: {}", path.display()),
                false,
            ));
        }

        if metadata.len() != expected {
            return Err(RelayError::download(
                format!(
                    "Size mismatch for {}: reported {} bytes, wrote {} bytes",
                    path.display(),
                    expected,
                    metadata.len()
                ),
                false,
            ));
        }

        Ok(metadata.len())
    }

    /// Makes a video title safe to use as a file name.
    pub fn sanitize_file_name(title: &str) -> String {
        let cleaned: String = title
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();

        let cleaned = cleaned.trim().trim_matches('.').trim();
        if cleaned.is_empty() {
            "video".to_string()
        } else {
            Self::truncate_text(cleaned, 200)
        }
    }

    pub fn truncate_text(text: &str, max_length: usize) -> String {
        if text.chars().count() <= max_length {
            text.to_string()
        } else {
            let truncated: String = text.chars().take(max_length).collect();
            format!("{}...", truncated)
        }
    }
}
