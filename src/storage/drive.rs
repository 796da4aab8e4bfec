// file: src/storage/drive.rs
// description: Google Drive v3 resumable upload protocol over reqwest
// reference: https://developers.google.com/drive/api/guides/manage-uploads#resumable

use crate::error::{RelayError, Result};
use crate::models::UploadMetadata;
use crate::storage::uploader::{ChunkOutcome, RemoteFile, ResumableStorage, UploadSession};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const UPLOAD_ENDPOINT: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=resumable&fields=id,webViewLink";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    web_view_link: Option<String>,
}

pub struct DriveClient {
    client: Client,
    endpoint: String,
}

impl DriveClient {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(UPLOAD_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            endpoint: endpoint.into(),
        })
    }

    async fn interpret(response: Response) -> Result<ChunkOutcome> {
        let status = response.status();

        if status.is_success() {
            let file: DriveFile = response.json().await.map_err(transport_error)?;
            let link = file
                .web_view_link
                .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", file.id));
            return Ok(ChunkOutcome::Complete(RemoteFile { id: file.id, link }));
        }

        if status == StatusCode::PERMANENT_REDIRECT {
            let acknowledged = response
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range_header)
                .unwrap_or(0);
            return Ok(ChunkOutcome::Incomplete { acknowledged });
        }

        Err(status_error(response).await)
    }
}

#[async_trait]
impl ResumableStorage for DriveClient {
    async fn create_session(
        &self,
        access_token: &str,
        metadata: &UploadMetadata,
        total_bytes: u64,
    ) -> Result<UploadSession> {
        let mut body = json!({
            "name": metadata.name,
            "mimeType": metadata.mime_type,
        });
        if let Some(folder) = &metadata.parent_folder {
            body["parents"] = json!([folder]);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(access_token)
            .header("X-Upload-Content-Type", metadata.mime_type.as_str())
            .header("X-Upload-Content-Length", total_bytes)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let uri = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RelayError::upload("session response has no Location header", true))?;

        debug!("Opened resumable session for {}", metadata.name);
        Ok(UploadSession { uri })
    }

    async fn upload_chunk(
        &self,
        access_token: &str,
        session: &UploadSession,
        offset: u64,
        chunk: Vec<u8>,
        total_bytes: u64,
    ) -> Result<ChunkOutcome> {
        let range = content_range(offset, chunk.len() as u64, total_bytes);
        let response = self
            .client
            .put(&session.uri)
            .bearer_auth(access_token)
            .header(CONTENT_LENGTH, chunk.len())
            .header(CONTENT_RANGE, range)
            .body(chunk)
            .send()
            .await
            .map_err(transport_error)?;

        Self::interpret(response).await
    }

    async fn query_status(
        &self,
        access_token: &str,
        session: &UploadSession,
        total_bytes: u64,
    ) -> Result<ChunkOutcome> {
        let response = self
            .client
            .put(&session.uri)
            .bearer_auth(access_token)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{}", total_bytes))
            .header(CONTENT_TYPE, "application/octet-stream")
            .send()
            .await
            .map_err(transport_error)?;

        Self::interpret(response).await
    }
}

/// `Content-Range` for a chunk starting at `offset`.
pub fn content_range(offset: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{}", total)
    } else {
        format!("bytes {}-{}/{}", offset, offset + len - 1, total)
    }
}

/// Reads the `Range: bytes=0-N` acknowledgment into the next offset.
pub fn parse_range_header(value: &str) -> Option<u64> {
    let (_, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.parse::<u64>().ok().map(|last| last + 1)
}

/// Server errors, throttling and expired tokens are worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn transport_error(err: reqwest::Error) -> RelayError {
    RelayError::upload(format!("transport error: {}", err), true)
}

async fn status_error(response: Response) -> RelayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let retryable = is_retryable_status(status);
    if !retryable {
        warn!("Drive rejected upload request: {} {}", status, body);
    }
    RelayError::upload(format!("Drive returned {}: {}", status, body.trim()), retryable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range() {
        assert_eq!(content_range(0, 262_144, 1_000_000), "bytes 0-262143/1000000");
        assert_eq!(
            content_range(786_432, 213_568, 1_000_000),
            "bytes 786432-999999/1000000"
        );
        assert_eq!(content_range(0, 0, 0), "bytes */0");
    }

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("bytes=0-262143"), Some(262_144));
        assert_eq!(parse_range_header("bytes=0-0"), Some(1));
        assert_eq!(parse_range_header("0-10"), None);
        assert_eq!(parse_range_header("bytes=0-"), None);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_drive_file_response() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"1AbC","webViewLink":"https://drive.google.com/file/d/1AbC/view?usp=drivesdk"}"#,
        )
        .unwrap();
        assert_eq!(file.id, "1AbC");
        assert!(file.web_view_link.unwrap().contains("1AbC"));
    }
}
