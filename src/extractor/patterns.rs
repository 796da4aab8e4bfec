// file: src/extractor/patterns.rs
// description: compiled regex patterns for link detection and failure classification
// reference: https://docs.rs/regex

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Inbound message shapes
    pub static ref HTTP_URL: Regex = Regex::new(
        r"(?i)^https?://[^\s]+$"
    ).expect("HTTP_URL regex is valid");

    pub static ref YOUTUBE_URL: Regex = Regex::new(
        r"(?i)^https?://(?:www\.|m\.|music\.)?(?:youtube\.com/(?:watch\?(?:[^\s]*&)?v=|shorts/|live/|embed/)|youtu\.be/|youtube-nocookie\.com/embed/)[A-Za-z0-9_-]{11}"
    ).expect("YOUTUBE_URL regex is valid");

    pub static ref GOOGLE_AUTH_CODE: Regex = Regex::new(
        r"^\d/[0-9A-Za-z_-]{10,}$"
    ).expect("GOOGLE_AUTH_CODE regex is valid");

    // Extractor failure text
    pub static ref PERMANENT_FAILURE: Regex = Regex::new(
        r"(?i)(video unavailable|private video|has been removed|removed by the uploader|account .*terminated|copyright|sign in to confirm|members-only|join this channel|requires payment|paywall|unsupported url|is not a valid url|age.restricted|HTTP Error (?:400|401|403|404|410))"
    ).expect("PERMANENT_FAILURE regex is valid");

    pub static ref TRANSIENT_FAILURE: Regex = Regex::new(
        r"(?i)(timed? ?out|timeout|connection (?:reset|refused|aborted)|temporar(?:y|ily)|too many requests|rate.?limit|HTTP Error (?:429|5\d\d)|network is unreachable|incompleteread|unable to download video data|name resolution|broken pipe)"
    ).expect("TRANSIENT_FAILURE regex is valid");

    // yt-dlp progress line emitted through --progress-template
    pub static ref PROGRESS_LINE: Regex = Regex::new(
        r"^relay-progress (\S+) (\S+) (\S+) (\S+)$"
    ).expect("PROGRESS_LINE regex is valid");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Classifies opaque extractor error text. Permanent markers win over
/// transient ones, and unknown failures are not retried.
pub fn classify_failure(message: &str) -> FailureClass {
    if PERMANENT_FAILURE.is_match(message) {
        FailureClass::Permanent
    } else if TRANSIENT_FAILURE.is_match(message) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

pub fn is_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url.trim())
}
