// file: src/extractor/mod.rs
// description: media extraction module exports
// reference: internal module structure

pub mod adapter;
pub mod patterns;
pub mod ytdlp;

pub use adapter::{ExtractOptions, ExtractionAdapter, MediaExtractor};
pub use ytdlp::YtDlpExtractor;
