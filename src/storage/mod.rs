// file: src/storage/mod.rs
// description: remote storage module exports
// reference: internal module structure

pub mod drive;
pub mod uploader;

pub use drive::DriveClient;
pub use uploader::{
    ChunkOutcome, RemoteFile, ResumableStorage, UploadAdapter, UploadSession, upload_metadata,
};
