//! Upload error types.

use std::path::PathBuf;

use backhaul_storage::StorageError;
use backhaul_transfer::TransferError;

use crate::types::{ChunkUploadFailure, IncompleteUpload};

/// Errors produced by upload jobs.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Not fatal: the job logs it and returns an empty summary.
    #[error("source directory not found: {}", .0.display())]
    MissingSourceDirectory(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage connection failed: {0}")]
    Connection(#[source] StorageError),

    #[error(transparent)]
    ChunkUpload(#[from] ChunkUploadFailure),

    #[error(transparent)]
    IncompleteUpload(#[from] IncompleteUpload),

    #[error("transfer of {key_name} aborted: {source}")]
    TransferAborted {
        key_name: String,
        #[source]
        source: StorageError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("chunk planning failed: {0}")]
    Plan(#[from] TransferError),

    #[error("worker pool terminated")]
    PoolTerminated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
