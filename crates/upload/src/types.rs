use std::path::PathBuf;
use std::time::Duration;

use backhaul_storage::{Endpoint, PartReceipt};
use backhaul_transfer::Chunk;

use crate::retry::RetryPolicy;

/// Everything a worker needs to upload one chunk.
///
/// Plain data only: a worker rebuilds its own storage session from
/// `endpoint` and opens `source` itself.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub bucket: String,
    pub endpoint: Endpoint,
    pub key_name: String,
    pub upload_id: String,
    pub source: PathBuf,
    pub chunk: Chunk,
    pub retry: RetryPolicy,
}

/// A chunk that could not be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("part {part_number} failed after {attempts} attempt(s): {last_error}")]
pub struct ChunkUploadFailure {
    pub part_number: u16,
    pub attempts: u32,
    pub last_error: String,
}

/// Outcome of one worker invocation.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub part_number: u16,
    pub bytes: u64,
    pub attempts: u32,
    pub outcome: Result<PartReceipt, ChunkUploadFailure>,
}

impl ChunkResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// The service committed fewer (or more) parts than were planned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upload of {key_name} is incomplete: expected {expected} parts, found {actual}")]
pub struct IncompleteUpload {
    pub key_name: String,
    pub expected: usize,
    pub actual: usize,
}

/// Per-file transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    Planning,
    Uploading,
    Verifying,
    Completing,
    Cancelling,
    Done,
}

/// A regular file found in the source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A successfully uploaded file.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub key_name: String,
    pub size: u64,
    pub parts: usize,
    pub elapsed: Duration,
}

/// What an upload job achieved.
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub files: Vec<FileReport>,
    /// True if the source directory was removed after the last file.
    pub source_removed: bool,
}

impl JobSummary {
    pub fn files_uploaded(&self) -> usize {
        self.files.len()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Progress notifications emitted while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    FileStarted {
        key_name: String,
        size: u64,
        chunks: usize,
    },
    ChunkFinished {
        key_name: String,
        part_number: u16,
        bytes: u64,
        attempts: u32,
        success: bool,
    },
    FileCompleted {
        key_name: String,
        bytes: u64,
    },
    FileCancelled {
        key_name: String,
        reason: String,
    },
}
