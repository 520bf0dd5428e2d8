//! Multipart upload of local files to object storage.
//!
//! An [`UploadJob`] walks a source directory and hands each file to the
//! [`TransferOrchestrator`], which splits it into chunks, uploads them
//! concurrently through a [`WorkerPool`] of [`ChunkWorker`]s, verifies the
//! committed parts and then completes or cancels the multipart upload.

mod config;
mod error;
mod job;
mod orchestrator;
mod pool;
mod retry;
mod scanner;
mod types;
mod worker;

pub use config::{JobConfig, ROOT_PREFIX};
pub use error::UploadError;
pub use job::UploadJob;
pub use orchestrator::{TransferOrchestrator, Verified, key_name, verify_parts};
pub use pool::{Batch, WorkerPool};
pub use retry::RetryPolicy;
pub use scanner::scan_source_dir;
pub use types::{
    ChunkResult, ChunkUploadFailure, FileReport, IncompleteUpload, JobSummary, SourceFile,
    TransferState, UploadEvent, UploadTask,
};
pub use worker::ChunkWorker;
