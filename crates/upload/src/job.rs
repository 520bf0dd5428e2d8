//! Directory upload job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use backhaul_storage::{Connection, Connector};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::JobConfig;
use crate::error::UploadError;
use crate::orchestrator::{ActiveTransaction, TransferOrchestrator, is_shutdown_error, lock};
use crate::pool::WorkerPool;
use crate::scanner::scan_source_dir;
use crate::types::{JobSummary, UploadEvent};

/// Uploads every file of a source directory, one file at a time.
///
/// The job owns one storage connection and one [`WorkerPool`] for its whole
/// lifetime. [`close`](Self::close) is the forced-shutdown path: it may be
/// called at any point, any number of times, including while
/// [`run`](Self::run) is in progress on another task.
pub struct UploadJob {
    config: Arc<JobConfig>,
    connection: Arc<dyn Connection>,
    pool: Arc<WorkerPool>,
    orchestrator: TransferOrchestrator,
    active: ActiveTransaction,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    closed: AtomicBool,
}

impl UploadJob {
    /// Validates `config`, connects to storage, resolves the bucket and
    /// starts the worker pool.
    pub async fn connect(
        config: JobConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, UploadError> {
        config.validate()?;

        let endpoint = config.endpoint();
        let connection = connector
            .connect(&endpoint)
            .await
            .map_err(UploadError::Connection)?;
        let bucket = match connection.bucket(&config.bucket).await {
            Ok(bucket) => bucket,
            Err(e) => {
                let _ = connection.close().await;
                return Err(UploadError::Connection(e));
            }
        };
        info!(endpoint = %endpoint.url(), bucket = %config.bucket, "connected to storage");

        let config = Arc::new(config);
        let pool = Arc::new(WorkerPool::new(config.thread_count, connector));
        let active = ActiveTransaction::default();
        let (events_tx, events_rx) = mpsc::channel(256);
        let orchestrator = TransferOrchestrator::new(
            Arc::clone(&config),
            bucket,
            Arc::clone(&pool),
            Arc::clone(&active),
            Some(events_tx),
        );

        Ok(Self {
            config,
            connection,
            pool,
            orchestrator,
            active,
            events_rx: Some(events_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Uploads the source directory.
    ///
    /// A missing source directory is logged and yields an empty summary.
    /// The first failing file aborts the job: remaining files are left
    /// untouched and [`close`](Self::close) runs before the error returns.
    pub async fn run(&self) -> Result<JobSummary, UploadError> {
        if self.is_closed() {
            return Err(UploadError::PoolTerminated);
        }

        let dir = &self.config.source_dir;
        if !dir.is_dir() {
            let err = UploadError::MissingSourceDirectory(dir.clone());
            error!(error = %err, "nothing to upload");
            return Ok(JobSummary::default());
        }

        let files = match scan_source_dir(dir) {
            Ok(files) => files,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "scanning source directory failed");
                self.close().await;
                return Err(e);
            }
        };
        info!(dir = %dir.display(), files = files.len(), "uploading source directory");

        let mut summary = JobSummary::default();
        for file in &files {
            match self.orchestrator.transfer(file).await {
                Ok(report) => summary.files.push(report),
                Err(e) => {
                    if self.is_closed() && is_shutdown_error(&e) {
                        warn!(file = %file.name, "upload interrupted by shutdown");
                    } else {
                        error!(file = %file.name, error = %e, "upload job aborted");
                    }
                    self.close().await;
                    return Err(e);
                }
            }
        }

        if self.config.remove_uploaded {
            summary.source_removed = match self.remove_source_dir().await {
                Ok(removed) => removed,
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            };
        }

        info!(
            files = summary.files_uploaded(),
            bytes = summary.bytes_uploaded(),
            "upload job finished"
        );
        Ok(summary)
    }

    /// Removes the emptied source directory. Skipped entries keep it alive;
    /// any other failure is an error.
    async fn remove_source_dir(&self) -> Result<bool, UploadError> {
        let dir = &self.config.source_dir;
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => {
                info!(dir = %dir.display(), "removed source directory");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                warn!(dir = %dir.display(), "source directory not empty, keeping it");
                Ok(false)
            }
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "removing source directory failed");
                Err(UploadError::Io(e))
            }
        }
    }

    /// Forced shutdown: terminates the pool, cancels any multipart upload
    /// still open and closes the storage connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(workers = self.pool.size(), "terminating worker pool");
        self.pool.terminate().await;

        let open = lock(&self.active).take();
        if let Some(txn) = open {
            info!(key = %txn.key(), upload_id = %txn.id(), "cancelling open multipart upload");
            match txn.cancel().await {
                Ok(true) => {}
                Ok(false) => info!(key = %txn.key(), "multipart upload already finished"),
                Err(e) => {
                    error!(key = %txn.key(), upload_id = %txn.id(), error = %e, "cancelling multipart upload failed")
                }
            }
        }

        info!("closing storage connection");
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "closing storage connection failed");
        }
    }
}
