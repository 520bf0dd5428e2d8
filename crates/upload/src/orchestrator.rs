//! Per-file transfer state machine.
//!
//! `NotStarted → Planning → Uploading → Verifying → Completing | Cancelling → Done`
//!
//! Once a multipart upload is open, every path out of [`TransferOrchestrator::transfer`]
//! ends with that upload either completed or cancelled.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use backhaul_storage::{Bucket, MultipartTransaction, ObjectHandle, PartReceipt, StorageError};
use backhaul_transfer::{Chunk, Throughput, format_rate, plan_chunks};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{JobConfig, ROOT_PREFIX};
use crate::error::UploadError;
use crate::pool::WorkerPool;
use crate::types::{
    ChunkResult, FileReport, IncompleteUpload, SourceFile, TransferState, UploadEvent, UploadTask,
};

/// Slot holding the multipart upload currently in flight, if any.
pub(crate) type ActiveTransaction = Arc<Mutex<Option<Arc<MultipartTransaction>>>>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builds the object key for `file_name`.
///
/// With the root bucket prefix the key is `/<key_prefix>/<file_name>`,
/// otherwise `<bucket_prefix>/<key_prefix>/<file_name>`.
pub fn key_name(bucket_prefix: &str, key_prefix: &str, file_name: &str) -> String {
    if bucket_prefix == ROOT_PREFIX {
        format!("/{key_prefix}/{file_name}")
    } else {
        format!("{bucket_prefix}/{key_prefix}/{file_name}")
    }
}

/// Parts confirmed by the service, matching the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub parts: Vec<PartReceipt>,
}

/// Compares the committed parts against the planned chunk count.
pub fn verify_parts(
    key_name: &str,
    expected: usize,
    committed: Vec<PartReceipt>,
) -> Result<Verified, IncompleteUpload> {
    if committed.len() == expected {
        Ok(Verified { parts: committed })
    } else {
        Err(IncompleteUpload {
            key_name: key_name.to_string(),
            expected,
            actual: committed.len(),
        })
    }
}

/// Uploads single files through a shared worker pool.
pub struct TransferOrchestrator {
    config: Arc<JobConfig>,
    bucket: Arc<dyn Bucket>,
    pool: Arc<WorkerPool>,
    active: ActiveTransaction,
    events: Option<mpsc::Sender<UploadEvent>>,
    state: Mutex<TransferState>,
}

impl TransferOrchestrator {
    pub(crate) fn new(
        config: Arc<JobConfig>,
        bucket: Arc<dyn Bucket>,
        pool: Arc<WorkerPool>,
        active: ActiveTransaction,
        events: Option<mpsc::Sender<UploadEvent>>,
    ) -> Self {
        Self {
            config,
            bucket,
            pool,
            active,
            events,
            state: Mutex::new(TransferState::NotStarted),
        }
    }

    /// State of the most recent transfer.
    pub fn state(&self) -> TransferState {
        *lock(&self.state)
    }

    fn set_state(&self, key: &str, next: TransferState) {
        let mut state = lock(&self.state);
        debug!(key = %key, from = ?*state, to = ?next, "transfer state");
        *state = next;
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    /// Uploads one file as a multipart upload.
    pub async fn transfer(&self, file: &SourceFile) -> Result<FileReport, UploadError> {
        let started = Instant::now();
        let key = key_name(&self.config.bucket_prefix, &self.config.key_prefix, &file.name);

        self.set_state(&key, TransferState::Planning);
        let chunks = match plan_chunks(file.size, self.config.chunk_size()) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.set_state(&key, TransferState::Done);
                return Err(e.into());
            }
        };

        info!(
            bucket = %self.config.bucket,
            key = %key,
            size = file.size,
            chunks = chunks.len(),
            threads = self.pool.size(),
            chunk_size_mb = self.config.chunk_size_mb,
            retries = self.config.retries,
            "starting upload"
        );
        self.emit(UploadEvent::FileStarted {
            key_name: key.clone(),
            size: file.size,
            chunks: chunks.len(),
        });

        if self.pool.is_terminated() {
            self.set_state(&key, TransferState::Done);
            return Err(UploadError::PoolTerminated);
        }

        self.set_state(&key, TransferState::Uploading);
        let txn = match MultipartTransaction::initiate(Arc::clone(&self.bucket), &key).await {
            Ok(txn) => Arc::new(txn),
            Err(source) => {
                self.set_state(&key, TransferState::Done);
                return Err(UploadError::TransferAborted {
                    key_name: key,
                    source,
                });
            }
        };
        *lock(&self.active) = Some(Arc::clone(&txn));
        // A shutdown that ran while initiate was pending found the slot empty.
        if self.pool.is_terminated() {
            return Err(self.cancel(&key, &txn, UploadError::PoolTerminated).await);
        }

        let throughput = Throughput::new();
        let verified = match self.upload_and_verify(&key, file, &chunks, &txn, &throughput).await {
            Ok(verified) => verified,
            Err(e) => return Err(self.cancel(&key, &txn, e).await),
        };

        self.set_state(&key, TransferState::Completing);
        if let Err(source) = txn.complete(&verified.parts).await {
            let err = UploadError::TransferAborted {
                key_name: key.clone(),
                source,
            };
            return Err(self.cancel(&key, &txn, err).await);
        }
        self.clear_active(&txn);

        let result = self.finish(&key, file).await;
        self.set_state(&key, TransferState::Done);
        result?;

        let elapsed = started.elapsed();
        info!(
            key = %key,
            bytes = file.size,
            elapsed_ms = elapsed.as_millis() as u64,
            rate = %format_rate(throughput.rate()),
            "upload completed"
        );
        self.emit(UploadEvent::FileCompleted {
            key_name: key.clone(),
            bytes: file.size,
        });

        Ok(FileReport {
            key_name: key,
            size: file.size,
            parts: verified.parts.len(),
            elapsed,
        })
    }

    async fn upload_and_verify(
        &self,
        key: &str,
        file: &SourceFile,
        chunks: &[Chunk],
        txn: &MultipartTransaction,
        throughput: &Throughput,
    ) -> Result<Verified, UploadError> {
        let endpoint = self.config.endpoint();
        let retry = self.config.retry_policy();

        let mut batch = self.pool.batch()?;
        for chunk in chunks {
            batch.submit(UploadTask {
                bucket: self.config.bucket.clone(),
                endpoint: endpoint.clone(),
                key_name: key.to_string(),
                upload_id: txn.id().to_string(),
                source: file.path.clone(),
                chunk: *chunk,
                retry: retry.clone(),
            })?;
        }

        let mut results: Vec<ChunkResult> = Vec::with_capacity(chunks.len());
        while let Some(result) = batch.next_result().await? {
            if result.is_success() {
                throughput.record(result.bytes);
                debug!(
                    key = %key,
                    part = result.part_number,
                    uploaded = throughput.bytes(),
                    total = file.size,
                    rate = %format_rate(throughput.recent_rate()),
                    "chunk done"
                );
            }
            self.emit(UploadEvent::ChunkFinished {
                key_name: key.to_string(),
                part_number: result.part_number,
                bytes: result.bytes,
                attempts: result.attempts,
                success: result.is_success(),
            });
            results.push(result);
        }

        self.set_state(key, TransferState::Verifying);
        let committed = txn
            .list_parts()
            .await
            .map_err(|source| UploadError::TransferAborted {
                key_name: key.to_string(),
                source,
            })?;

        match verify_parts(key, chunks.len(), committed) {
            Ok(verified) => Ok(verified),
            Err(incomplete) => {
                let first_failure = results
                    .iter()
                    .filter_map(|r| r.outcome.as_ref().err())
                    .min_by_key(|f| f.part_number)
                    .cloned();
                match first_failure {
                    Some(failure) => Err(failure.into()),
                    None => Err(incomplete.into()),
                }
            }
        }
    }

    /// Applies the access policy and removes the local file if asked to.
    async fn finish(&self, key: &str, file: &SourceFile) -> Result<(), UploadError> {
        ObjectHandle::new(Arc::clone(&self.bucket), key)
            .set_access_policy(&self.config.acl)
            .await
            .map_err(|source| UploadError::TransferAborted {
                key_name: key.to_string(),
                source,
            })?;

        if self.config.remove_uploaded {
            tokio::fs::remove_file(&file.path).await?;
            debug!(path = %file.path.display(), "removed uploaded source file");
        }
        Ok(())
    }

    async fn cancel(&self, key: &str, txn: &Arc<MultipartTransaction>, err: UploadError) -> UploadError {
        self.set_state(key, TransferState::Cancelling);
        error!(key = %key, error = %err, "upload failed, cancelling");

        match txn.cancel().await {
            Ok(true) => info!(key = %key, upload_id = %txn.id(), "multipart upload cancelled"),
            Ok(false) => debug!(key = %key, "multipart upload already finished"),
            Err(e) => warn!(key = %key, upload_id = %txn.id(), error = %e, "cancelling multipart upload failed"),
        }
        self.clear_active(txn);
        self.emit(UploadEvent::FileCancelled {
            key_name: key.to_string(),
            reason: err.to_string(),
        });
        self.set_state(key, TransferState::Done);
        err
    }

    fn clear_active(&self, txn: &Arc<MultipartTransaction>) {
        let mut slot = lock(&self.active);
        if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, txn)) {
            *slot = None;
        }
    }
}

/// Returns true for storage errors caused by a concurrent forced shutdown.
pub(crate) fn is_shutdown_error(err: &UploadError) -> bool {
    matches!(
        err,
        UploadError::PoolTerminated
            | UploadError::TransferAborted {
                source: StorageError::TransactionFinished(_) | StorageError::NoSuchUpload(_),
                ..
            }
    )
}
