//! Single-chunk upload with bounded retries.

use std::sync::Arc;

use backhaul_storage::{
    Bucket, Connection, Connector, Endpoint, MultipartTransaction, PartReceipt, PartUpload,
};
use backhaul_transfer::{ChunkData, ChunkReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::types::{ChunkResult, ChunkUploadFailure, UploadTask};

/// Why one attempt failed.
#[derive(Debug)]
struct AttemptError {
    message: String,
    transient: bool,
}

impl AttemptError {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Storage session a worker keeps between tasks of the same bucket.
struct Session {
    endpoint: Endpoint,
    bucket_name: String,
    connection: Arc<dyn Connection>,
    bucket: Arc<dyn Bucket>,
}

/// Uploads chunks as parts of an open multipart upload.
///
/// A worker shares nothing with the coordinator except the [`UploadTask`]
/// it is given: it opens its own storage session and its own file handle
/// per attempt.
pub struct ChunkWorker {
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    session: Option<Session>,
}

impl ChunkWorker {
    pub fn new(connector: Arc<dyn Connector>, cancel: CancellationToken) -> Self {
        Self {
            connector,
            cancel,
            session: None,
        }
    }

    /// Uploads `task.chunk`, retrying transient failures up to
    /// `task.retry.retries` more times.
    pub async fn run(&mut self, task: UploadTask) -> ChunkResult {
        let part_number = task.chunk.part_number;
        let max_attempts = task.retry.max_attempts();
        let cancel = self.cancel.clone();
        let mut attempts = 0;

        let last_error = loop {
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AttemptError::permanent("cancelled")),
                r = self.attempt(&task) => r,
            };

            let err = match outcome {
                Ok(receipt) => {
                    debug!(key = %task.key_name, part = part_number, attempts, "part uploaded");
                    return ChunkResult {
                        part_number,
                        bytes: task.chunk.length,
                        attempts,
                        outcome: Ok(receipt),
                    };
                }
                Err(e) => e,
            };

            if err.transient {
                // The session may be what failed; rebuild it next time.
                self.drop_session().await;
            }
            if !err.transient || attempts >= max_attempts {
                break err.message;
            }

            let delay = task.retry.delay_for_attempt(attempts);
            warn!(
                key = %task.key_name,
                part = part_number,
                attempt = attempts,
                max_attempts,
                error = %err.message,
                retry_in_ms = delay.as_millis() as u64,
                "part upload failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => break "cancelled".to_string(),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        error!(key = %task.key_name, part = part_number, attempts, error = %last_error, "part upload failed");
        ChunkResult {
            part_number,
            bytes: task.chunk.length,
            attempts,
            outcome: Err(ChunkUploadFailure {
                part_number,
                attempts,
                last_error,
            }),
        }
    }

    /// Releases the cached storage session.
    pub async fn close(&mut self) {
        self.drop_session().await;
    }

    async fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.connection.close().await {
                debug!(error = %e, "closing worker session failed");
            }
        }
    }

    async fn attempt(&mut self, task: &UploadTask) -> Result<PartReceipt, AttemptError> {
        let data = read_chunk(task).await?;
        let bucket = self.bucket_for(task).await?;

        let txn = MultipartTransaction::attach(bucket, &task.key_name, &task.upload_id);
        let receipt = txn
            .upload_part(PartUpload {
                part_number: data.chunk.part_number,
                data: data.data,
                content_md5: Some(data.content_md5),
            })
            .await
            .map_err(|e| AttemptError {
                transient: e.is_transient(),
                message: e.to_string(),
            })?;

        verify_etag(&receipt, &data.md5_hex)?;
        Ok(receipt)
    }

    async fn bucket_for(&mut self, task: &UploadTask) -> Result<Arc<dyn Bucket>, AttemptError> {
        if let Some(session) = &self.session {
            if session.endpoint == task.endpoint && session.bucket_name == task.bucket {
                return Ok(Arc::clone(&session.bucket));
            }
        }
        self.drop_session().await;

        // Connect and lookup failures are retried: a worker only runs after
        // the job already reached the same bucket once.
        let connection = self
            .connector
            .connect(&task.endpoint)
            .await
            .map_err(|e| AttemptError::transient(e.to_string()))?;
        let bucket = match connection.bucket(&task.bucket).await {
            Ok(b) => b,
            Err(e) => {
                let _ = connection.close().await;
                return Err(AttemptError::transient(e.to_string()));
            }
        };

        self.session = Some(Session {
            endpoint: task.endpoint.clone(),
            bucket_name: task.bucket.clone(),
            connection,
            bucket: Arc::clone(&bucket),
        });
        Ok(bucket)
    }
}

async fn read_chunk(task: &UploadTask) -> Result<ChunkData, AttemptError> {
    let reader = ChunkReader::new(&task.source);
    let chunk = task.chunk;
    tokio::task::spawn_blocking(move || reader.read(&chunk))
        .await
        .map_err(|e| AttemptError::permanent(format!("read task failed: {e}")))?
        .map_err(|e| AttemptError::permanent(e.to_string()))
}

/// Checks a plain entity tag against the part's MD5.
///
/// Only tags of 32 hex digits are compared; anything else (composite tags,
/// vendor formats) is accepted as is. Buckets encrypting with SSE-KMS or
/// SSE-C return 32-hex tags that are not the MD5, so uploads to them fail
/// this check on every attempt.
fn verify_etag(receipt: &PartReceipt, expected_md5: &str) -> Result<(), AttemptError> {
    let etag = receipt.etag_unquoted();
    let plain_md5 = etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit());
    if plain_md5 && !etag.eq_ignore_ascii_case(expected_md5) {
        return Err(AttemptError::transient(format!(
            "part {} etag {etag} does not match md5 {expected_md5}",
            receipt.part_number
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use backhaul_storage::Credentials;
    use backhaul_storage::memory::MemoryStorage;
    use backhaul_transfer::Chunk;
    use tempfile::TempDir;

    use crate::retry::RetryPolicy;

    struct Fixture {
        _dir: TempDir,
        storage: MemoryStorage,
        task: UploadTask,
    }

    async fn fixture(retries: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("data.bin");
        std::fs::write(&source, b"0123456789abcdef").unwrap();

        let storage = MemoryStorage::new().with_bucket("b");
        let endpoint = Endpoint {
            host: "memory".into(),
            region: "us-east-1".into(),
            secure: false,
            credentials: Credentials::new("AK", "SK"),
        };
        let conn = storage.connect(&endpoint).await.unwrap();
        let bucket = conn.bucket("b").await.unwrap();
        let upload_id = bucket.initiate_multipart_upload("k").await.unwrap();

        let task = UploadTask {
            bucket: "b".into(),
            endpoint,
            key_name: "k".into(),
            upload_id,
            source,
            chunk: Chunk {
                part_number: 2,
                offset: 4,
                length: 8,
            },
            retry: RetryPolicy {
                retries,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_factor: 2.0,
            },
        };
        Fixture {
            _dir: dir,
            storage,
            task,
        }
    }

    fn worker(storage: &MemoryStorage) -> ChunkWorker {
        ChunkWorker::new(Arc::new(storage.clone()), CancellationToken::new())
    }

    #[tokio::test]
    async fn uploads_exact_range() {
        let f = fixture(0).await;
        let result = worker(&f.storage).run(f.task.clone()).await;

        assert_eq!(result.attempts, 1);
        assert_eq!(result.bytes, 8);
        let receipt = result.outcome.unwrap();
        assert_eq!(receipt.part_number, 2);
        assert_eq!(receipt.size, 8);
        assert_eq!(receipt.etag_unquoted(), backhaul_transfer::md5_hex(b"456789ab"));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let f = fixture(3).await;
        f.storage.fail_part(2, 2);

        let result = worker(&f.storage).run(f.task.clone()).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(f.storage.upload_attempts(2), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retries() {
        let f = fixture(2).await;
        f.storage.fail_part_always(2);

        let result = worker(&f.storage).run(f.task.clone()).await;
        let failure = result.outcome.unwrap_err();
        assert_eq!(failure.part_number, 2);
        assert_eq!(failure.attempts, 3);
        assert_eq!(f.storage.upload_attempts(2), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let f = fixture(5).await;
        f.storage.reject_part(2);

        let result = worker(&f.storage).run(f.task.clone()).await;
        assert_eq!(result.attempts, 1);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn unreadable_source_is_not_retried() {
        let mut f = fixture(5).await;
        f.task.source = f.task.source.with_file_name("missing.bin");

        let result = worker(&f.storage).run(f.task.clone()).await;
        assert_eq!(result.attempts, 1);
        assert_eq!(f.storage.upload_attempts(2), 0);
    }

    #[tokio::test]
    async fn cancelled_worker_stops() {
        let f = fixture(5).await;
        f.storage.fail_part_always(2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut w = ChunkWorker::new(Arc::new(f.storage.clone()), cancel);
        let result = w.run(f.task.clone()).await;
        assert_eq!(result.outcome.unwrap_err().last_error, "cancelled");
    }

    #[tokio::test]
    async fn session_is_reused_across_tasks() {
        let f = fixture(0).await;
        let mut w = worker(&f.storage);
        let opened_before = f.storage.connections_opened();

        w.run(f.task.clone()).await.outcome.unwrap();
        let mut next = f.task.clone();
        next.chunk = Chunk {
            part_number: 1,
            offset: 0,
            length: 4,
        };
        w.run(next).await.outcome.unwrap();
        w.close().await;

        assert_eq!(f.storage.connections_opened(), opened_before + 1);
        assert_eq!(f.storage.connections_closed(), 1);
    }

    #[test]
    fn etag_check_skips_composite_tags() {
        let receipt = |etag: &str| PartReceipt {
            part_number: 1,
            etag: etag.into(),
            size: 1,
        };
        let md5 = backhaul_transfer::md5_hex(b"x");
        assert!(verify_etag(&receipt(&format!("\"{md5}\"")), &md5).is_ok());
        assert!(verify_etag(&receipt("\"abc-2\""), &md5).is_ok());
        assert!(verify_etag(&receipt("\"00000000000000000000000000000000\""), &md5).is_err());
        // A 32-hex tag that is not the MD5 is retried like any mismatch.
        let err = verify_etag(&receipt("\"0123456789abcdef0123456789abcdef\""), &md5).unwrap_err();
        assert!(err.transient);
    }
}
