use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::{AccessPolicy, Bucket, PartReceipt, PartUpload, StorageError};

/// Local view of a multipart upload's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Completed,
    Cancelled,
}

/// Handle to one remote multipart upload.
///
/// The transaction moves from `Open` to exactly one of `Completed` or
/// `Cancelled`. Terminal calls are serialized: once a terminal state is
/// reached, [`complete`](Self::complete) fails and [`cancel`](Self::cancel)
/// is a no-op, so shutdown paths may cancel unconditionally.
pub struct MultipartTransaction {
    bucket: Arc<dyn Bucket>,
    key: String,
    upload_id: String,
    state: Mutex<TransactionState>,
}

impl MultipartTransaction {
    /// Opens a new multipart upload for `key`.
    pub async fn initiate(bucket: Arc<dyn Bucket>, key: &str) -> Result<Self, StorageError> {
        let upload_id = bucket.initiate_multipart_upload(key).await?;
        debug!(bucket = %bucket.name(), key = %key, upload_id = %upload_id, "multipart upload initiated");
        Ok(Self::attach(bucket, key, &upload_id))
    }

    /// Wraps an upload that was opened elsewhere, e.g. by the coordinator of
    /// a worker that only knows the upload id.
    pub fn attach(bucket: Arc<dyn Bucket>, key: &str, upload_id: &str) -> Self {
        Self {
            bucket,
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            state: Mutex::new(TransactionState::Open),
        }
    }

    /// Backend-assigned upload id.
    pub fn id(&self) -> &str {
        &self.upload_id
    }

    /// Object key the upload will produce.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current local state.
    pub async fn state(&self) -> TransactionState {
        *self.state.lock().await
    }

    /// Returns true while neither completed nor cancelled.
    pub async fn is_open(&self) -> bool {
        self.state().await == TransactionState::Open
    }

    /// Uploads one part.
    pub async fn upload_part(&self, part: PartUpload) -> Result<PartReceipt, StorageError> {
        if !self.is_open().await {
            return Err(StorageError::TransactionFinished(self.upload_id.clone()));
        }
        self.bucket
            .upload_part(&self.key, &self.upload_id, part)
            .await
    }

    /// Lists committed parts, ordered by part number.
    pub async fn list_parts(&self) -> Result<Vec<PartReceipt>, StorageError> {
        let mut parts = self.bucket.list_parts(&self.key, &self.upload_id).await?;
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    /// Commits the upload from `parts`.
    ///
    /// On failure the transaction stays `Open` so the caller can cancel it.
    pub async fn complete(&self, parts: &[PartReceipt]) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if *state != TransactionState::Open {
            return Err(StorageError::TransactionFinished(self.upload_id.clone()));
        }
        self.bucket
            .complete_multipart_upload(&self.key, &self.upload_id, parts)
            .await?;
        *state = TransactionState::Completed;
        debug!(key = %self.key, upload_id = %self.upload_id, parts = parts.len(), "multipart upload completed");
        Ok(())
    }

    /// Aborts the upload.
    ///
    /// Returns `Ok(false)` without contacting the service if the transaction
    /// already reached a terminal state. A remote failure leaves it `Open`.
    pub async fn cancel(&self) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        if *state != TransactionState::Open {
            return Ok(false);
        }
        match self
            .bucket
            .abort_multipart_upload(&self.key, &self.upload_id)
            .await
        {
            // The service already forgot the upload; nothing is left open.
            Ok(()) | Err(StorageError::NoSuchUpload(_)) => {}
            Err(e) => return Err(e),
        }
        *state = TransactionState::Cancelled;
        debug!(key = %self.key, upload_id = %self.upload_id, "multipart upload cancelled");
        Ok(true)
    }
}

/// A stored object addressed by key.
pub struct ObjectHandle {
    bucket: Arc<dyn Bucket>,
    key: String,
}

impl ObjectHandle {
    pub fn new(bucket: Arc<dyn Bucket>, key: &str) -> Self {
        Self {
            bucket,
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Applies a canned access policy.
    pub async fn set_access_policy(&self, policy: &AccessPolicy) -> Result<(), StorageError> {
        self.bucket.set_object_acl(&self.key, policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::{Connector, Credentials, Endpoint};

    async fn open_bucket(storage: &MemoryStorage) -> Arc<dyn Bucket> {
        let endpoint = Endpoint {
            host: "memory".into(),
            region: "us-east-1".into(),
            secure: false,
            credentials: Credentials::new("AK", "SK"),
        };
        let conn = storage.connect(&endpoint).await.unwrap();
        conn.bucket("backups").await.unwrap()
    }

    fn part(n: u16, data: &[u8]) -> PartUpload {
        PartUpload {
            part_number: n,
            data: data.to_vec(),
            content_md5: None,
        }
    }

    #[tokio::test]
    async fn complete_assembles_object() {
        let storage = MemoryStorage::new().with_bucket("backups");
        let bucket = open_bucket(&storage).await;

        let txn = MultipartTransaction::initiate(Arc::clone(&bucket), "k/file.bin")
            .await
            .unwrap();
        txn.upload_part(part(2, b"world")).await.unwrap();
        txn.upload_part(part(1, b"hello ")).await.unwrap();

        let parts = txn.list_parts().await.unwrap();
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2]
        );

        txn.complete(&parts).await.unwrap();
        assert_eq!(txn.state().await, TransactionState::Completed);

        let object = storage.object("backups", "k/file.bin").unwrap();
        assert_eq!(object.data, b"hello world");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let storage = MemoryStorage::new().with_bucket("backups");
        let bucket = open_bucket(&storage).await;

        let txn = MultipartTransaction::initiate(bucket, "k").await.unwrap();
        assert!(txn.cancel().await.unwrap());
        assert!(!txn.cancel().await.unwrap());
        assert_eq!(txn.state().await, TransactionState::Cancelled);
        assert_eq!(storage.aborted_uploads("backups"), 1);
    }

    #[tokio::test]
    async fn cancel_after_complete_is_noop() {
        let storage = MemoryStorage::new().with_bucket("backups");
        let bucket = open_bucket(&storage).await;

        let txn = MultipartTransaction::initiate(bucket, "k").await.unwrap();
        txn.upload_part(part(1, b"x")).await.unwrap();
        let parts = txn.list_parts().await.unwrap();
        txn.complete(&parts).await.unwrap();

        assert!(!txn.cancel().await.unwrap());
        assert_eq!(txn.state().await, TransactionState::Completed);
        assert_eq!(storage.aborted_uploads("backups"), 0);
    }

    #[tokio::test]
    async fn finished_transaction_rejects_work() {
        let storage = MemoryStorage::new().with_bucket("backups");
        let bucket = open_bucket(&storage).await;

        let txn = MultipartTransaction::initiate(bucket, "k").await.unwrap();
        txn.cancel().await.unwrap();

        assert!(matches!(
            txn.upload_part(part(1, b"x")).await,
            Err(StorageError::TransactionFinished(_))
        ));
        assert!(matches!(
            txn.complete(&[]).await,
            Err(StorageError::TransactionFinished(_))
        ));
    }

    #[tokio::test]
    async fn object_handle_sets_policy() {
        let storage = MemoryStorage::new().with_bucket("backups");
        let bucket = open_bucket(&storage).await;

        let txn = MultipartTransaction::initiate(Arc::clone(&bucket), "k")
            .await
            .unwrap();
        txn.upload_part(part(1, b"x")).await.unwrap();
        let parts = txn.list_parts().await.unwrap();
        txn.complete(&parts).await.unwrap();

        ObjectHandle::new(bucket, "k")
            .set_access_policy(&AccessPolicy::PublicRead)
            .await
            .unwrap();
        assert_eq!(
            storage.object("backups", "k").unwrap().acl,
            Some(AccessPolicy::PublicRead)
        );
    }
}
