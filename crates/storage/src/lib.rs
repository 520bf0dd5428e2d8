//! Object-storage backends for multipart uploads.
//!
//! The upload pipeline talks to storage only through the [`Connector`],
//! [`Connection`] and [`Bucket`] traits. Two implementations ship here:
//!
//! - [`s3`]: S3-compatible HTTP backend (presigned SigV4 requests)
//! - [`memory`]: process-local backend with fault injection, for tests
//!
//! A multipart upload is driven through [`MultipartTransaction`], which
//! enforces the one-way `Open → Completed | Cancelled` lifecycle on top of
//! the raw bucket calls.

mod error;
pub mod memory;
pub mod s3;
mod transaction;
mod types;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use error::StorageError;
pub use transaction::{MultipartTransaction, ObjectHandle, TransactionState};
pub use types::{AccessPolicy, Credentials, Endpoint, PartReceipt, PartUpload};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Opens connections to a storage service.
///
/// Each upload worker calls [`connect`](Self::connect) on its own, so
/// implementations must not hand out connections that share mutable state
/// unsafely.
pub trait Connector: Send + Sync {
    /// Connects to `endpoint`, failing with [`StorageError::Connection`] on
    /// an unreachable host or rejected credentials.
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> StorageFuture<'a, Arc<dyn Connection>>;
}

/// An open session with a storage service.
pub trait Connection: Send + Sync {
    /// Resolves a bucket by name and verifies it can be accessed.
    fn bucket<'a>(&'a self, name: &'a str) -> StorageFuture<'a, Arc<dyn Bucket>>;

    /// Releases the session.
    fn close(&self) -> StorageFuture<'_, ()>;
}

/// Raw bucket operations used by multipart uploads.
///
/// Prefer [`MultipartTransaction`] and [`ObjectHandle`] over calling these
/// directly; they track transaction state.
pub trait Bucket: Send + Sync {
    /// Bucket name.
    fn name(&self) -> &str;

    /// Opens a multipart upload for `key` and returns its upload id.
    fn initiate_multipart_upload<'a>(&'a self, key: &'a str) -> StorageFuture<'a, String>;

    /// Uploads one numbered part.
    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        part: PartUpload,
    ) -> StorageFuture<'a, PartReceipt>;

    /// Lists the parts the service has committed so far, ordered by part number.
    fn list_parts<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StorageFuture<'a, Vec<PartReceipt>>;

    /// Assembles `parts` into the final object.
    fn complete_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [PartReceipt],
    ) -> StorageFuture<'a, ()>;

    /// Discards the upload and every part stored for it.
    fn abort_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StorageFuture<'a, ()>;

    /// Applies a canned access policy to an existing object.
    fn set_object_acl<'a>(
        &'a self,
        key: &'a str,
        policy: &'a AccessPolicy,
    ) -> StorageFuture<'a, ()>;
}
