//! Process-local storage backend.
//!
//! [`MemoryStorage`] keeps buckets, multipart uploads and objects in memory
//! and can inject faults into part uploads. Clones share state, so a test
//! keeps one clone for inspection and hands another to the code under test.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backhaul_transfer::md5_hex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    AccessPolicy, Bucket, Connection, Connector, Credentials, Endpoint, PartReceipt, PartUpload,
    StorageError, StorageFuture,
};

/// An assembled object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    /// Canned policy last applied, if any.
    pub acl: Option<AccessPolicy>,
}

#[derive(Debug, Clone, Copy)]
enum PartFault {
    /// Fail with a retryable error this many more times.
    Transient(u32),
    /// Fail with a retryable error on every attempt.
    AlwaysTransient,
    /// Fail with a non-retryable error.
    Permanent,
}

#[derive(Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u16, (Vec<u8>, String)>,
}

#[derive(Default)]
struct BucketState {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    completed: usize,
    aborted: usize,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BucketState>,
    credentials: Option<Credentials>,
    unreachable: bool,
    faults: HashMap<u16, PartFault>,
    hidden_parts: HashSet<u16>,
    part_delay: Option<Duration>,
    initiate_delay: Option<Duration>,
    attempts: HashMap<u16, u32>,
    connections_opened: usize,
    connections_closed: usize,
    operations: Vec<String>,
}

/// In-memory [`Connector`] with fault injection.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates an empty bucket.
    pub fn with_bucket(self, name: &str) -> Self {
        self.state()
            .buckets
            .entry(name.to_string())
            .or_default();
        self
    }

    /// Rejects connections whose credentials differ from `credentials`.
    pub fn require_credentials(self, credentials: Credentials) -> Self {
        self.state().credentials = Some(credentials);
        self
    }

    /// Makes every connection attempt fail as if the host were unreachable.
    pub fn unreachable(self) -> Self {
        self.state().unreachable = true;
        self
    }

    /// Fails the next `times` upload attempts of `part_number` with a
    /// retryable error.
    pub fn fail_part(&self, part_number: u16, times: u32) {
        self.state()
            .faults
            .insert(part_number, PartFault::Transient(times));
    }

    /// Fails every upload attempt of `part_number` with a retryable error.
    pub fn fail_part_always(&self, part_number: u16) {
        self.state()
            .faults
            .insert(part_number, PartFault::AlwaysTransient);
    }

    /// Fails uploads of `part_number` with an error that must not be retried.
    pub fn reject_part(&self, part_number: u16) {
        self.state()
            .faults
            .insert(part_number, PartFault::Permanent);
    }

    /// Accepts `part_number` but leaves it out of part listings.
    pub fn hide_part_from_listing(&self, part_number: u16) {
        self.state().hidden_parts.insert(part_number);
    }

    /// Delays every part upload by `delay` before it is stored.
    pub fn delay_parts(&self, delay: Duration) {
        self.state().part_delay = Some(delay);
    }

    /// Holds back the reply to every multipart initiation by `delay`. The
    /// upload already exists while the reply is pending.
    pub fn delay_initiate(&self, delay: Duration) {
        self.state().initiate_delay = Some(delay);
    }

    /// Returns the object stored under `key`.
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key).cloned())
    }

    /// Keys of every stored object in `bucket`, sorted.
    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        let state = self.state();
        let mut keys: Vec<String> = state
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn open_uploads(&self, bucket: &str) -> usize {
        self.state()
            .buckets
            .get(bucket)
            .map_or(0, |b| b.uploads.len())
    }

    pub fn completed_uploads(&self, bucket: &str) -> usize {
        self.state().buckets.get(bucket).map_or(0, |b| b.completed)
    }

    pub fn aborted_uploads(&self, bucket: &str) -> usize {
        self.state().buckets.get(bucket).map_or(0, |b| b.aborted)
    }

    /// Upload attempts seen for `part_number`, across all uploads.
    pub fn upload_attempts(&self, part_number: u16) -> u32 {
        self.state()
            .attempts
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.state().connections_closed
    }

    /// Every storage call received, in order, e.g. `"complete backups/k"`.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    fn record(state: &mut State, op: &str, bucket: &str, key: &str) {
        state.operations.push(format!("{op} {bucket}/{key}"));
    }
}

impl Connector for MemoryStorage {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> StorageFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let mut state = self.state();
            if state.unreachable {
                return Err(StorageError::Connection {
                    endpoint: endpoint.url(),
                    reason: "host unreachable".into(),
                });
            }
            if state
                .credentials
                .as_ref()
                .is_some_and(|expected| *expected != endpoint.credentials)
            {
                return Err(StorageError::Connection {
                    endpoint: endpoint.url(),
                    reason: "invalid credentials".into(),
                });
            }
            state.connections_opened += 1;
            state.operations.push(format!("connect {}", endpoint.url()));
            drop(state);

            let conn: Arc<dyn Connection> = Arc::new(MemoryConnection {
                storage: self.clone(),
                endpoint: endpoint.url(),
                closed: AtomicBool::new(false),
            });
            Ok(conn)
        })
    }
}

struct MemoryConnection {
    storage: MemoryStorage,
    endpoint: String,
    closed: AtomicBool,
}

impl Connection for MemoryConnection {
    fn bucket<'a>(&'a self, name: &'a str) -> StorageFuture<'a, Arc<dyn Bucket>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StorageError::Connection {
                    endpoint: self.endpoint.clone(),
                    reason: "connection closed".into(),
                });
            }
            if !self.storage.state().buckets.contains_key(name) {
                return Err(StorageError::Connection {
                    endpoint: self.endpoint.clone(),
                    reason: format!("bucket {name} not found"),
                });
            }
            let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket {
                storage: self.storage.clone(),
                name: name.to_string(),
            });
            Ok(bucket)
        })
    }

    fn close(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.storage.state().connections_closed += 1;
            }
            Ok(())
        })
    }
}

struct MemoryBucket {
    storage: MemoryStorage,
    name: String,
}

impl MemoryBucket {
    fn with_bucket<T>(
        &self,
        f: impl FnOnce(&mut BucketState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut state = self.storage.state();
        let bucket = state
            .buckets
            .get_mut(&self.name)
            .ok_or_else(|| StorageError::Status {
                operation: "bucket".into(),
                status: 404,
                body: format!("NoSuchBucket: {}", self.name),
            })?;
        f(bucket)
    }
}

impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn initiate_multipart_upload<'a>(&'a self, key: &'a str) -> StorageFuture<'a, String> {
        Box::pin(async move {
            {
                let mut state = self.storage.state();
                MemoryStorage::record(&mut state, "initiate", &self.name, key);
            }
            let upload_id = Uuid::new_v4().to_string();
            self.with_bucket(|b| {
                b.uploads.insert(
                    upload_id.clone(),
                    PendingUpload {
                        key: key.to_string(),
                        parts: BTreeMap::new(),
                    },
                );
                Ok(())
            })?;
            let delay = self.storage.state().initiate_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(upload_id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        part: PartUpload,
    ) -> StorageFuture<'a, PartReceipt> {
        Box::pin(async move {
            let delay = self.storage.state().part_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let fault = {
                let mut state = self.storage.state();
                MemoryStorage::record(
                    &mut state,
                    &format!("upload_part#{}", part.part_number),
                    &self.name,
                    key,
                );
                *state.attempts.entry(part.part_number).or_insert(0) += 1;
                match state.faults.get_mut(&part.part_number) {
                    Some(PartFault::Transient(0)) | None => None,
                    Some(PartFault::Transient(remaining)) => {
                        *remaining -= 1;
                        Some(true)
                    }
                    Some(PartFault::AlwaysTransient) => Some(true),
                    Some(PartFault::Permanent) => Some(false),
                }
            };
            if let Some(transient) = fault {
                debug!(part = part.part_number, transient, "injecting part failure");
                return Err(StorageError::Injected {
                    reason: format!("part {} rejected", part.part_number),
                    transient,
                });
            }

            let etag = format!("\"{}\"", md5_hex(&part.data));
            let size = part.data.len() as u64;
            self.with_bucket(|b| {
                let upload = b
                    .uploads
                    .get_mut(upload_id)
                    .filter(|u| u.key == key)
                    .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;
                upload
                    .parts
                    .insert(part.part_number, (part.data, etag.clone()));
                Ok(())
            })?;

            Ok(PartReceipt {
                part_number: part.part_number,
                etag,
                size,
            })
        })
    }

    fn list_parts<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StorageFuture<'a, Vec<PartReceipt>> {
        Box::pin(async move {
            let hidden = {
                let mut state = self.storage.state();
                MemoryStorage::record(&mut state, "list_parts", &self.name, key);
                state.hidden_parts.clone()
            };
            self.with_bucket(|b| {
                let upload = b
                    .uploads
                    .get(upload_id)
                    .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;
                Ok(upload
                    .parts
                    .iter()
                    .filter(|(n, _)| !hidden.contains(n))
                    .map(|(n, (data, etag))| PartReceipt {
                        part_number: *n,
                        etag: etag.clone(),
                        size: data.len() as u64,
                    })
                    .collect())
            })
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [PartReceipt],
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut state = self.storage.state();
                MemoryStorage::record(&mut state, "complete", &self.name, key);
            }
            self.with_bucket(|b| {
                let upload = b
                    .uploads
                    .get(upload_id)
                    .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;

                let mut data = Vec::new();
                for receipt in parts {
                    match upload.parts.get(&receipt.part_number) {
                        Some((bytes, etag)) if *etag == receipt.etag => {
                            data.extend_from_slice(bytes)
                        }
                        _ => {
                            return Err(StorageError::Status {
                                operation: "CompleteMultipartUpload".into(),
                                status: 400,
                                body: format!("InvalidPart: {}", receipt.part_number),
                            });
                        }
                    }
                }

                b.uploads.remove(upload_id);
                b.objects
                    .insert(key.to_string(), StoredObject { data, acl: None });
                b.completed += 1;
                Ok(())
            })
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut state = self.storage.state();
                MemoryStorage::record(&mut state, "abort", &self.name, key);
            }
            self.with_bucket(|b| {
                b.uploads
                    .remove(upload_id)
                    .ok_or_else(|| StorageError::NoSuchUpload(upload_id.to_string()))?;
                b.aborted += 1;
                Ok(())
            })
        })
    }

    fn set_object_acl<'a>(
        &'a self,
        key: &'a str,
        policy: &'a AccessPolicy,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut state = self.storage.state();
                MemoryStorage::record(&mut state, "set_acl", &self.name, key);
            }
            self.with_bucket(|b| {
                let object = b.objects.get_mut(key).ok_or_else(|| StorageError::Status {
                    operation: "PutObjectAcl".into(),
                    status: 404,
                    body: format!("NoSuchKey: {key}"),
                })?;
                object.acl = Some(*policy);
                Ok(())
            })
        })
    }
}
