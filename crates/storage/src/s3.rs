//! S3-compatible backend.
//!
//! Requests are presigned with SigV4 by `rusty-s3` and sent with `reqwest`.
//! Buckets are addressed path-style so that self-hosted services (MinIO,
//! Ceph RGW) work with a bare `host:port` endpoint.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::ETAG;
use reqwest::{Client, Response, Url};
use rusty_s3::actions::{CreateMultipartUpload, ListParts, S3Action};
use rusty_s3::UrlStyle;
use tracing::{debug, info, warn};

use crate::{
    AccessPolicy, Bucket, Connection, Connector, Endpoint, PartReceipt, PartUpload, StorageError,
    StorageFuture,
};

/// Validity of every presigned URL.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Opens [`S3Connection`]s over a shared HTTP client.
#[derive(Clone)]
pub struct S3Connector {
    client: Client,
}

impl S3Connector {
    pub fn new() -> Result<Self, StorageError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

impl Connector for S3Connector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> StorageFuture<'a, Arc<dyn Connection>> {
        Box::pin(async move {
            let url = endpoint.url();
            let base_url: Url = url
                .parse()
                .map_err(|e| StorageError::InvalidEndpoint(format!("'{url}': {e}")))?;
            if base_url.host_str().is_none() {
                return Err(StorageError::InvalidEndpoint(format!("'{url}': missing host")));
            }

            debug!(endpoint = %url, region = %endpoint.region, "S3 connection opened");
            let conn: Arc<dyn Connection> = Arc::new(S3Connection {
                client: self.client.clone(),
                base_url,
                region: endpoint.region.clone(),
                credentials: rusty_s3::Credentials::new(
                    endpoint.credentials.access_key.clone(),
                    endpoint.credentials.secret_key.clone(),
                ),
            });
            Ok(conn)
        })
    }
}

/// A session with one S3 endpoint.
pub struct S3Connection {
    client: Client,
    base_url: Url,
    region: String,
    credentials: rusty_s3::Credentials,
}

impl S3Connection {
    fn bucket_handle(&self, name: &str) -> Result<S3Bucket, StorageError> {
        let bucket = rusty_s3::Bucket::new(
            self.base_url.clone(),
            UrlStyle::Path,
            name.to_string(),
            self.region.clone(),
        )
        .map_err(|e| StorageError::InvalidEndpoint(format!("bucket '{name}': {e}")))?;

        Ok(S3Bucket {
            client: self.client.clone(),
            bucket,
            credentials: self.credentials.clone(),
            name: name.to_string(),
        })
    }
}

impl Connection for S3Connection {
    fn bucket<'a>(&'a self, name: &'a str) -> StorageFuture<'a, Arc<dyn Bucket>> {
        Box::pin(async move {
            let handle = self.bucket_handle(name)?;

            // A single-key listing proves the host is reachable, the
            // credentials are accepted and the bucket exists.
            let mut action = handle.bucket.list_objects_v2(Some(&handle.credentials));
            action.query_mut().insert("max-keys", "1");
            let url = action.sign(PRESIGN_DURATION);

            let connection_error = |reason: String| StorageError::Connection {
                endpoint: self.base_url.to_string(),
                reason,
            };
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| connection_error(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(connection_error(format!(
                    "bucket '{name}' returned HTTP {}: {}",
                    status.as_u16(),
                    body.trim()
                )));
            }

            let bucket: Arc<dyn Bucket> = Arc::new(handle);
            Ok(bucket)
        })
    }

    fn close(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            // Pooled HTTP connections are released when the client drops.
            debug!(endpoint = %self.base_url, "S3 connection closed");
            Ok(())
        })
    }
}

/// One S3 bucket.
pub struct S3Bucket {
    client: Client,
    bucket: rusty_s3::Bucket,
    credentials: rusty_s3::Credentials,
    name: String,
}

impl S3Bucket {
    fn part_url(&self, key: &str, upload_id: &str, part_number: u16) -> Url {
        self.bucket
            .upload_part(Some(&self.credentials), key, part_number, upload_id)
            .sign(PRESIGN_DURATION)
    }

    fn acl_url(&self, key: &str, policy: &AccessPolicy) -> Url {
        let mut action = self.bucket.put_object(Some(&self.credentials), key);
        action.query_mut().insert("acl", "");
        action.headers_mut().insert("x-amz-acl", policy.as_str());
        action.sign(PRESIGN_DURATION)
    }

    async fn put_empty_object(&self, key: &str) -> Result<(), StorageError> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        let resp = self.client.put(url).body(Vec::new()).send().await?;
        ensure_success("PutObject", None, resp).await?;
        Ok(())
    }
}

impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn initiate_multipart_upload<'a>(&'a self, key: &'a str) -> StorageFuture<'a, String> {
        Box::pin(async move {
            let url = self
                .bucket
                .create_multipart_upload(Some(&self.credentials), key)
                .sign(PRESIGN_DURATION);
            let resp = self.client.post(url).send().await?;
            let body = ensure_success("CreateMultipartUpload", None, resp)
                .await?
                .text()
                .await?;

            let parsed = CreateMultipartUpload::parse_response(&body).map_err(|e| {
                StorageError::InvalidResponse {
                    operation: "CreateMultipartUpload".into(),
                    reason: e.to_string(),
                }
            })?;
            Ok(parsed.upload_id().to_string())
        })
    }

    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        part: PartUpload,
    ) -> StorageFuture<'a, PartReceipt> {
        Box::pin(async move {
            let url = self.part_url(key, upload_id, part.part_number);
            let size = part.data.len() as u64;

            let mut request = self.client.put(url);
            if let Some(md5) = &part.content_md5 {
                request = request.header("Content-MD5", md5.as_str());
            }
            let resp = request.body(part.data).send().await?;
            let resp = ensure_success("UploadPart", Some(upload_id), resp).await?;

            let etag = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| StorageError::InvalidResponse {
                    operation: "UploadPart".into(),
                    reason: format!("part {} response has no ETag", part.part_number),
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
            let mut parts = Vec::new();
            let mut marker: Option<u16> = None;

            loop {
                let mut action = self
                    .bucket
                    .list_parts(Some(&self.credentials), key, upload_id);
                if let Some(m) = marker {
                    action.query_mut().insert("part-number-marker", m.to_string());
                }
                let url = action.sign(PRESIGN_DURATION);

                let resp = self.client.get(url).send().await?;
                let body = ensure_success("ListParts", Some(upload_id), resp)
                    .await?
                    .text()
                    .await?;
                let page = ListParts::parse_response(&body).map_err(|e| {
                    StorageError::InvalidResponse {
                        operation: "ListParts".into(),
                        reason: e.to_string(),
                    }
                })?;

                let page_len = page.parts.len();
                parts.extend(page.parts.into_iter().map(|p| PartReceipt {
                    part_number: p.number,
                    etag: p.etag,
                    size: p.size,
                }));

                match page.next_part_number_marker {
                    Some(next) if page_len > 0 && Some(next) != marker => marker = Some(next),
                    _ => break,
                }
            }

            parts.sort_by_key(|p| p.part_number);
            parts.dedup_by_key(|p| p.part_number);
            Ok(parts)
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        parts: &'a [PartReceipt],
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            if parts.is_empty() {
                // S3 refuses to assemble an object from zero parts.
                debug!(key = %key, "no parts to assemble, writing empty object");
                self.abort_multipart_upload(key, upload_id).await?;
                return self.put_empty_object(key).await;
            }

            let action = self.bucket.complete_multipart_upload(
                Some(&self.credentials),
                key,
                upload_id,
                parts.iter().map(|p| p.etag.as_str()),
            );
            let url = action.sign(PRESIGN_DURATION);
            let body = action.body();

            let resp = self.client.post(url).body(body).send().await?;
            let text = ensure_success("CompleteMultipartUpload", Some(upload_id), resp)
                .await?
                .text()
                .await?;

            // Completion can fail after the 200 header has been sent.
            if text.contains("<Error>") {
                return Err(StorageError::Status {
                    operation: "CompleteMultipartUpload".into(),
                    status: 200,
                    body: text,
                });
            }
            Ok(())
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let url = self
                .bucket
                .abort_multipart_upload(Some(&self.credentials), key, upload_id)
                .sign(PRESIGN_DURATION);
            let resp = self.client.delete(url).send().await?;
            ensure_success("AbortMultipartUpload", Some(upload_id), resp).await?;
            Ok(())
        })
    }

    fn set_object_acl<'a>(
        &'a self,
        key: &'a str,
        policy: &'a AccessPolicy,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let url = self.acl_url(key, policy);
            let resp = self
                .client
                .put(url)
                .header("x-amz-acl", policy.as_str())
                .body(Vec::new())
                .send()
                .await?;
            ensure_success("PutObjectAcl", None, resp).await?;
            info!(bucket = %self.name, key = %key, acl = %policy, "access policy applied");
            Ok(())
        })
    }
}

/// Passes a 2xx response through, converting anything else to an error.
async fn ensure_success(
    operation: &str,
    upload_id: Option<&str>,
    resp: Response,
) -> Result<Response, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let err = status_error(operation, status.as_u16(), body, upload_id);
    warn!(operation, status = status.as_u16(), error = %err, "S3 request failed");
    Err(err)
}

fn status_error(
    operation: &str,
    status: u16,
    body: String,
    upload_id: Option<&str>,
) -> StorageError {
    match (status, upload_id) {
        (404, Some(id)) if body.contains("NoSuchUpload") => StorageError::NoSuchUpload(id.into()),
        (403, _) => StorageError::AccessDenied(format!("{operation}: {}", body.trim())),
        _ => StorageError::Status {
            operation: operation.into(),
            status,
            body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Credentials;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint {
            host: host.into(),
            region: "us-east-1".into(),
            secure: false,
            credentials: Credentials::new("AKIDEXAMPLE", "secret"),
        }
    }

    #[test]
    fn no_such_upload_maps_to_variant() {
        let err = status_error(
            "UploadPart",
            404,
            "<Error><Code>NoSuchUpload</Code></Error>".into(),
            Some("u-1"),
        );
        assert!(matches!(err, StorageError::NoSuchUpload(id) if id == "u-1"));
    }

    #[test]
    fn forbidden_maps_to_access_denied() {
        let err = status_error("PutObjectAcl", 403, "denied".into(), None);
        assert!(matches!(err, StorageError::AccessDenied(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn server_error_stays_transient() {
        let err = status_error("UploadPart", 503, "SlowDown".into(), Some("u-1"));
        assert!(matches!(err, StorageError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rejects_endpoint_without_host() {
        let connector = S3Connector::new().unwrap();
        assert!(matches!(
            connector.connect(&endpoint("")).await,
            Err(StorageError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn presigned_urls_are_path_style() {
        let connector = S3Connector::new().unwrap();
        let ep = endpoint("minio.local:9000");
        let base_url: Url = ep.url().parse().unwrap();
        let conn = S3Connection {
            client: connector.client.clone(),
            base_url,
            region: ep.region.clone(),
            credentials: rusty_s3::Credentials::new("AKIDEXAMPLE", "secret"),
        };
        let bucket = conn.bucket_handle("backups").unwrap();

        let url = bucket.part_url("2024/dump.tar", "abc", 3);
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("minio.local"));
        assert!(url.path().starts_with("/backups/"));
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("partNumber".into(), "3".into())));
        assert!(query.contains(&("uploadId".into(), "abc".into())));

        let acl = bucket.acl_url("2024/dump.tar", &AccessPolicy::PublicRead);
        assert!(acl.query_pairs().any(|(k, _)| k == "acl"));
    }
}
