//! Upload job configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use backhaul_storage::{AccessPolicy, Credentials, Endpoint};
use backhaul_transfer::MEGABYTE;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::retry::RetryPolicy;

/// Bucket prefix meaning "store at the bucket root".
pub const ROOT_PREFIX: &str = "/";

fn default_bucket_prefix() -> String {
    ROOT_PREFIX.into()
}

fn default_thread_count() -> usize {
    4
}

fn default_chunk_size_mb() -> u64 {
    50
}

fn default_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_secure() -> bool {
    true
}

/// Settings for one upload job. Immutable once the job starts.
#[derive(Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Directory whose regular files are uploaded.
    pub source_dir: PathBuf,
    pub key_prefix: String,
    pub bucket: String,
    /// Key prefix inside the bucket; [`ROOT_PREFIX`] for the bucket root.
    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,
    pub access_key: String,
    pub secret_key: String,
    /// Delete each source file after its upload completes, then the source
    /// directory once every file is gone.
    #[serde(default)]
    pub remove_uploaded: bool,
    /// Storage host, e.g. `s3.amazonaws.com` or `minio.local:9000`.
    pub host: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// Additional attempts per chunk after the first one fails.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default)]
    pub acl: AccessPolicy,
    /// Use TLS to reach the host.
    #[serde(default = "default_secure")]
    pub secure: bool,
}

impl JobConfig {
    /// Creates a config with every optional setting at its default.
    pub fn new(
        source_dir: impl Into<PathBuf>,
        key_prefix: &str,
        bucket: &str,
        host: &str,
        credentials: Credentials,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            key_prefix: key_prefix.into(),
            bucket: bucket.into(),
            bucket_prefix: default_bucket_prefix(),
            access_key: credentials.access_key,
            secret_key: credentials.secret_key,
            remove_uploaded: false,
            host: host.into(),
            region: default_region(),
            thread_count: default_thread_count(),
            chunk_size_mb: default_chunk_size_mb(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            acl: AccessPolicy::default(),
            secure: default_secure(),
        }
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb.saturating_mul(MEGABYTE)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.access_key.clone(), self.secret_key.clone())
    }

    /// Storage endpoint described by this config.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            region: self.region.clone(),
            secure: self.secure,
            credentials: self.credentials(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            initial_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_factor: 2.0,
        }
    }

    /// Checks the settings that cannot be defaulted.
    pub fn validate(&self) -> Result<(), UploadError> {
        let required = [
            ("bucket", &self.bucket),
            ("key_prefix", &self.key_prefix),
            ("host", &self.host),
            ("access_key", &self.access_key),
            ("secret_key", &self.secret_key),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(UploadError::Config(format!("{name} must not be empty")));
        }
        if self.bucket_prefix.is_empty() {
            return Err(UploadError::Config(format!(
                "bucket_prefix must not be empty (use \"{ROOT_PREFIX}\" for the bucket root)"
            )));
        }
        if self.thread_count == 0 {
            return Err(UploadError::Config("thread_count must be at least 1".into()));
        }
        if self.chunk_size_mb == 0 {
            return Err(UploadError::Config("chunk_size_mb must be at least 1".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("source_dir", &self.source_dir)
            .field("key_prefix", &self.key_prefix)
            .field("bucket", &self.bucket)
            .field("bucket_prefix", &self.bucket_prefix)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("remove_uploaded", &self.remove_uploaded)
            .field("host", &self.host)
            .field("region", &self.region)
            .field("thread_count", &self.thread_count)
            .field("chunk_size_mb", &self.chunk_size_mb)
            .field("retries", &self.retries)
            .field("acl", &self.acl)
            .field("secure", &self.secure)
            .finish()
    }
}
