use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Access key pair for a storage service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

// The secret never ends up in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Where and how to reach a storage service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name, optionally with port (`s3.example.com:9000`) or an
    /// explicit scheme.
    pub host: String,
    pub region: String,
    /// Use TLS when `host` carries no scheme.
    pub secure: bool,
    pub credentials: Credentials,
}

impl Endpoint {
    /// Base URL of the service.
    pub fn url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            return self.host.trim_end_matches('/').to_string();
        }
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host.trim_end_matches('/'))
    }
}

/// Canned access-control policy applied to uploaded objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessPolicy {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    AwsExecRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
    LogDeliveryWrite,
}

impl AccessPolicy {
    /// Wire name used in the `x-amz-acl` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPolicy::Private => "private",
            AccessPolicy::PublicRead => "public-read",
            AccessPolicy::PublicReadWrite => "public-read-write",
            AccessPolicy::AuthenticatedRead => "authenticated-read",
            AccessPolicy::AwsExecRead => "aws-exec-read",
            AccessPolicy::BucketOwnerRead => "bucket-owner-read",
            AccessPolicy::BucketOwnerFullControl => "bucket-owner-full-control",
            AccessPolicy::LogDeliveryWrite => "log-delivery-write",
        }
    }

    const ALL: [AccessPolicy; 8] = [
        AccessPolicy::Private,
        AccessPolicy::PublicRead,
        AccessPolicy::PublicReadWrite,
        AccessPolicy::AuthenticatedRead,
        AccessPolicy::AwsExecRead,
        AccessPolicy::BucketOwnerRead,
        AccessPolicy::BucketOwnerFullControl,
        AccessPolicy::LogDeliveryWrite,
    ];
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown access policy: {s}"))
    }
}

/// Body of one part upload.
#[derive(Debug, Clone)]
pub struct PartUpload {
    pub part_number: u16,
    pub data: Vec<u8>,
    /// Base64 MD5 sent as `Content-MD5`, letting the service reject a
    /// corrupted body.
    pub content_md5: Option<String>,
}

/// A part the service has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: u16,
    /// Entity tag as returned by the service (may be quoted).
    pub etag: String,
    pub size: u64,
}

impl PartReceipt {
    /// Entity tag without surrounding quotes.
    pub fn etag_unquoted(&self) -> &str {
        self.etag.trim_matches('"')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, secure: bool) -> Endpoint {
        Endpoint {
            host: host.into(),
            region: "us-east-1".into(),
            secure,
            credentials: Credentials::new("AK", "SK"),
        }
    }

    #[test]
    fn url_uses_security_flag() {
        assert_eq!(endpoint("s3.example.com", true).url(), "https://s3.example.com");
        assert_eq!(endpoint("minio:9000", false).url(), "http://minio:9000");
    }

    #[test]
    fn explicit_scheme_wins() {
        assert_eq!(
            endpoint("http://localhost:9000/", true).url(),
            "http://localhost:9000"
        );
    }

    #[test]
    fn debug_redacts_secret() {
        let out = format!("{:?}", Credentials::new("AKIA", "topsecret"));
        assert!(out.contains("AKIA"));
        assert!(!out.contains("topsecret"));
    }

    #[test]
    fn access_policy_names() {
        assert_eq!(AccessPolicy::default(), AccessPolicy::Private);
        for policy in AccessPolicy::ALL {
            assert_eq!(policy.as_str().parse::<AccessPolicy>().unwrap(), policy);
        }
        assert!("world-writable".parse::<AccessPolicy>().is_err());
    }

    #[test]
    fn etag_unquoted_strips_quotes() {
        let receipt = PartReceipt {
            part_number: 1,
            etag: "\"abc\"".into(),
            size: 3,
        };
        assert_eq!(receipt.etag_unquoted(), "abc");
    }
}
