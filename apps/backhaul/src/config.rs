//! Application configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/backhaul/upload.toml`
//! - Windows: `%APPDATA%/backhaul/upload.toml`
//!
//! A path given as the first command-line argument takes precedence.

use std::path::{Path, PathBuf};

use anyhow::Context;
use backhaul_upload::JobConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The upload job to run.
    pub upload: JobConfig,
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.upload.validate()?;
        Ok(config)
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("backhaul").join("upload.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("backhaul")
            .join("upload.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_storage::AccessPolicy;

    const MINIMAL: &str = r#"
[upload]
source_dir = "/var/backups/outbox"
key_prefix = "2024-01-01"
bucket = "archive"
access_key = "AK"
secret_key = "SK"
host = "s3.example.com"
"#;

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("upload.toml");
        std::fs::write(&path, content).unwrap();
        (tmp, path)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let (_tmp, path) = write(MINIMAL);
        let config = Config::load(&path).unwrap();
        let upload = &config.upload;

        assert_eq!(upload.bucket_prefix, "/");
        assert_eq!(upload.thread_count, 4);
        assert_eq!(upload.chunk_size_mb, 50);
        assert_eq!(upload.retries, 5);
        assert_eq!(upload.acl, AccessPolicy::Private);
        assert_eq!(upload.region, "us-east-1");
        assert!(upload.secure);
        assert!(!upload.remove_uploaded);
    }

    #[test]
    fn full_config() {
        let content = format!(
            "{MINIMAL}bucket_prefix = \"db\"\nthread_count = 8\nchunk_size_mb = 16\n\
             retries = 2\nacl = \"public-read\"\nsecure = false\nremove_uploaded = true\n"
        );
        let (_tmp, path) = write(&content);
        let upload = Config::load(&path).unwrap().upload;

        assert_eq!(upload.bucket_prefix, "db");
        assert_eq!(upload.thread_count, 8);
        assert_eq!(upload.chunk_size_mb, 16);
        assert_eq!(upload.retries, 2);
        assert_eq!(upload.acl, AccessPolicy::PublicRead);
        assert!(!upload.secure);
        assert!(upload.remove_uploaded);
    }

    #[test]
    fn unknown_acl_is_rejected() {
        let (_tmp, path) = write(&format!("{MINIMAL}acl = \"world-writable\"\n"));
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let (_tmp, path) = write(&format!("{MINIMAL}thread_count = 0\n"));
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Config::load(&tmp.path().join("absent.toml")).is_err());
    }

    #[test]
    fn roundtrip_toml() {
        let (_tmp, path) = write(MINIMAL);
        let config = Config::load(&path).unwrap();
        let parsed: Config = toml::from_str(&toml::to_string_pretty(&config).unwrap()).unwrap();
        assert_eq!(parsed.upload.bucket, "archive");
        assert_eq!(parsed.upload.host, "s3.example.com");
    }

    #[test]
    fn config_path_not_empty() {
        assert!(config_path().to_string_lossy().contains("backhaul"));
    }
}
