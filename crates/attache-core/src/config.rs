use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AttacheError, AttacheResult};

/// Top-level configuration (loaded from attache.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttacheConfig {
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub stash: StashConfig,
    pub log: LogConfig,
}

impl AttacheConfig {
    /// Load from a TOML file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> AttacheResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| AttacheError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible endpoint via OpenDAL
    S3,
    /// Local directory via OpenDAL's fs service
    Fs,
    /// Process-local memory (testing only, nothing survives exit)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Default bucket name
    pub bucket: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Size of each multipart part in bytes (default: 5 MiB)
    pub part_size: usize,
    /// Sealed objects smaller than this go up in a single PUT (default: 5 MiB)
    pub multipart_threshold: u64,
    /// Process-wide limit on concurrent part uploads
    pub concurrency: usize,
    /// Minimum spacing between intermediate progress callbacks
    pub progress_interval_ms: u64,
    /// Signature domain-separation prefix (ASCII, no NUL)
    pub signature_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    /// Upload stash location. A `.json` path uses the JSON file backend;
    /// anything else uses RocksDB when compiled with the `rocksdb` feature.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Expand a leading `~/` to `$HOME/`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        Err(_) => path.to_path_buf(),
    }
}

pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024;
pub const DEFAULT_SIGNATURE_PREFIX: &str = "attache-chat-attachment-1";

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "attachments".into(),
            root: PathBuf::from("~/.local/share/attache/objects"),
            enforce_tls: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            concurrency: 10,
            progress_interval_ms: 1000,
            signature_prefix: DEFAULT_SIGNATURE_PREFIX.into(),
        }
    }
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/attache/stash.json"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
backend = "s3"
endpoint = "https://s3.example.com:8333"
region = "us-west-2"
bucket = "chat-attachments"
enforce_tls = true

[upload]
part_size = 8388608
multipart_threshold = 10485760
concurrency = 4
progress_interval_ms = 250
signature_prefix = "example-attachment-2"

[stash]
path = "/var/lib/attache/stash.json"

[log]
level = "debug"
format = "json"
"#;
        let config: AttacheConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.endpoint, "https://s3.example.com:8333");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.storage.bucket, "chat-attachments");
        assert_eq!(config.upload.part_size, 8 * 1024 * 1024);
        assert_eq!(config.upload.multipart_threshold, 10 * 1024 * 1024);
        assert_eq!(config.upload.concurrency, 4);
        assert_eq!(config.upload.signature_prefix, "example-attachment-2");
        assert_eq!(config.stash.path, PathBuf::from("/var/lib/attache/stash.json"));
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: AttacheConfig = toml::from_str("").unwrap();

        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.upload.part_size, DEFAULT_PART_SIZE);
        assert_eq!(config.upload.multipart_threshold, DEFAULT_MULTIPART_THRESHOLD);
        assert_eq!(config.upload.progress_interval_ms, 1000);
        assert_eq!(config.upload.signature_prefix, DEFAULT_SIGNATURE_PREFIX);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[storage]
backend = "memory"
"#;
        let config: AttacheConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.bucket, "attachments");
        assert_eq!(config.upload.concurrency, 10);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = AttacheConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: AttacheConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.endpoint, parsed.storage.endpoint);
        assert_eq!(config.upload.part_size, parsed.upload.part_size);
        assert_eq!(config.stash.path, parsed.stash.path);
    }

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/.local/share/attache")),
            PathBuf::from(home).join(".local/share/attache")
        );
        assert_eq!(expand_tilde(Path::new("/var/lib/x")), PathBuf::from("/var/lib/x"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AttacheConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.bucket, "attachments");
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[upload\npart_size = ").unwrap();
        let err = AttacheConfig::load(&path).unwrap_err();
        assert!(matches!(err, AttacheError::Config(_)));
    }
}
