//! Upload stash: durable record of in-progress multipart uploads.
//!
//! A record holds the object's encryption secrets and the SHA-256 of every
//! sealed block handed to the store so far. It is written before the keys
//! produce a single wire byte and deleted once the upload completes, so a
//! crashed upload either resumes with identical content or starts over with
//! fresh keys.
//!
//! Backends:
//!   - **JSON file** (default): whole map in memory, every mutation flushed
//!     atomically via temp+rename before the call returns.
//!   - **RocksDB** (behind the `rocksdb` feature): one key per record, synced
//!     writes.
//!   - **Memory**: non-durable, for tests.

use async_trait::async_trait;
use attache_core::Destination;
use attache_crypto::EncryptionContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::error::StashError;

/// Identity of one in-flight upload: plaintext content plus destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StashKey {
    /// Hex SHA-256 of the plaintext
    pub content_hash: String,
    pub dest: Destination,
}

impl StashKey {
    pub fn new(content_hash: impl Into<String>, dest: Destination) -> Self {
        Self {
            content_hash: content_hash.into(),
            dest,
        }
    }
}

impl fmt::Display for StashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.content_hash, self.dest)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    /// Destination object key
    pub object_key: String,
    pub context: EncryptionContext,
    /// Part number → hex SHA-256 of the sealed block
    #[serde(default)]
    pub parts: BTreeMap<u32, String>,
    /// Unix timestamp (seconds) of `start`
    pub started_at: u64,
}

impl AttachmentInfo {
    pub fn new(object_key: impl Into<String>, context: EncryptionContext) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            object_key: object_key.into(),
            context,
            parts: BTreeMap::new(),
            started_at,
        }
    }
}

#[async_trait]
pub trait AttachmentStash: Send + Sync {
    /// Create or overwrite the record for `key`.
    async fn start(&self, key: &StashKey, info: AttachmentInfo) -> Result<(), StashError>;

    async fn lookup(&self, key: &StashKey) -> Result<Option<AttachmentInfo>, StashError>;

    /// Set the hash for one part. Fails with `PartNotFound` if `key` has no record.
    async fn record_part(&self, key: &StashKey, number: u32, hash: &str) -> Result<(), StashError>;

    /// Delete the record for `key`. Finishing an absent key is not an error.
    async fn finish(&self, key: &StashKey) -> Result<(), StashError>;

    /// All records, keyed by `StashKey` display form.
    async fn list(&self) -> Result<Vec<(String, AttachmentInfo)>, StashError>;
}

/// Open the appropriate backend based on path extension.
///
/// Paths ending in `.json` use the JSON backend; otherwise RocksDB (if
/// compiled with the `rocksdb` feature).
pub fn open_stash(path: &Path) -> Result<Arc<dyn AttachmentStash>, StashError> {
    let is_json = path.extension().map(|ext| ext == "json").unwrap_or(false);

    #[cfg(feature = "rocksdb")]
    if !is_json {
        return Ok(Arc::new(RocksDbStash::open(path)?));
    }

    #[cfg(not(feature = "rocksdb"))]
    if !is_json {
        tracing::warn!(
            path = %path.display(),
            "RocksDB not compiled in (missing 'rocksdb' feature), using a JSON stash next to it"
        );
        return Ok(Arc::new(FileStash::open(&path.with_extension("json"))?));
    }

    Ok(Arc::new(FileStash::open(path)?))
}

// ── JSON file backend ────────────────────────────────────────────────────────

pub struct FileStash {
    path: PathBuf,
    entries: Mutex<HashMap<String, AttachmentInfo>>,
}

impl FileStash {
    /// Load or create a stash at the given path. A missing file is an empty stash.
    pub fn open(path: &Path) -> Result<Self, StashError> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| StashError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &HashMap<String, AttachmentInfo>) -> Result<(), StashError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StashError::Io { path, source }
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
            }
        }

        let json = serde_json::to_vec_pretty(entries)?;
        let tmp_path = self.path.with_extension("tmp");
        write_private(&tmp_path, &json).await.map_err(io_err(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_err(&self.path))?;
        Ok(())
    }
}

/// Write `data` to a fresh file readable by the owner only.
async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut file = opts.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

#[async_trait]
impl AttachmentStash for FileStash {
    async fn start(&self, key: &StashKey, info: AttachmentInfo) -> Result<(), StashError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), info);
        self.flush(&entries).await
    }

    async fn lookup(&self, key: &StashKey) -> Result<Option<AttachmentInfo>, StashError> {
        Ok(self.entries.lock().await.get(&key.to_string()).cloned())
    }

    async fn record_part(&self, key: &StashKey, number: u32, hash: &str) -> Result<(), StashError> {
        let mut entries = self.entries.lock().await;
        let info = entries
            .get_mut(&key.to_string())
            .ok_or_else(|| StashError::PartNotFound(key.to_string()))?;
        if info.parts.get(&number).map(String::as_str) == Some(hash) {
            return Ok(());
        }
        info.parts.insert(number, hash.to_string());
        self.flush(&entries).await
    }

    async fn finish(&self, key: &StashKey) -> Result<(), StashError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(&key.to_string()).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, AttachmentInfo)>, StashError> {
        let entries = self.entries.lock().await;
        let mut all: Vec<_> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

// ── In-memory backend ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStash {
    entries: Mutex<HashMap<String, AttachmentInfo>>,
}

impl MemoryStash {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttachmentStash for MemoryStash {
    async fn start(&self, key: &StashKey, info: AttachmentInfo) -> Result<(), StashError> {
        self.entries.lock().await.insert(key.to_string(), info);
        Ok(())
    }

    async fn lookup(&self, key: &StashKey) -> Result<Option<AttachmentInfo>, StashError> {
        Ok(self.entries.lock().await.get(&key.to_string()).cloned())
    }

    async fn record_part(&self, key: &StashKey, number: u32, hash: &str) -> Result<(), StashError> {
        let mut entries = self.entries.lock().await;
        let info = entries
            .get_mut(&key.to_string())
            .ok_or_else(|| StashError::PartNotFound(key.to_string()))?;
        info.parts.insert(number, hash.to_string());
        Ok(())
    }

    async fn finish(&self, key: &StashKey) -> Result<(), StashError> {
        self.entries.lock().await.remove(&key.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, AttachmentInfo)>, StashError> {
        let entries = self.entries.lock().await;
        let mut all: Vec<_> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

// ── RocksDB backend ──────────────────────────────────────────────────────────

#[cfg(feature = "rocksdb")]
mod rocksdb_backend {
    use super::*;

    /// RocksDB-backed stash. Every write is synced to the WAL before returning.
    pub struct RocksDbStash {
        db: rocksdb::DB,
        /// Serializes read-modify-write in `record_part`
        write_lock: Mutex<()>,
    }

    impl RocksDbStash {
        pub fn open(path: &Path) -> Result<Self, StashError> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);
            let db = rocksdb::DB::open(&opts, path)
                .map_err(|e| StashError::Backend(format!("opening {}: {e}", path.display())))?;
            Ok(Self {
                db,
                write_lock: Mutex::new(()),
            })
        }

        fn put(&self, key: &str, info: &AttachmentInfo) -> Result<(), StashError> {
            let json = serde_json::to_vec(info)?;
            let mut wo = rocksdb::WriteOptions::default();
            wo.set_sync(true);
            self.db
                .put_opt(key.as_bytes(), json, &wo)
                .map_err(|e| StashError::Backend(format!("put {key}: {e}")))
        }

        fn get(&self, key: &str) -> Result<Option<AttachmentInfo>, StashError> {
            match self
                .db
                .get(key.as_bytes())
                .map_err(|e| StashError::Backend(format!("get {key}: {e}")))?
            {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl AttachmentStash for RocksDbStash {
        async fn start(&self, key: &StashKey, info: AttachmentInfo) -> Result<(), StashError> {
            let _guard = self.write_lock.lock().await;
            self.put(&key.to_string(), &info)
        }

        async fn lookup(&self, key: &StashKey) -> Result<Option<AttachmentInfo>, StashError> {
            self.get(&key.to_string())
        }

        async fn record_part(&self, key: &StashKey, number: u32, hash: &str) -> Result<(), StashError> {
            let _guard = self.write_lock.lock().await;
            let k = key.to_string();
            let mut info = self.get(&k)?.ok_or_else(|| StashError::PartNotFound(k.clone()))?;
            info.parts.insert(number, hash.to_string());
            self.put(&k, &info)
        }

        async fn finish(&self, key: &StashKey) -> Result<(), StashError> {
            let _guard = self.write_lock.lock().await;
            let k = key.to_string();
            let mut wo = rocksdb::WriteOptions::default();
            wo.set_sync(true);
            self.db
                .delete_opt(k.as_bytes(), &wo)
                .map_err(|e| StashError::Backend(format!("delete {k}: {e}")))
        }

        async fn list(&self) -> Result<Vec<(String, AttachmentInfo)>, StashError> {
            let mut all = Vec::new();
            for item in self.db.iterator(rocksdb::IteratorMode::Start) {
                let (k, v) = item.map_err(|e| StashError::Backend(format!("iterating: {e}")))?;
                all.push((
                    String::from_utf8_lossy(&k).to_string(),
                    serde_json::from_slice(&v)?,
                ));
            }
            Ok(all)
        }
    }
}

#[cfg(feature = "rocksdb")]
pub use rocksdb_backend::RocksDbStash;
