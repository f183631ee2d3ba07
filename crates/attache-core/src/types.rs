use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AttacheError, AttacheResult};

/// Where an attachment object lands in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub bucket: String,
    pub key: String,
}

impl Destination {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `bucket/key/with/slashes`. The first path segment is the bucket.
    pub fn parse(s: &str) -> AttacheResult<Self> {
        let s = s.trim_start_matches('/');
        match s.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(AttacheError::Destination(format!(
                "expected bucket/key, got {s:?}"
            ))),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// One part of a multipart upload as reported by the object store.
///
/// `etag` is the lowercase hex SHA-256 of the part body for every store in
/// this workspace, so it can be compared against locally computed block hashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Part {
    /// 1-based part number
    pub number: u32,
    pub etag: String,
    pub size: u64,
}
