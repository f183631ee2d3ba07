//! The narrow object-store contract consumed by the upload pipeline and the
//! random-access reader.

use anyhow::Result;
use async_trait::async_trait;
use attache_core::{Destination, Part};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An open multipart upload. Stores return the same handle for repeated
/// `initiate_multipart` calls on one destination until it is completed or
/// aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartHandle {
    pub dest: Destination,
    pub upload_id: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a whole object in one request. Returns its ETag.
    async fn put_object(&self, dest: &Destination, body: Bytes) -> Result<String>;

    /// Open a multipart upload, or reuse the one already open for `dest`.
    async fn initiate_multipart(&self, dest: &Destination) -> Result<MultipartHandle>;

    /// Parts the server already holds for this upload, sorted by number.
    async fn list_parts(&self, handle: &MultipartHandle) -> Result<Vec<Part>>;

    /// Upload one part. Re-uploading a number replaces the previous body.
    async fn put_part(&self, handle: &MultipartHandle, number: u32, body: Bytes) -> Result<Part>;

    /// Assemble the object from `parts` in part-number order.
    async fn complete_multipart(&self, handle: &MultipartHandle, parts: Vec<Part>) -> Result<()>;

    /// Discard an open upload and every part staged under it.
    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()>;

    /// Bytes `[start, end)` of a stored object.
    async fn get_range(&self, dest: &Destination, start: u64, end: u64) -> Result<Bytes>;

    /// Size of a stored object, or `None` if it does not exist.
    async fn stat(&self, dest: &Destination) -> Result<Option<u64>>;

    async fn delete(&self, dest: &Destination) -> Result<()>;
}

/// ETag used by every store in this crate: lowercase hex SHA-256 of the body.
pub fn etag_of(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Deterministic upload id for a destination, so an interrupted upload is
/// found again after a restart.
pub(crate) fn upload_id_for(dest: &Destination) -> String {
    let digest = Sha256::digest(dest.to_string().as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_hex_sha256() {
        assert_eq!(
            etag_of(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn upload_id_is_stable_per_destination() {
        let a = Destination::new("attachments", "conv/1");
        let b = Destination::new("attachments", "conv/2");
        assert_eq!(upload_id_for(&a), upload_id_for(&a));
        assert_ne!(upload_id_for(&a), upload_id_for(&b));
        assert_eq!(upload_id_for(&a).len(), 32);
    }
}
