//! [`ObjectStore`] over OpenDAL operators, one per bucket.
//!
//! OpenDAL exposes no resumable multipart API, so uploads are staged as
//! ordinary objects:
//!
//! ```text
//! _multipart/{upload_id}/{number:05}.{etag}
//! ```
//!
//! `upload_id` is derived from the destination, which makes staged parts
//! discoverable after a restart. `complete_multipart` streams the listed parts
//! into the final object through a chunked OpenDAL writer (real multipart on
//! S3), then deletes the staging objects.

use anyhow::{Context, Result};
use async_trait::async_trait;
use attache_core::{Destination, Part};
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::store::{etag_of, upload_id_for, MultipartHandle, ObjectStore};

const STAGING_ROOT: &str = "_multipart";

/// Writer chunk size for assembling the final object. S3 rejects
/// non-terminal parts below 5 MiB.
const ASSEMBLY_CHUNK: usize = 8 * 1024 * 1024;

pub struct OpendalStore {
    buckets: HashMap<String, Operator>,
}

impl OpendalStore {
    pub fn new(bucket: impl Into<String>, op: Operator) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(bucket.into(), op);
        Self { buckets }
    }

    /// Serve another bucket from the same store.
    pub fn with_bucket(mut self, bucket: impl Into<String>, op: Operator) -> Self {
        self.buckets.insert(bucket.into(), op);
        self
    }

    /// The operator serving `bucket`, e.g. for a health check.
    pub fn operator(&self, bucket: &str) -> Result<&Operator> {
        self.buckets
            .get(bucket)
            .with_context(|| format!("no storage operator configured for bucket {bucket:?}"))
    }

    async fn staged(&self, handle: &MultipartHandle) -> Result<Vec<(String, Part)>> {
        let op = self.operator(&handle.dest.bucket)?;
        let dir = staging_dir(handle);
        let entries = match op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("listing staged parts: {dir}")),
        };

        let mut staged = Vec::new();
        for entry in entries {
            if entry.metadata().is_dir() {
                continue;
            }
            let Some((number, etag)) = parse_part_name(entry.name()) else {
                continue;
            };
            let size = op
                .stat(entry.path())
                .await
                .with_context(|| format!("stat staged part: {}", entry.path()))?
                .content_length();
            staged.push((entry.path().to_string(), Part { number, etag, size }));
        }
        staged.sort_by(|a, b| (a.1.number, &a.1.etag).cmp(&(b.1.number, &b.1.etag)));
        Ok(staged)
    }

    async fn clear_staging(&self, handle: &MultipartHandle) -> Result<usize> {
        let op = self.operator(&handle.dest.bucket)?;
        let staged = self.staged(handle).await?;
        for (path, _) in &staged {
            op.delete(path)
                .await
                .with_context(|| format!("deleting staged part: {path}"))?;
        }
        Ok(staged.len())
    }
}

fn staging_dir(handle: &MultipartHandle) -> String {
    format!("{STAGING_ROOT}/{}/", handle.upload_id)
}

fn part_path(handle: &MultipartHandle, number: u32, etag: &str) -> String {
    format!("{STAGING_ROOT}/{}/{number:05}.{etag}", handle.upload_id)
}

fn parse_part_name(name: &str) -> Option<(u32, String)> {
    let (number, etag) = name.split_once('.')?;
    let number = number.parse().ok()?;
    if etag.is_empty() || number == 0 {
        return None;
    }
    Some((number, etag.to_string()))
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn put_object(&self, dest: &Destination, body: Bytes) -> Result<String> {
        let op = self.operator(&dest.bucket)?;
        let etag = etag_of(&body);
        let size = body.len();
        op.write(&dest.key, body)
            .await
            .with_context(|| format!("uploading object: {dest}"))?;
        debug!(%dest, size, "object stored");
        Ok(etag)
    }

    async fn initiate_multipart(&self, dest: &Destination) -> Result<MultipartHandle> {
        self.operator(&dest.bucket)?;
        let handle = MultipartHandle {
            dest: dest.clone(),
            upload_id: upload_id_for(dest),
        };
        debug!(%dest, upload_id = %handle.upload_id, "multipart upload open");
        Ok(handle)
    }

    async fn list_parts(&self, handle: &MultipartHandle) -> Result<Vec<Part>> {
        Ok(self
            .staged(handle)
            .await?
            .into_iter()
            .map(|(_, part)| part)
            .collect())
    }

    async fn put_part(&self, handle: &MultipartHandle, number: u32, body: Bytes) -> Result<Part> {
        anyhow::ensure!(number >= 1, "part numbers start at 1");
        let op = self.operator(&handle.dest.bucket)?;
        let etag = etag_of(&body);
        let part = Part {
            number,
            etag: etag.clone(),
            size: body.len() as u64,
        };
        let path = part_path(handle, number, &etag);
        op.write(&path, body)
            .await
            .with_context(|| format!("uploading part {number}: {}", handle.dest))?;

        for (stale, old) in self.staged(handle).await? {
            if old.number == number && old.etag != etag {
                op.delete(&stale)
                    .await
                    .with_context(|| format!("replacing staged part: {stale}"))?;
            }
        }
        Ok(part)
    }

    async fn complete_multipart(&self, handle: &MultipartHandle, mut parts: Vec<Part>) -> Result<()> {
        let op = self.operator(&handle.dest.bucket)?;
        parts.sort_by_key(|p| p.number);
        if let Some(w) = parts.windows(2).find(|w| w[0].number == w[1].number) {
            anyhow::bail!("part {} listed twice", w[0].number);
        }

        let mut writer = op
            .writer_with(&handle.dest.key)
            .chunk(ASSEMBLY_CHUNK)
            .await
            .with_context(|| format!("opening writer: {}", handle.dest))?;
        let mut total = 0u64;
        for part in &parts {
            let path = part_path(handle, part.number, &part.etag);
            let data = op
                .read(&path)
                .await
                .with_context(|| format!("reading staged part {}", part.number))?
                .to_bytes();
            anyhow::ensure!(
                etag_of(&data) == part.etag && data.len() as u64 == part.size,
                "staged part {} does not match its ETag",
                part.number
            );
            total += data.len() as u64;
            writer
                .write(data)
                .await
                .with_context(|| format!("assembling part {}", part.number))?;
        }
        writer
            .close()
            .await
            .with_context(|| format!("finalizing object: {}", handle.dest))?;

        let removed = self.clear_staging(handle).await?;
        info!(dest = %handle.dest, parts = parts.len(), bytes = total, removed, "multipart upload complete");
        Ok(())
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        let removed = self.clear_staging(handle).await?;
        debug!(dest = %handle.dest, removed, "multipart upload aborted");
        Ok(())
    }

    async fn get_range(&self, dest: &Destination, start: u64, end: u64) -> Result<Bytes> {
        if start >= end {
            return Ok(Bytes::new());
        }
        let op = self.operator(&dest.bucket)?;
        let buf = op
            .read_with(&dest.key)
            .range(start..end)
            .await
            .with_context(|| format!("reading {dest} [{start}, {end})"))?;
        Ok(buf.to_bytes())
    }

    async fn stat(&self, dest: &Destination) -> Result<Option<u64>> {
        let op = self.operator(&dest.bucket)?;
        match op.stat(&dest.key).await {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat: {dest}")),
        }
    }

    async fn delete(&self, dest: &Destination) -> Result<()> {
        let op = self.operator(&dest.bucket)?;
        op.delete(&dest.key)
            .await
            .with_context(|| format!("deleting: {dest}"))
    }
}
