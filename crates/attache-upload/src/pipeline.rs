//! Resumable upload pipeline: hash → stash → seal → split → bounded upload → complete.
//!
//! Objects whose sealed size is under the multipart threshold go up in one
//! PUT and are not resumable. Larger objects use a multipart upload whose
//! keys and block hashes live in the [`AttachmentStash`] until `Complete`
//! succeeds. A later call for the same plaintext and destination reuses the
//! stored keys, skips parts the store already holds and refuses to continue
//! if any sealed block differs from what the stash recorded.

use attache_core::config::UploadConfig;
use attache_core::{Destination, Part};
use attache_crypto::{sealed_size, Encoder, EncryptionContext, SignaturePrefix};
use attache_storage::{MultipartHandle, ObjectStore};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::descriptor::ObjectDescriptor;
use crate::error::UploadError;
use crate::limiter::UploadLimiter;
use crate::progress::{ProgressFn, ThrottledProgress};
use crate::source::PlaintextSource;
use crate::stash::{AttachmentInfo, AttachmentStash, StashKey};

const READ_BUF_SIZE: usize = 256 * 1024;

/// Called with the context chosen for every upload attempt, fresh or resumed.
pub type KeyObserver = Arc<dyn Fn(&EncryptionContext) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub part_size: usize,
    pub multipart_threshold: u64,
    pub progress_interval: Duration,
    pub prefix: SignaturePrefix,
}

impl UploaderConfig {
    pub fn from_core(cfg: &UploadConfig) -> Result<Self, UploadError> {
        if cfg.part_size == 0 {
            return Err(UploadError::Config("part_size must be positive".into()));
        }
        let prefix = SignaturePrefix::new(cfg.signature_prefix.clone())?;
        Ok(Self {
            part_size: cfg.part_size,
            multipart_threshold: cfg.multipart_threshold,
            progress_interval: Duration::from_millis(cfg.progress_interval_ms),
            prefix,
        })
    }
}

/// One object to upload.
pub struct UploadTask<S> {
    pub source: S,
    /// Plaintext length; both read passes must see exactly this many bytes.
    pub size: u64,
    pub dest: Destination,
    pub progress: Option<ProgressFn>,
}

impl<S: PlaintextSource> UploadTask<S> {
    pub fn new(source: S, size: u64, dest: Destination) -> Self {
        Self {
            source,
            size,
            dest,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub descriptor: ObjectDescriptor,
    /// Parts sent over the network by this call
    pub parts_uploaded: usize,
    /// Parts the store already held from an earlier attempt
    pub parts_reused: usize,
    /// Whether the keys came from the stash
    pub resumed: bool,
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    stash: Arc<dyn AttachmentStash>,
    limiter: Arc<UploadLimiter>,
    config: UploaderConfig,
    key_observer: Option<KeyObserver>,
}

type PartResult = Result<Part, UploadError>;

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        stash: Arc<dyn AttachmentStash>,
        limiter: Arc<UploadLimiter>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            store,
            stash,
            limiter,
            config,
            key_observer: None,
        }
    }

    pub fn with_key_observer(mut self, observer: KeyObserver) -> Self {
        self.key_observer = Some(observer);
        self
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Upload one object, resuming a previous attempt when the stash holds a
    /// record for the same plaintext and destination.
    ///
    /// On `AbortOnPartMismatch` the stash record is already gone: reset the
    /// source and call again to start over with fresh keys. On `Cancelled`
    /// (or any storage error) the record is kept for a later resume.
    pub async fn upload_asset<S: PlaintextSource>(
        &self,
        task: &mut UploadTask<S>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let span = info_span!("upload", dest = %task.dest, size = task.size);
        async move {
            let content_hash = hash_source(&mut task.source, task.size, cancel).await?;
            task.source.reset().await?;

            let sealed = sealed_size(task.size);
            let progress = ThrottledProgress::new(
                task.progress.clone(),
                sealed,
                self.config.progress_interval,
            );
            progress.start();

            if sealed < self.config.multipart_threshold {
                self.single_put(task, content_hash, sealed, &progress, cancel).await
            } else {
                self.multipart(task, content_hash, sealed, &progress, cancel).await
            }
        }
        .instrument(span)
        .await
    }

    /// Drop any stash record and staged parts for `dest` + `content_hash`,
    /// so the next upload starts with fresh keys.
    pub async fn abort(&self, dest: &Destination, content_hash: &str) -> Result<(), UploadError> {
        let key = StashKey::new(content_hash, dest.clone());
        self.stash.finish(&key).await?;
        let handle = self
            .store
            .initiate_multipart(dest)
            .await
            .map_err(UploadError::Storage)?;
        self.store
            .abort_multipart(&handle)
            .await
            .map_err(UploadError::Storage)?;
        info!(%key, "upload aborted");
        Ok(())
    }

    fn observe(&self, ctx: &EncryptionContext) {
        if let Some(observer) = &self.key_observer {
            observer(ctx);
        }
    }

    fn descriptor(
        &self,
        dest: &Destination,
        size: u64,
        sealed: u64,
        content_hash: String,
        ctx: &EncryptionContext,
    ) -> ObjectDescriptor {
        ObjectDescriptor {
            dest: dest.clone(),
            plaintext_size: size,
            sealed_size: sealed,
            content_hash,
            keys: ctx.decryption_keys(),
            signature_prefix: self.config.prefix.clone(),
        }
    }

    async fn single_put<S: PlaintextSource>(
        &self,
        task: &mut UploadTask<S>,
        content_hash: String,
        sealed: u64,
        progress: &ThrottledProgress,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let ctx = EncryptionContext::generate();
        self.observe(&ctx);

        let mut encoder = Encoder::new(&ctx, &self.config.prefix);
        let mut body = Vec::with_capacity(sealed as usize);
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut read_total = 0u64;
        loop {
            let n = cancellable(cancel, task.source.read(&mut buf)).await?;
            if n == 0 {
                break;
            }
            read_total += n as u64;
            body.extend_from_slice(&encoder.write(&buf[..n])?);
        }
        check_length(read_total, task.size)?;
        body.extend_from_slice(&encoder.finish()?);

        let store = self.store.clone();
        let dest = task.dest.clone();
        cancellable(cancel, async move {
            store
                .put_object(&dest, Bytes::from(body))
                .await
                .map_err(UploadError::Storage)
        })
        .await?;
        progress.finish();

        info!(bytes = sealed, "attachment uploaded in a single request");
        Ok(UploadOutcome {
            descriptor: self.descriptor(&task.dest, task.size, sealed, content_hash, &ctx),
            parts_uploaded: 1,
            parts_reused: 0,
            resumed: false,
        })
    }

    async fn multipart<S: PlaintextSource>(
        &self,
        task: &mut UploadTask<S>,
        content_hash: String,
        sealed: u64,
        progress: &ThrottledProgress,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let key = StashKey::new(content_hash.clone(), task.dest.clone());

        let (ctx, recorded, resumed) = match cancellable(cancel, self.stash.lookup(&key)).await? {
            Some(info) => {
                info!(%key, recorded_parts = info.parts.len(), "resuming interrupted upload");
                (info.context, info.parts, true)
            }
            None => {
                let ctx = EncryptionContext::generate();
                let info = AttachmentInfo::new(task.dest.key.clone(), ctx.clone());
                cancellable(cancel, self.stash.start(&key, info)).await?;
                debug!(%key, "upload recorded in stash");
                (ctx, BTreeMap::new(), false)
            }
        };
        self.observe(&ctx);

        let handle = cancellable(cancel, async {
            self.store
                .initiate_multipart(&task.dest)
                .await
                .map_err(UploadError::Storage)
        })
        .await?;

        let remote: HashSet<Part> = if resumed {
            let parts = cancellable(cancel, async {
                self.store
                    .list_parts(&handle)
                    .await
                    .map_err(UploadError::Storage)
            })
            .await?;
            debug!(remote_parts = parts.len(), "listed parts held by the store");
            parts.into_iter().collect()
        } else {
            HashSet::new()
        };

        let part_size = self.config.part_size;
        let mut encoder = Encoder::new(&ctx, &self.config.prefix);
        let mut pending: Vec<u8> = Vec::with_capacity(part_size + READ_BUF_SIZE);
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut read_total = 0u64;
        let mut eof = false;

        let mut part_number = 0u32;
        let mut workers: JoinSet<PartResult> = JoinSet::new();
        let mut done: Vec<Part> = Vec::new();
        let mut uploaded = 0usize;
        let mut reused = 0usize;

        loop {
            while !eof && pending.len() < part_size {
                let n = cancellable(cancel, task.source.read(&mut buf)).await?;
                if n == 0 {
                    eof = true;
                    check_length(read_total, task.size)?;
                    pending.extend_from_slice(&encoder.finish()?);
                } else {
                    read_total += n as u64;
                    pending.extend_from_slice(&encoder.write(&buf[..n])?);
                }
            }
            if pending.is_empty() {
                break;
            }

            let rest = pending.split_off(part_size.min(pending.len()));
            let block = std::mem::replace(&mut pending, rest);
            part_number += 1;
            let part = Part {
                number: part_number,
                etag: hex::encode(Sha256::digest(&block)),
                size: block.len() as u64,
            };

            if let Some(expected) = recorded.get(&part.number) {
                if *expected != part.etag {
                    drop(workers);
                    return Err(self.abort_mismatch(&key, &handle, part.number).await);
                }
            }

            if remote.contains(&part) {
                debug!(part = part.number, "part already stored");
                progress.advance(part.size);
                reused += 1;
                done.push(part);
                continue;
            }

            let permit = self.limiter.acquire(cancel).await?;
            cancellable(cancel, self.stash.record_part(&key, part.number, &part.etag)).await?;

            let store = self.store.clone();
            let handle = handle.clone();
            workers.spawn(async move {
                let _permit = permit;
                let stored = store
                    .put_part(&handle, part.number, Bytes::from(block))
                    .await
                    .map_err(UploadError::Storage)?;
                if stored.etag != part.etag || stored.size != part.size {
                    return Err(UploadError::Storage(anyhow::anyhow!(
                        "store reported ETag {} for part {}, expected {}",
                        stored.etag,
                        part.number,
                        part.etag
                    )));
                }
                Ok(part)
            });

            while let Some(joined) = workers.try_join_next() {
                let part = flatten_join(joined)?;
                progress.advance(part.size);
                uploaded += 1;
                done.push(part);
            }
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                joined = workers.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let part = flatten_join(joined)?;
            progress.advance(part.size);
            uploaded += 1;
            done.push(part);
        }

        done.sort_by_key(|p| p.number);
        debug_assert_eq!(done.len(), part_number as usize);
        cancellable(cancel, async {
            self.store
                .complete_multipart(&handle, done)
                .await
                .map_err(UploadError::Storage)
        })
        .await?;
        self.stash.finish(&key).await?;
        progress.finish();

        info!(
            parts = part_number,
            uploaded,
            reused,
            resumed,
            bytes = sealed,
            "multipart upload complete"
        );
        Ok(UploadOutcome {
            descriptor: self.descriptor(&task.dest, task.size, sealed, content_hash, &ctx),
            parts_uploaded: uploaded,
            parts_reused: reused,
            resumed,
        })
    }

    async fn abort_mismatch(&self, key: &StashKey, handle: &MultipartHandle, part: u32) -> UploadError {
        warn!(%key, part, "resumed part does not match the stash; abandoning upload");
        if let Err(e) = self.stash.finish(key).await {
            return UploadError::Stash(e);
        }
        if let Err(e) = self.store.abort_multipart(handle).await {
            warn!(%key, error = %e, "failed to discard staged parts");
        }
        UploadError::AbortOnPartMismatch { part }
    }
}

async fn hash_source<S: PlaintextSource>(
    source: &mut S,
    size: u64,
    cancel: &CancellationToken,
) -> Result<String, UploadError> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = cancellable(cancel, source.read(&mut buf)).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    check_length(total, size)?;
    Ok(hex::encode(hasher.finalize()))
}

fn check_length(read: u64, expected: u64) -> Result<(), UploadError> {
    if read != expected {
        return Err(UploadError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("plaintext source yielded {read} bytes, expected {expected}"),
        )));
    }
    Ok(())
}

fn flatten_join(joined: Result<PartResult, tokio::task::JoinError>) -> PartResult {
    joined.map_err(|e| UploadError::Storage(anyhow::anyhow!("part upload task failed: {e}")))?
}

async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, UploadError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<UploadError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}
