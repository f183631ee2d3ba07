//! OpenDAL Operator factory for attache storage backends

use anyhow::{Context, Result};
use attache_core::config::{expand_tilde, StorageBackend, StorageConfig};
use opendal::Operator;

/// Connection settings for one S3 bucket
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for an S3-compatible endpoint.
///
/// Uses path-style addressing (the opendal 0.55 default), which MinIO and
/// SeaweedFS require.
pub fn build_operator(cfg: &S3Config) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build the operator serving `bucket` from attache-core config.
///
/// `credentials` is `(access_key_id, secret_access_key)` and is required for
/// the S3 backend only. If `enforce_tls` is set and the S3 endpoint is plain
/// HTTP this returns an error; otherwise HTTP is allowed with a warning.
pub fn build_from_core_config(
    storage: &StorageConfig,
    bucket: &str,
    credentials: Option<(&str, &str)>,
) -> Result<Operator> {
    match storage.backend {
        StorageBackend::S3 => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP; set storage.enforce_tls = true and use HTTPS in production"
                );
            }
            let (access_key_id, secret_access_key) =
                credentials.context("S3 backend requires credentials")?;
            build_operator(&S3Config {
                endpoint: storage.endpoint.clone(),
                region: storage.region.clone(),
                bucket: bucket.to_string(),
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
            })
        }
        StorageBackend::Fs => {
            let root = expand_tilde(&storage.root).join(bucket);
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating fs storage root: {}", root.display()))?;
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Ok(Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish())
        }
        StorageBackend::Memory => {
            tracing::warn!("memory storage backend selected; objects do not outlive the process");
            Ok(Operator::new(opendal::services::Memory::default())
                .context("creating OpenDAL memory operator")?
                .finish())
        }
    }
}
