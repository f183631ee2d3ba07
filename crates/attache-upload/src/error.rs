use attache_crypto::CodecError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StashError {
    /// `record_part` on a key that was never started (or already finished)
    #[error("no upload in progress for {0}")]
    PartNotFound(String),

    #[error("stash I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stash encoding: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("stash backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    /// A resumed block differs from what the previous attempt sent under the
    /// same keys. The stash record is gone; retry from a reset source.
    #[error("part {part} differs from the interrupted upload; restart with fresh keys")]
    AbortOnPartMismatch { part: u32 },

    #[error("upload cancelled")]
    Cancelled,

    #[error(transparent)]
    Stash(#[from] StashError),

    #[error("storage: {0:#}")]
    Storage(anyhow::Error),

    #[error("reading plaintext: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid upload settings: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage: {0:#}")]
    Storage(anyhow::Error),

    #[error("short read at ciphertext offset {offset}: expected {expected} bytes, got {got}")]
    ShortRange { offset: u64, expected: u64, got: u64 },
}

impl From<ReaderError> for std::io::Error {
    fn from(e: ReaderError) -> Self {
        let kind = match &e {
            ReaderError::Codec(_) => std::io::ErrorKind::InvalidData,
            ReaderError::ShortRange { .. } => std::io::ErrorKind::UnexpectedEof,
            ReaderError::Storage(_) => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}
