use thiserror::Error;

pub type AttacheResult<T> = Result<T, AttacheError>;

#[derive(Debug, Error)]
pub enum AttacheError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("stash error: {0}")]
    Stash(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid destination: {0}")]
    Destination(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
