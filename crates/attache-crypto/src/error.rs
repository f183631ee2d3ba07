use thiserror::Error;

/// Codec failures. Decoding errors are terminal for the stream that produced
/// them: a [`crate::Decoder`] keeps returning the same value afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("secretbox failed to open chunk {chunk}")]
    BadSecretbox { chunk: u64 },

    #[error("signature too short in chunk {chunk}")]
    ShortSignature { chunk: u64 },

    #[error("signature failed to verify for chunk {chunk}")]
    BadSignature { chunk: u64 },

    #[error("signature prefix must be ASCII without NUL bytes: {0:?}")]
    InvalidPrefix(String),

    #[error("sealing chunk {chunk} failed")]
    SealFailed { chunk: u64 },

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    BadSecretbox,
    ShortSignature,
    BadSignature,
    InvalidPrefix,
    SealFailed,
    InvalidKey,
}

impl CodecError {
    pub fn kind(&self) -> CodecErrorKind {
        match self {
            CodecError::BadSecretbox { .. } => CodecErrorKind::BadSecretbox,
            CodecError::ShortSignature { .. } => CodecErrorKind::ShortSignature,
            CodecError::BadSignature { .. } => CodecErrorKind::BadSignature,
            CodecError::InvalidPrefix(_) => CodecErrorKind::InvalidPrefix,
            CodecError::SealFailed { .. } => CodecErrorKind::SealFailed,
            CodecError::InvalidKey(_) => CodecErrorKind::InvalidKey,
        }
    }

    /// True for the failures that mean the ciphertext itself is bad.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self.kind(),
            CodecErrorKind::BadSecretbox | CodecErrorKind::ShortSignature | CodecErrorKind::BadSignature
        )
    }
}
