//! attache-crypto: chunked sign-then-encrypt codec for chat attachments
//!
//! Architecture: Sign-then-Encrypt per fixed-size chunk
//!
//! Pipeline: plaintext → 1 MiB chunks → SHA-512 → Ed25519 sign → XChaCha20-Poly1305 seal → concat
//!
//! Chunk layout:
//! ```text
//! chunk_nonce   = object_nonce (16 bytes) || chunk_index (8 bytes, big-endian)
//! signed_input  = prefix || 0x00 || enc_key || chunk_nonce || SHA512(plaintext)
//! sealed_chunk  = AEAD(enc_key, chunk_nonce, signature (64 bytes) || plaintext)
//! ```
//!
//! Every object ends with exactly one short chunk (possibly empty), so a stream
//! cut at a chunk boundary is detected as truncation.

pub mod codec;
pub mod error;
pub mod keys;
pub mod range;

pub use codec::{
    open_chunk_range, open_whole, seal_whole, Decoder, DecodingReader, Encoder, EncodingReader,
};
pub use error::{CodecError, CodecErrorKind};
pub use keys::{DecryptionKeys, EncryptionContext, SignaturePrefix};
pub use range::{chunk_from_index, chunks_in_range, ChunkSpec};

/// Plaintext bytes per chunk (2^20). Only the terminal chunk may be shorter.
pub const CHUNK_LEN: usize = 1 << 20;

/// Size of the per-object nonce
pub const NONCE_SIZE: usize = 16;

/// Size of the per-chunk AEAD nonce: object nonce || big-endian chunk index
pub const CHUNK_NONCE_SIZE: usize = 24;

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a detached Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Bytes added to every chunk: AEAD tag + signature
pub const CHUNK_OVERHEAD: usize = TAG_SIZE + SIGNATURE_SIZE;

/// Sealed length of one chunk holding `plaintext_len` bytes.
pub const fn packet_len(plaintext_len: usize) -> usize {
    plaintext_len + CHUNK_OVERHEAD
}

/// Total sealed length of an `n`-byte plaintext: every full chunk plus one
/// terminal chunk, which is present even when empty.
pub fn sealed_size(n: u64) -> u64 {
    let chunk = CHUNK_LEN as u64;
    let overhead = CHUNK_OVERHEAD as u64;
    overhead * (n / chunk + 1) + n
}

/// Inverse of [`sealed_size`]. Returns `None` when `sealed` cannot be the
/// length of a well-formed object (a terminal chunk shorter than the overhead).
pub fn plaintext_size(sealed: u64) -> Option<u64> {
    let packet = packet_len(CHUNK_LEN) as u64;
    let full = sealed / packet;
    let tail = sealed % packet;
    let tail_plain = tail.checked_sub(CHUNK_OVERHEAD as u64)?;
    Some(full * CHUNK_LEN as u64 + tail_plain)
}
