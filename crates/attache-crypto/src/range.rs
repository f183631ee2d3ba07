//! Chunk arithmetic for random access: maps plaintext byte ranges to the
//! sealed chunks (and ciphertext byte ranges) that cover them.

use crate::{packet_len, sealed_size, CHUNK_LEN};

/// One chunk's position in plaintext and ciphertext coordinates.
/// All `*_end` offsets are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: u64,
    pub plaintext_start: u64,
    pub plaintext_end: u64,
    pub cipher_start: u64,
    pub cipher_end: u64,
}

/// Layout of chunk `index` assuming it is a full chunk.
pub fn chunk_from_index(index: u64) -> ChunkSpec {
    let chunk = CHUNK_LEN as u64;
    let packet = packet_len(CHUNK_LEN) as u64;
    ChunkSpec {
        index,
        plaintext_start: index * chunk,
        plaintext_end: (index + 1) * chunk,
        cipher_start: index * packet,
        cipher_end: (index + 1) * packet,
    }
}

/// Chunks covering plaintext bytes `[begin, end)` of an object whose
/// plaintext is `plaintext_len` bytes. `end` is clamped to the object; the
/// final chunk's bounds are clamped to the real object size.
pub fn chunks_in_range(begin: u64, end: u64, plaintext_len: u64) -> Vec<ChunkSpec> {
    let end = end.min(plaintext_len);
    if begin >= end {
        return Vec::new();
    }
    let chunk = CHUNK_LEN as u64;
    let first = begin / chunk;
    let last = (end - 1) / chunk;

    let mut specs: Vec<ChunkSpec> = (first..=last).map(chunk_from_index).collect();
    if let Some(tail) = specs.last_mut() {
        tail.plaintext_end = tail.plaintext_end.min(plaintext_len);
        tail.cipher_end = tail.cipher_end.min(sealed_size(plaintext_len));
    }
    specs
}
