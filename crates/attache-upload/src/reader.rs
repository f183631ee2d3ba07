//! Seekable plaintext view over a sealed object in an [`ObjectStore`].
//!
//! Reads are served from a small LRU of decoded chunks. A read counts as a
//! hit only when every chunk it touches is cached; otherwise the whole
//! covering ciphertext range is fetched and decoded again, including chunks
//! that were already cached.

use attache_core::Destination;
use attache_crypto::{chunks_in_range, open_chunk_range, ChunkSpec, DecryptionKeys, SignaturePrefix};
use attache_storage::ObjectStore;
use lru::LruCache;
use std::io::{self, SeekFrom};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

use crate::descriptor::ObjectDescriptor;
use crate::error::ReaderError;

/// Decoded chunks kept per reader
pub const DEFAULT_CACHE_CHUNKS: usize = 16;

const READ_TO_END_STEP: u64 = 8 * 1024 * 1024;

pub struct RandomAccessReader {
    store: Arc<dyn ObjectStore>,
    dest: Destination,
    keys: DecryptionKeys,
    prefix: SignaturePrefix,
    size: u64,
    pos: u64,
    cache: LruCache<u64, Vec<u8>>,
}

impl RandomAccessReader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dest: Destination,
        keys: DecryptionKeys,
        prefix: SignaturePrefix,
        plaintext_size: u64,
    ) -> Self {
        Self {
            store,
            dest,
            keys,
            prefix,
            size: plaintext_size,
            pos: 0,
            cache: LruCache::new(cache_capacity(DEFAULT_CACHE_CHUNKS)),
        }
    }

    pub fn from_descriptor(store: Arc<dyn ObjectStore>, descriptor: &ObjectDescriptor) -> Self {
        Self::new(
            store,
            descriptor.dest.clone(),
            descriptor.keys.clone(),
            descriptor.signature_prefix.clone(),
            descriptor.plaintext_size,
        )
    }

    pub fn with_cache_capacity(mut self, chunks: usize) -> Self {
        self.cache = LruCache::new(cache_capacity(chunks));
        self
    }

    /// Plaintext length of the object
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Move the cursor. Never touches the store; seeking past the end is
    /// allowed and reads there return 0.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }

    /// Read up to `buf.len()` bytes at the cursor. `Ok(0)` means end of object.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReaderError> {
        if buf.is_empty() || self.pos >= self.size {
            return Ok(0);
        }
        let begin = self.pos;
        let end = begin.saturating_add(buf.len() as u64).min(self.size);
        let specs = chunks_in_range(begin, end, self.size);

        let n = if specs.iter().all(|s| self.cache.contains(&s.index)) {
            trace!(first = specs[0].index, chunks = specs.len(), "chunk cache hit");
            let mut copied = 0;
            for spec in &specs {
                if let Some(chunk) = self.cache.get(&spec.index) {
                    copied += copy_overlap(spec, chunk, begin, end, &mut buf[copied..]);
                }
            }
            copied
        } else {
            let decoded = self.fetch(&specs).await?;
            let mut copied = 0;
            for (spec, chunk) in specs.iter().zip(&decoded) {
                copied += copy_overlap(spec, chunk, begin, end, &mut buf[copied..]);
            }
            for (spec, chunk) in specs.iter().zip(decoded) {
                self.cache.put(spec.index, chunk);
            }
            copied
        };

        self.pos += n as u64;
        Ok(n)
    }

    /// Read from the cursor to the end of the object, appending to `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, ReaderError> {
        let start = out.len();
        while self.pos < self.size {
            let want = (self.size - self.pos).min(READ_TO_END_STEP) as usize;
            let old = out.len();
            out.resize(old + want, 0);
            let n = self.read(&mut out[old..]).await?;
            out.truncate(old + n);
            if n == 0 {
                break;
            }
        }
        Ok(out.len() - start)
    }

    async fn fetch(&self, specs: &[ChunkSpec]) -> Result<Vec<Vec<u8>>, ReaderError> {
        let (Some(first), Some(last)) = (specs.first(), specs.last()) else {
            return Ok(Vec::new());
        };
        let (start, end) = (first.cipher_start, last.cipher_end);
        trace!(first = first.index, chunks = specs.len(), start, end, "fetching sealed range");

        let sealed = self
            .store
            .get_range(&self.dest, start, end)
            .await
            .map_err(ReaderError::Storage)?;
        let expected = end - start;
        if sealed.len() as u64 != expected {
            return Err(ReaderError::ShortRange {
                offset: start,
                expected,
                got: sealed.len() as u64,
            });
        }

        let decoded = open_chunk_range(&self.keys, &self.prefix, first.index, &sealed)?;
        for (spec, chunk) in specs.iter().zip(&decoded) {
            let want = spec.plaintext_end - spec.plaintext_start;
            if chunk.len() as u64 != want {
                return Err(ReaderError::ShortRange {
                    offset: spec.cipher_start,
                    expected: want,
                    got: chunk.len() as u64,
                });
            }
        }
        Ok(decoded)
    }
}

fn cache_capacity(chunks: usize) -> NonZeroUsize {
    NonZeroUsize::new(chunks).unwrap_or(NonZeroUsize::MIN)
}

/// Copy the part of `chunk` that falls inside plaintext `[begin, end)`.
fn copy_overlap(spec: &ChunkSpec, chunk: &[u8], begin: u64, end: u64, out: &mut [u8]) -> usize {
    let from = begin.max(spec.plaintext_start);
    let to = end.min(spec.plaintext_end);
    if from >= to {
        return 0;
    }
    let lo = (from - spec.plaintext_start) as usize;
    let hi = (to - spec.plaintext_start) as usize;
    let n = hi - lo;
    out[..n].copy_from_slice(&chunk[lo..hi]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use attache_crypto::{seal_whole, EncryptionContext, CHUNK_LEN};
    use attache_storage::MemoryStore;
    use bytes::Bytes;

    fn make_data(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    async fn stored(data: &[u8]) -> (Arc<MemoryStore>, RandomAccessReader) {
        let ctx = EncryptionContext::generate();
        let prefix = SignaturePrefix::new("attache-test").unwrap();
        let sealed = seal_whole(data, &ctx, &prefix).unwrap();

        let store = Arc::new(MemoryStore::new());
        let dest = Destination::new("attachments", "obj");
        store.put_object(&dest, Bytes::from(sealed)).await.unwrap();
        let reader = RandomAccessReader::new(
            store.clone(),
            dest,
            ctx.decryption_keys(),
            prefix,
            data.len() as u64,
        );
        (store, reader)
    }

    #[tokio::test]
    async fn seek_is_pure_arithmetic() {
        let (store, mut reader) = stored(b"0123456789").await;
        assert_eq!(reader.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(reader.seek(SeekFrom::Current(-2)).unwrap(), 2);
        assert_eq!(reader.seek(SeekFrom::End(-1)).unwrap(), 9);
        assert_eq!(reader.seek(SeekFrom::End(5)).unwrap(), 15);
        let err = reader.seek(SeekFrom::Current(-100)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(reader.position(), 15);
        assert_eq!(store.get_range_calls(), 0);
    }

    #[tokio::test]
    async fn read_past_end_is_eof() {
        let (_, mut reader) = stored(b"0123456789").await;
        reader.seek(SeekFrom::Start(8)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_object_reads_nothing() {
        let (store, mut reader) = stored(b"").await;
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).await.unwrap(), 0);
        assert_eq!(store.get_range_calls(), 0);
    }

    #[tokio::test]
    async fn full_hit_skips_the_store() {
        let data = make_data(2 * CHUNK_LEN + 100);
        let (store, mut reader) = stored(&data).await;

        let mut buf = vec![0u8; 10];
        reader.seek(SeekFrom::Start(CHUNK_LEN as u64 - 5)).unwrap();
        reader.read(&mut buf).await.unwrap();
        assert_eq!(store.get_range_calls(), 1);
        assert_eq!(buf, &data[CHUNK_LEN - 5..CHUNK_LEN + 5]);

        reader.seek(SeekFrom::Start(3)).unwrap();
        reader.read(&mut buf).await.unwrap();
        assert_eq!(store.get_range_calls(), 1, "chunk 0 was cached");
        assert_eq!(buf, &data[3..13]);
    }

    #[tokio::test]
    async fn partial_hit_refetches_whole_range() {
        let data = make_data(3 * CHUNK_LEN);
        let (store, mut reader) = stored(&data).await;

        let mut buf = vec![0u8; 4];
        reader.read(&mut buf).await.unwrap();
        assert_eq!(store.get_range_calls(), 1);

        let mut wide = vec![0u8; 2 * CHUNK_LEN];
        reader.seek(SeekFrom::Start(10)).unwrap();
        let n = reader.read(&mut wide).await.unwrap();
        assert_eq!(n, 2 * CHUNK_LEN);
        assert_eq!(store.get_range_calls(), 2);
        assert_eq!(wide, &data[10..10 + 2 * CHUNK_LEN]);
    }

    #[tokio::test]
    async fn tiny_cache_still_reads_wide_ranges() {
        let data = make_data(3 * CHUNK_LEN + 7);
        let (_, reader) = stored(&data).await;
        let mut reader = reader.with_cache_capacity(1);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn tampered_object_fails_to_read() {
        let data = make_data(CHUNK_LEN + 10);
        let (store, mut reader) = stored(&data).await;
        let dest = Destination::new("attachments", "obj");
        let mut sealed = store.object(&dest).unwrap().to_vec();
        sealed[CHUNK_LEN + 200] ^= 0x01;
        store.insert_object(&dest, Bytes::from(sealed));

        let mut buf = vec![0u8; 16];
        assert!(reader.read(&mut buf).await.is_ok(), "chunk 0 is intact");
        reader.seek(SeekFrom::Start(CHUNK_LEN as u64)).unwrap();
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ReaderError::Codec(_)));
    }

    #[tokio::test]
    async fn truncated_object_is_short_range() {
        let data = make_data(CHUNK_LEN + 10);
        let (store, mut reader) = stored(&data).await;
        let dest = Destination::new("attachments", "obj");
        let sealed = store.object(&dest).unwrap();
        store.insert_object(&dest, sealed.slice(..sealed.len() - 20));

        reader.seek(SeekFrom::Start(CHUNK_LEN as u64)).unwrap();
        let mut buf = vec![0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ReaderError::ShortRange { .. }));
    }
}
