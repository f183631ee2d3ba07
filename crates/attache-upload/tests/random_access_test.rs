//! Seek-and-read over objects produced by the upload pipeline.

use attache_core::Destination;
use attache_crypto::{SignaturePrefix, CHUNK_LEN};
use attache_storage::{MemoryStore, ObjectStore, OpendalStore};
use attache_upload::{
    BytesSource, MemoryStash, ObjectDescriptor, RandomAccessReader, UploadLimiter, UploadTask,
    Uploader, UploaderConfig,
};
use opendal::Operator;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> UploaderConfig {
    UploaderConfig {
        part_size: 512 * 1024,
        multipart_threshold: 512 * 1024,
        progress_interval: Duration::ZERO,
        prefix: SignaturePrefix::new("attache-test-attachment").unwrap(),
    }
}

fn make_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8 ^ (i >> 12) as u8).collect()
}

/// Tiny LCG so offsets are reproducible without pulling in an RNG.
struct Lcg(u64);

impl Lcg {
    fn step(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

async fn upload(store: Arc<dyn ObjectStore>, data: &[u8], key: &str) -> ObjectDescriptor {
    let uploader = Uploader::new(
        store,
        Arc::new(MemoryStash::new()),
        Arc::new(UploadLimiter::new(4)),
        config(),
    );
    let mut task = UploadTask::new(
        BytesSource::new(data.to_vec()),
        data.len() as u64,
        Destination::new("attachments", key),
    );
    uploader
        .upload_asset(&mut task, &CancellationToken::new())
        .await
        .expect("upload")
        .descriptor
}

async fn check_random_reads(reader: &mut RandomAccessReader, data: &[u8], rounds: usize) {
    let mut rng = Lcg(0x5eed);
    let size = data.len() as u64;
    for _ in 0..rounds {
        let offset = rng.step() % size;
        let len = 1 + (rng.step() % (2 * CHUNK_LEN as u64)) as usize;
        reader.seek(SeekFrom::Start(offset)).unwrap();

        let mut buf = vec![0u8; len];
        let n = reader.read(&mut buf).await.unwrap();
        let expect_end = (offset as usize + len).min(data.len());
        assert_eq!(n, expect_end - offset as usize, "offset {offset} len {len}");
        assert_eq!(&buf[..n], &data[offset as usize..expect_end], "offset {offset} len {len}");
        assert_eq!(reader.position(), offset + n as u64);
    }
}

#[tokio::test]
async fn random_reads_match_plaintext() {
    let store = Arc::new(MemoryStore::new());
    let data = make_data(3 * CHUNK_LEN + 12_345);
    let descriptor = upload(store.clone(), &data, "conv/random.bin").await;

    let mut reader = RandomAccessReader::from_descriptor(store, &descriptor);
    assert_eq!(reader.len(), data.len() as u64);
    check_random_reads(&mut reader, &data, 64).await;
}

#[tokio::test]
async fn playback_reads_fetch_each_chunk_once() {
    let store = Arc::new(MemoryStore::new());
    let data = make_data(2 * CHUNK_LEN + 777);
    let descriptor = upload(store.clone(), &data, "conv/playback.mp4").await;

    let before = store.get_range_calls();
    let mut reader = RandomAccessReader::from_descriptor(store.clone(), &descriptor);
    let mut out = Vec::with_capacity(data.len());
    let mut buf = vec![0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, data);
    // 4096 divides the chunk length, so each chunk is fetched exactly once.
    assert_eq!(store.get_range_calls() - before, 3);
}

#[tokio::test]
async fn seek_from_end_reads_tail() {
    let store = Arc::new(MemoryStore::new());
    let data = make_data(CHUNK_LEN + 100);
    let descriptor = upload(store.clone(), &data, "conv/tail.bin").await;

    let mut reader = RandomAccessReader::from_descriptor(store, &descriptor);
    reader.seek(SeekFrom::End(-150)).unwrap();
    let mut buf = vec![0u8; 1024];
    let n = reader.read(&mut buf).await.unwrap();
    assert_eq!(n, 150);
    assert_eq!(&buf[..n], &data[data.len() - 150..]);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn random_reads_over_fs_backend() {
    let tmp = tempfile::tempdir().unwrap();
    let op = Operator::new(opendal::services::Fs::default().root(tmp.path().to_str().unwrap()))
        .unwrap()
        .finish();
    let store: Arc<dyn ObjectStore> = Arc::new(OpendalStore::new("attachments", op));

    let data = make_data(2 * CHUNK_LEN + 4321);
    let descriptor = upload(store.clone(), &data, "conv/fs.bin").await;

    let mut reader = RandomAccessReader::from_descriptor(store, &descriptor).with_cache_capacity(2);
    check_random_reads(&mut reader, &data, 24).await;
}
