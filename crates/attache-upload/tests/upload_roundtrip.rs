//! Integration test: upload → download round-trip through the pipeline
//!
//! Uses the in-memory fake store (and OpenDAL's memory/fs backends) so no
//! live object store is required.

use attache_core::Destination;
use attache_crypto::{open_whole, sealed_size, SignaturePrefix};
use attache_storage::{MemoryStore, ObjectStore, OpendalStore};
use attache_upload::{
    AttachmentStash, BytesSource, FileSource, FileStash, MemoryStash, ProgressFn,
    RandomAccessReader, UploadLimiter, UploadTask, Uploader, UploaderConfig,
};
use opendal::Operator;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PART_SIZE: usize = 256 * 1024;

fn config() -> UploaderConfig {
    UploaderConfig {
        part_size: PART_SIZE,
        multipart_threshold: PART_SIZE as u64,
        progress_interval: Duration::ZERO,
        prefix: SignaturePrefix::new("attache-test-attachment").unwrap(),
    }
}

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 7)) as u8)
        .collect()
}

fn expected_parts(size: usize) -> usize {
    (sealed_size(size as u64) as usize).div_ceil(PART_SIZE)
}

fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

#[tokio::test]
async fn multipart_upload_roundtrip() {
    let store = Arc::new(MemoryStore::new());
    let stash = Arc::new(MemoryStash::new());
    let uploader = Uploader::new(
        store.clone(),
        stash.clone(),
        Arc::new(UploadLimiter::new(4)),
        config(),
    );

    let data = make_data(1_500_000);
    let dest = Destination::new("attachments", "conv-1/video.mp4");
    let mut task = UploadTask::new(BytesSource::new(data.clone()), data.len() as u64, dest.clone());
    let outcome = uploader
        .upload_asset(&mut task, &CancellationToken::new())
        .await
        .expect("upload should succeed");

    assert!(!outcome.resumed);
    assert_eq!(outcome.parts_uploaded, expected_parts(data.len()));
    assert_eq!(outcome.parts_reused, 0);
    assert_eq!(store.put_object_calls(), 0);
    assert!(stash.list().await.unwrap().is_empty(), "stash cleared on completion");

    let d = &outcome.descriptor;
    assert_eq!(d.plaintext_size, data.len() as u64);
    assert_eq!(d.sealed_size, sealed_size(data.len() as u64));

    let sealed = store.object(&dest).expect("object stored");
    assert_eq!(sealed.len() as u64, d.sealed_size);
    assert_eq!(open_whole(&sealed, &d.keys, &d.signature_prefix).unwrap(), data);

    let mut reader = RandomAccessReader::from_descriptor(store.clone(), d);
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, data);
}

#[tokio::test]
async fn chunk_aligned_plaintext_roundtrip() {
    let store = Arc::new(MemoryStore::new());
    let uploader = Uploader::new(
        store.clone(),
        Arc::new(MemoryStash::new()),
        Arc::new(UploadLimiter::new(3)),
        config(),
    );

    let data = make_data(2 * attache_crypto::CHUNK_LEN);
    let dest = Destination::new("attachments", "aligned");
    let mut task = UploadTask::new(BytesSource::new(data.clone()), data.len() as u64, dest.clone());
    let outcome = uploader
        .upload_asset(&mut task, &CancellationToken::new())
        .await
        .unwrap();

    let sealed = store.object(&dest).unwrap();
    let d = &outcome.descriptor;
    assert_eq!(open_whole(&sealed, &d.keys, &d.signature_prefix).unwrap(), data);
}

#[tokio::test]
async fn opendal_store_roundtrip() {
    let store: Arc<dyn ObjectStore> = Arc::new(OpendalStore::new("attachments", memory_operator()));
    let uploader = Uploader::new(
        store.clone(),
        Arc::new(MemoryStash::new()),
        Arc::new(UploadLimiter::new(4)),
        config(),
    );

    let data = make_data(700_000);
    let dest = Destination::new("attachments", "conv-2/scan.pdf");
    let mut task = UploadTask::new(BytesSource::new(data.clone()), data.len() as u64, dest.clone());
    let outcome = uploader
        .upload_asset(&mut task, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.stat(&dest).await.unwrap(), Some(outcome.descriptor.sealed_size));
    let mut reader = RandomAccessReader::from_descriptor(store, &outcome.descriptor);
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, data);
}

#[tokio::test]
async fn file_source_and_file_stash() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("photo.jpg");
    let data = make_data(600_000);
    std::fs::write(&input, &data).unwrap();

    let store = Arc::new(MemoryStore::new());
    let stash_path = tmp.path().join("stash.json");
    let stash = Arc::new(FileStash::open(&stash_path).unwrap());
    let uploader = Uploader::new(
        store.clone(),
        stash,
        Arc::new(UploadLimiter::new(2)),
        config(),
    );

    let source = FileSource::open(&input).await.unwrap();
    let size = source.len();
    let dest = Destination::new("attachments", "conv-3/photo.jpg");
    let mut task = UploadTask::new(source, size, dest.clone());
    let outcome = uploader
        .upload_asset(&mut task, &CancellationToken::new())
        .await
        .unwrap();

    let reopened = FileStash::open(&stash_path).unwrap();
    assert!(reopened.list().await.unwrap().is_empty());

    let sealed = store.object(&dest).unwrap();
    let d = &outcome.descriptor;
    assert_eq!(open_whole(&sealed, &d.keys, &d.signature_prefix).unwrap(), data);
}

#[tokio::test]
async fn progress_starts_at_zero_and_ends_at_total() {
    let store = Arc::new(MemoryStore::new());
    let uploader = Uploader::new(
        store,
        Arc::new(MemoryStash::new()),
        Arc::new(UploadLimiter::new(2)),
        config(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink: ProgressFn = {
        let seen = seen.clone();
        Arc::new(move |done, total| seen.lock().unwrap().push((done, total)))
    };

    let data = make_data(900_000);
    let mut task = UploadTask::new(
        BytesSource::new(data.clone()),
        data.len() as u64,
        Destination::new("attachments", "progress"),
    )
    .with_progress(sink);
    uploader
        .upload_asset(&mut task, &CancellationToken::new())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    let total = sealed_size(data.len() as u64);
    assert_eq!(seen.first(), Some(&(0, total)));
    assert_eq!(seen.last(), Some(&(total, total)));
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0), "{seen:?}");
}

#[tokio::test]
async fn small_object_progress_has_both_endpoints() {
    let store = Arc::new(MemoryStore::new());
    let uploader = Uploader::new(
        store.clone(),
        Arc::new(MemoryStash::new()),
        Arc::new(UploadLimiter::new(2)),
        config(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink: ProgressFn = {
        let seen = seen.clone();
        Arc::new(move |done, _| seen.lock().unwrap().push(done))
    };
    let mut task = UploadTask::new(
        BytesSource::new(vec![9u8; 100]),
        100,
        Destination::new("attachments", "tiny"),
    )
    .with_progress(sink);
    let outcome = uploader
        .upload_asset(&mut task, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.descriptor.sealed_size, 180);
    assert_eq!(*seen.lock().unwrap(), vec![0, 180]);
    assert_eq!(store.put_object_calls(), 1);
}

#[tokio::test]
async fn shared_limiter_bounds_all_uploads() {
    let store = Arc::new(MemoryStore::new());
    store.set_part_latency(Duration::from_millis(15));
    let limiter = Arc::new(UploadLimiter::new(2));

    let a = Uploader::new(store.clone(), Arc::new(MemoryStash::new()), limiter.clone(), config());
    let b = Uploader::new(store.clone(), Arc::new(MemoryStash::new()), limiter.clone(), config());

    let data_a = make_data(1_200_000);
    let data_b = make_data(1_100_000);
    let mut task_a = UploadTask::new(
        BytesSource::new(data_a.clone()),
        data_a.len() as u64,
        Destination::new("attachments", "a"),
    );
    let mut task_b = UploadTask::new(
        BytesSource::new(data_b.clone()),
        data_b.len() as u64,
        Destination::new("attachments", "b"),
    );

    let cancel = CancellationToken::new();
    let (ra, rb) = tokio::join!(
        a.upload_asset(&mut task_a, &cancel),
        b.upload_asset(&mut task_b, &cancel)
    );
    ra.unwrap();
    rb.unwrap();

    assert!(store.peak_in_flight() <= 2, "peak {}", store.peak_in_flight());
    assert!(store.peak_in_flight() >= 1);
    assert_eq!(limiter.available(), 2, "all permits returned");
}

#[tokio::test]
async fn every_attempt_gets_fresh_keys() {
    let store = Arc::new(MemoryStore::new());
    let keys = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let keys = keys.clone();
        Arc::new(move |ctx: &attache_crypto::EncryptionContext| {
            keys.lock().unwrap().push(*ctx.enc_key().as_bytes())
        })
    };
    let uploader = Uploader::new(
        store,
        Arc::new(MemoryStash::new()),
        Arc::new(UploadLimiter::new(2)),
        config(),
    )
    .with_key_observer(observer);

    let data = make_data(400_000);
    for key in ["one", "two"] {
        let mut task = UploadTask::new(
            BytesSource::new(data.clone()),
            data.len() as u64,
            Destination::new("attachments", key),
        );
        uploader
            .upload_asset(&mut task, &CancellationToken::new())
            .await
            .unwrap();
    }

    let keys = keys.lock().unwrap();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
}
