//! In-process [`ObjectStore`] fake for tests.
//!
//! Behaves like an S3 multipart endpoint (parts keyed by number, re-upload
//! replaces, upload reused per destination) and adds knobs the pipeline tests
//! need: a part-failure budget, artificial latency, call counters and the
//! peak number of concurrent `put_part` calls.

use anyhow::Result;
use async_trait::async_trait;
use attache_core::{Destination, Part};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::store::{etag_of, upload_id_for, MultipartHandle, ObjectStore};

#[derive(Default)]
struct Inner {
    objects: HashMap<Destination, Bytes>,
    uploads: HashMap<String, BTreeMap<u32, (Part, Bytes)>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// `put_part` calls allowed to succeed before every later one fails
    part_budget: Mutex<Option<u64>>,
    part_latency: Mutex<Option<Duration>>,
    put_part_calls: AtomicU64,
    put_object_calls: AtomicU64,
    get_range_calls: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the next `n` `put_part` calls succeed and fail every one after.
    pub fn fail_part_after(&self, n: u64) {
        *lock(&self.part_budget) = Some(n);
    }

    pub fn clear_faults(&self) {
        *lock(&self.part_budget) = None;
    }

    /// Sleep this long inside every `put_part`.
    pub fn set_part_latency(&self, latency: Duration) {
        *lock(&self.part_latency) = Some(latency);
    }

    pub fn put_part_calls(&self) -> u64 {
        self.put_part_calls.load(Ordering::SeqCst)
    }

    pub fn put_object_calls(&self) -> u64 {
        self.put_object_calls.load(Ordering::SeqCst)
    }

    pub fn get_range_calls(&self) -> u64 {
        self.get_range_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Whole stored object, for assertions.
    pub fn object(&self, dest: &Destination) -> Option<Bytes> {
        lock(&self.inner).objects.get(dest).cloned()
    }

    /// Overwrite a stored object, e.g. to simulate server-side corruption.
    pub fn insert_object(&self, dest: &Destination, body: Bytes) {
        lock(&self.inner).objects.insert(dest.clone(), body);
    }

    /// Number of multipart uploads still open.
    pub fn open_uploads(&self) -> usize {
        lock(&self.inner).uploads.len()
    }

    fn take_budget(&self) -> bool {
        let mut budget = lock(&self.part_budget);
        match budget.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, dest: &Destination, body: Bytes) -> Result<String> {
        self.put_object_calls.fetch_add(1, Ordering::SeqCst);
        let etag = etag_of(&body);
        lock(&self.inner).objects.insert(dest.clone(), body);
        Ok(etag)
    }

    async fn initiate_multipart(&self, dest: &Destination) -> Result<MultipartHandle> {
        let upload_id = upload_id_for(dest);
        lock(&self.inner).uploads.entry(upload_id.clone()).or_default();
        Ok(MultipartHandle {
            dest: dest.clone(),
            upload_id,
        })
    }

    async fn list_parts(&self, handle: &MultipartHandle) -> Result<Vec<Part>> {
        let inner = lock(&self.inner);
        let parts = inner
            .uploads
            .get(&handle.upload_id)
            .ok_or_else(|| anyhow::anyhow!("no such upload: {}", handle.upload_id))?;
        Ok(parts.values().map(|(part, _)| part.clone()).collect())
    }

    async fn put_part(&self, handle: &MultipartHandle, number: u32, body: Bytes) -> Result<Part> {
        self.put_part_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let allowed = self.take_budget();
        let latency = *lock(&self.part_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        anyhow::ensure!(allowed, "injected failure uploading part {number}");
        anyhow::ensure!(number >= 1, "part numbers start at 1");

        let part = Part {
            number,
            etag: etag_of(&body),
            size: body.len() as u64,
        };
        let mut inner = lock(&self.inner);
        let parts = inner
            .uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| anyhow::anyhow!("no such upload: {}", handle.upload_id))?;
        parts.insert(number, (part.clone(), body));
        Ok(part)
    }

    async fn complete_multipart(&self, handle: &MultipartHandle, mut parts: Vec<Part>) -> Result<()> {
        parts.sort_by_key(|p| p.number);
        let mut inner = lock(&self.inner);
        let staged = inner
            .uploads
            .get(&handle.upload_id)
            .ok_or_else(|| anyhow::anyhow!("no such upload: {}", handle.upload_id))?;

        let mut body = Vec::new();
        for part in &parts {
            match staged.get(&part.number) {
                Some((have, data)) if have == part => body.extend_from_slice(data),
                _ => anyhow::bail!("part {} does not match an uploaded part", part.number),
            }
        }
        inner.uploads.remove(&handle.upload_id);
        inner.objects.insert(handle.dest.clone(), Bytes::from(body));
        Ok(())
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        lock(&self.inner).uploads.remove(&handle.upload_id);
        Ok(())
    }

    async fn get_range(&self, dest: &Destination, start: u64, end: u64) -> Result<Bytes> {
        self.get_range_calls.fetch_add(1, Ordering::SeqCst);
        let inner = lock(&self.inner);
        let object = inner
            .objects
            .get(dest)
            .ok_or_else(|| anyhow::anyhow!("object not found: {dest}"))?;
        let len = object.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        Ok(object.slice(start..end.max(start)))
    }

    async fn stat(&self, dest: &Destination) -> Result<Option<u64>> {
        Ok(lock(&self.inner)
            .objects
            .get(dest)
            .map(|o| o.len() as u64))
    }

    async fn delete(&self, dest: &Destination) -> Result<()> {
        lock(&self.inner).objects.remove(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dest() -> Destination {
        Destination::new("attachments", "a/b")
    }

    #[tokio::test]
    async fn multipart_roundtrip() {
        let store = MemoryStore::new();
        let handle = store.initiate_multipart(&dest()).await.unwrap();
        let b = store.put_part(&handle, 2, Bytes::from_static(b"world")).await.unwrap();
        let a = store.put_part(&handle, 1, Bytes::from_static(b"hello ")).await.unwrap();
        assert_eq!(store.list_parts(&handle).await.unwrap(), vec![a.clone(), b.clone()]);

        store.complete_multipart(&handle, vec![b, a]).await.unwrap();
        assert_eq!(&store.object(&dest()).unwrap()[..], b"hello world");
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn part_budget_fails_later_calls() {
        let store = MemoryStore::new();
        let handle = store.initiate_multipart(&dest()).await.unwrap();
        store.fail_part_after(1);
        assert!(store.put_part(&handle, 1, Bytes::from_static(b"a")).await.is_ok());
        assert!(store.put_part(&handle, 2, Bytes::from_static(b"b")).await.is_err());
        assert_eq!(store.put_part_calls(), 2);
        assert_eq!(store.list_parts(&handle).await.unwrap().len(), 1);

        store.clear_faults();
        assert!(store.put_part(&handle, 2, Bytes::from_static(b"b")).await.is_ok());
    }

    #[tokio::test]
    async fn tracks_peak_concurrency() {
        let store = Arc::new(MemoryStore::new());
        store.set_part_latency(Duration::from_millis(20));
        let handle = store.initiate_multipart(&dest()).await.unwrap();

        let mut tasks = Vec::new();
        for n in 1..=4u32 {
            let store = store.clone();
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                store.put_part(&handle, n, Bytes::from(vec![n as u8])).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(store.peak_in_flight() >= 2);
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_range_clamps_to_object() {
        let store = MemoryStore::new();
        store.put_object(&dest(), Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(&store.get_range(&dest(), 8, 20).await.unwrap()[..], b"89");
        assert_eq!(store.get_range_calls(), 1);
    }
}
