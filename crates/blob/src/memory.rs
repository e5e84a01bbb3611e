//! In-memory buckets for tests and local runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use crate::{BlobError, BlobStorageClient, ListOptions};

#[derive(Default)]
pub struct MemoryBlobStorageClient {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Bytes>>>,
    reads: Mutex<Vec<String>>,
    failing_lists: AtomicUsize,
}

impl MemoryBlobStorageClient {
    pub fn new() -> Self { Self::default() }

    pub fn create_bucket(&self, bucket: &str) {
        self.buckets.lock().unwrap().entry(bucket.to_string()).or_default();
    }

    pub fn put(&self, bucket: &str, name: &str, data: impl Into<Bytes>) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(name.to_string(), data.into());
    }

    /// Object names read so far, in call order.
    pub fn reads(&self) -> Vec<String> { self.reads.lock().unwrap().clone() }

    /// Make the next `n` list calls fail with `Unavailable`.
    pub fn fail_next_lists(&self, n: usize) { self.failing_lists.store(n, Ordering::SeqCst); }
}

#[async_trait::async_trait]
impl BlobStorageClient for MemoryBlobStorageClient {
    async fn list(&self, bucket: &str, opts: &ListOptions) -> Result<Vec<String>, BlobError> {
        let fail = self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BlobError::Unavailable("injected list failure".into()));
        }
        let buckets = self.buckets.lock().unwrap();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| BlobError::BucketNotFound { bucket: bucket.to_string() })?;
        Ok(objects.keys().filter(|n| opts.matches(n)).cloned().collect())
    }

    async fn read(&self, bucket: &str, name: &str) -> Result<Bytes, BlobError> {
        self.reads.lock().unwrap().push(name.to_string());
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(name))
            .cloned()
            .ok_or_else(|| BlobError::ObjectNotFound { bucket: bucket.to_string(), name: name.to_string() })
    }
}
