//! Delta arrival notification.
//!
//! A [`DeltaFileNotifier`] sends the object names of delta files it believes
//! are new. Delivery is at-least-once and may repeat or reorder names; the
//! loader's watermark makes that harmless.

use std::sync::Arc;
use std::time::Duration;

use kvload_core::FileDescriptor;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{BlobError, BlobStorageClient, ListOptions};

/// Capped exponential backoff for retrying transports.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self { initial, max: max.max(initial), next: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = (self.next * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) { self.next = self.initial; }
}

/// Signals that objects in a bucket changed.
#[async_trait::async_trait]
pub trait BlobStorageChangeNotifier: Send + Sync {
    /// Wait up to `max_wait` for change events. An empty result means the
    /// wait timed out.
    async fn wait_for_changes(&self, max_wait: Duration) -> Result<Vec<String>, BlobError>;
}

/// Change notifier fed through an mpsc channel (e.g. by a queue consumer).
pub struct ChannelChangeNotifier {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelChangeNotifier {
    pub fn channel(cap: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait::async_trait]
impl BlobStorageChangeNotifier for ChannelChangeNotifier {
    async fn wait_for_changes(&self, max_wait: Duration) -> Result<Vec<String>, BlobError> {
        let mut rx = self.rx.lock().await;
        let first = match tokio::time::timeout(max_wait, rx.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => return Err(BlobError::Unavailable("change notification channel closed".into())),
            Ok(Some(name)) => name,
        };
        let mut out = vec![first];
        while let Ok(name) = rx.try_recv() {
            out.push(name);
        }
        Ok(out)
    }
}

/// Source of new delta file names.
#[async_trait::async_trait]
pub trait DeltaFileNotifier: Send + Sync {
    /// Send names of delta objects after `start_after` into `tx` until `ct`
    /// is cancelled or `tx` is closed.
    async fn run(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        start_after: String,
        tx: mpsc::Sender<String>,
        ct: CancellationToken,
    ) -> Result<(), BlobError>;
}

/// Lists the bucket whenever the change notifier fires (or the poll interval
/// elapses) and forwards unseen delta names in logical-time order.
pub struct BucketDeltaFileNotifier {
    client: Arc<dyn BlobStorageClient>,
    changes: Option<Arc<dyn BlobStorageChangeNotifier>>,
    poll_interval: Duration,
    backoff: Backoff,
}

impl BucketDeltaFileNotifier {
    pub fn new(client: Arc<dyn BlobStorageClient>, poll_interval: Duration, backoff_max: Duration) -> Self {
        Self {
            client,
            changes: None,
            poll_interval,
            backoff: Backoff::new(Duration::from_millis(100), backoff_max),
        }
    }

    pub fn with_change_notifier(mut self, changes: Arc<dyn BlobStorageChangeNotifier>) -> Self {
        self.changes = Some(changes);
        self
    }

    async fn wait_for_change(&self) {
        match &self.changes {
            Some(changes) => match changes.wait_for_changes(self.poll_interval).await {
                Ok(names) if !names.is_empty() => debug!(count = names.len(), "deltas: bucket change notified"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "deltas: change notifier failed; falling back to polling");
                    tokio::time::sleep(self.poll_interval).await;
                }
            },
            None => tokio::time::sleep(self.poll_interval).await,
        }
    }
}

#[async_trait::async_trait]
impl DeltaFileNotifier for BucketDeltaFileNotifier {
    async fn run(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        start_after: String,
        tx: mpsc::Sender<String>,
        ct: CancellationToken,
    ) -> Result<(), BlobError> {
        let mut last = start_after;
        let mut backoff = self.backoff.clone();
        info!(bucket, start_after = %last, "deltas: notifier started");
        loop {
            let opts = ListOptions { prefix: prefix.map(str::to_string), start_after: Some(last.clone()) };
            let listed = tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                r = self.client.list(bucket, &opts) => r,
            };
            match listed {
                Ok(names) => {
                    backoff.reset();
                    let mut deltas: Vec<(u64, String)> = names
                        .into_iter()
                        .filter_map(|n| match FileDescriptor::parse_object_name(&n) {
                            Ok(fd) if fd.is_delta() => Some((fd.logical_timestamp(), n)),
                            _ => None,
                        })
                        .collect();
                    deltas.sort();
                    for (_, name) in deltas {
                        if tx.send(name.clone()).await.is_err() {
                            return Ok(());
                        }
                        last = name;
                    }
                    tokio::select! {
                        _ = ct.cancelled() => return Ok(()),
                        _ = self.wait_for_change() => {}
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    counter!("blob_list_failures_total", 1u64);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "deltas: listing failed; retrying");
                    tokio::select! {
                        _ = ct.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Forwards whatever names are pushed into it; for tests and for wiring an
/// external queue consumer directly.
pub struct ChannelDeltaFileNotifier {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelDeltaFileNotifier {
    pub fn channel(cap: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait::async_trait]
impl DeltaFileNotifier for ChannelDeltaFileNotifier {
    async fn run(
        &self,
        _bucket: &str,
        _prefix: Option<&str>,
        _start_after: String,
        tx: mpsc::Sender<String>,
        ct: CancellationToken,
    ) -> Result<(), BlobError> {
        let mut rx = self.rx.lock().await;
        loop {
            let next = tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                n = rx.recv() => n,
            };
            let Some(name) = next else { return Ok(()) };
            if tx.send(name).await.is_err() {
                return Ok(());
            }
        }
    }
}
