//! Realtime update channel: low-latency record payloads that bypass the bucket.

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::BlobError;

/// One message from a realtime channel. `payload` holds rows in the same
/// structured format as delta files; it may carry several records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeMessage {
    pub payload: Bytes,
}

impl RealtimeMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self { Self { payload: payload.into() } }
}

#[async_trait::async_trait]
pub trait RealtimeNotifier: Send + Sync {
    /// Deliver messages into `tx` until `ct` is cancelled or `tx` is closed.
    async fn run(&self, tx: mpsc::Sender<RealtimeMessage>, ct: CancellationToken) -> Result<(), BlobError>;
}

/// Publishing half of a [`ChannelRealtimeNotifier`].
#[derive(Clone)]
pub struct RealtimePublisher {
    tx: mpsc::Sender<RealtimeMessage>,
}

impl RealtimePublisher {
    pub async fn publish(&self, msg: RealtimeMessage) -> Result<(), BlobError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| BlobError::Unavailable("realtime channel closed".into()))
    }
}

/// In-process realtime channel.
pub struct ChannelRealtimeNotifier {
    rx: Mutex<mpsc::Receiver<RealtimeMessage>>,
}

impl ChannelRealtimeNotifier {
    pub fn channel(cap: usize) -> (RealtimePublisher, Self) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (RealtimePublisher { tx }, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait::async_trait]
impl RealtimeNotifier for ChannelRealtimeNotifier {
    async fn run(&self, tx: mpsc::Sender<RealtimeMessage>, ct: CancellationToken) -> Result<(), BlobError> {
        let mut rx = self.rx.lock().await;
        loop {
            let next = tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                m = rx.recv() => m,
            };
            let Some(msg) = next else { return Ok(()) };
            if tx.send(msg).await.is_err() {
                return Ok(());
            }
        }
    }
}
