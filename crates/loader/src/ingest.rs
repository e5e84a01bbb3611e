//! Continuous ingestion: delta files announced by the notifier and realtime
//! messages, one consumer task per source.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use kvload_blob::{Backoff, BlobError, BlobStorageClient, RealtimeMessage};
use kvload_core::{FileDescriptor, LoadError};
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apply::{Applier, OnRecordError, Source};
use crate::OrchestratorState;

enum Fetched {
    Blob(Bytes),
    Missing,
    Cancelled,
}

pub(crate) struct Shared {
    pub(crate) applier: Applier,
    pub(crate) client: Arc<dyn BlobStorageClient>,
    pub(crate) bucket: String,
    pub(crate) backoff_max: Duration,
    pub(crate) state: watch::Sender<OrchestratorState>,
}

impl Shared {
    pub(crate) fn watermark(&self) -> u64 { self.state.borrow().watermark }

    /// Move the watermark forward; never backwards.
    pub(crate) fn advance_watermark(&self, ts: u64) -> bool {
        let moved = self.state.send_if_modified(|s| {
            if ts > s.watermark {
                s.watermark = ts;
                true
            } else {
                false
            }
        });
        if moved {
            gauge!("loader_watermark", ts as f64);
        }
        moved
    }

    /// Read with retries until it succeeds, the object is gone, or `ct` fires.
    async fn read_with_retry(&self, name: &str, ct: &CancellationToken) -> Fetched {
        let mut backoff = Backoff::new(Duration::from_millis(100), self.backoff_max);
        loop {
            let res = tokio::select! {
                _ = ct.cancelled() => return Fetched::Cancelled,
                r = self.client.read(&self.bucket, name) => r,
            };
            match res {
                Ok(blob) => return Fetched::Blob(blob),
                Err(e @ BlobError::ObjectNotFound { .. }) => {
                    warn!(name, error = %e, "deltas: announced file is gone; ignored");
                    return Fetched::Missing;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    counter!("loader_read_failures_total", 1u64);
                    warn!(name, error = %e, delay_ms = delay.as_millis() as u64, "deltas: read failed; retrying");
                    tokio::select! {
                        _ = ct.cancelled() => return Fetched::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Consume delta names until cancelled or the notifier goes away.
pub(crate) async fn delta_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<String>, ct: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = ct.cancelled() => break,
            n = rx.recv() => n,
        };
        let Some(name) = next else {
            debug!("deltas: notifier channel closed");
            break;
        };
        let fd = match FileDescriptor::parse_object_name(&name) {
            Ok(fd) if fd.is_delta() => fd,
            Ok(_) => {
                debug!(name = %name, "deltas: not a delta file; ignored");
                continue;
            }
            Err(e) => {
                warn!(name = %name, error = %e, "deltas: bad notification; ignored");
                continue;
            }
        };
        let watermark = shared.watermark();
        if !fd.is_newer_than(watermark) {
            counter!("loader_stale_notifications_total", 1u64);
            debug!(name = %name, watermark, "deltas: already covered");
            continue;
        }

        let t0 = Instant::now();
        let blob = match shared.read_with_retry(&name, &ct).await {
            Fetched::Blob(blob) => blob,
            Fetched::Missing => continue,
            Fetched::Cancelled => break,
        };
        let stats = match shared.applier.apply_blob(Source::Delta, &name, blob, OnRecordError::Skip, &ct).await {
            Ok(stats) => stats,
            Err(LoadError::ShutdownInProgress) => {
                info!(name = %name, "deltas: stopped mid-file");
                break;
            }
            Err(e) => {
                warn!(name = %name, error = %e, "deltas: file failed");
                continue;
            }
        };
        if let Some(ts) = stats.max_commit_time {
            shared.applier.cache().remove_deleted_keys(ts);
        }
        shared.advance_watermark(fd.logical_timestamp());
        counter!("loader_files_loaded_total", 1u64, "source" => Source::Delta.as_str());
        histogram!("loader_file_load_ms", t0.elapsed().as_millis() as f64, "source" => Source::Delta.as_str());
        info!(
            name = %name,
            applied = stats.applied,
            stale = stats.stale,
            errors = stats.errors,
            watermark = fd.logical_timestamp(),
            took_ms = %t0.elapsed().as_millis(),
            "deltas: file loaded"
        );
    }
    info!("deltas: ingest loop stopped");
}

/// Consume realtime messages. These never move the watermark.
pub(crate) async fn realtime_loop(
    shared: Arc<Shared>,
    channel: usize,
    mut rx: mpsc::Receiver<RealtimeMessage>,
    ct: CancellationToken,
) {
    let name = format!("realtime-{}", channel);
    loop {
        let next = tokio::select! {
            _ = ct.cancelled() => break,
            m = rx.recv() => m,
        };
        let Some(msg) = next else { break };
        counter!("loader_realtime_messages_total", 1u64);
        match shared.applier.apply_blob(Source::Realtime, &name, msg.payload, OnRecordError::Skip, &ct).await {
            Ok(stats) => debug!(channel, applied = stats.applied, stale = stats.stale, "realtime: message applied"),
            Err(LoadError::ShutdownInProgress) => break,
            Err(e) => warn!(channel, error = %e, "realtime: message failed"),
        }
    }
    info!(channel, "realtime: ingest loop stopped");
}
