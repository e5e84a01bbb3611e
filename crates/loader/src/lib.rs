//! kvload data orchestrator.
//!
//! [`DataOrchestrator::try_create`] loads the newest snapshot and the deltas
//! after it, then [`DataOrchestrator::start`] keeps the cache current from the
//! delta notifier and any realtime channels until [`DataOrchestrator::shutdown`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use kvload_blob::{BlobStorageClient, DeltaFileNotifier, RealtimeNotifier};
use kvload_cache::{Cache, UdfClient};
use kvload_core::{FileDescriptor, FileKind, LoadError, LoadResult, ShardFilter};
use kvload_records::{DecoderOptions, RowReaderFactory};
use metrics::gauge;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod apply;
pub mod bootstrap;
pub mod config;
mod ingest;

pub use apply::ApplyStats;
pub use bootstrap::{plan_load, LoadPlan};
pub use config::LoaderConfig;

use apply::Applier;
use ingest::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Bootstrapping,
    Watching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrchestratorState {
    pub phase: Phase,
    /// Highest delta (or snapshot) logical timestamp fully applied.
    pub watermark: u64,
    pub shard_num: u32,
    pub num_shards: u32,
}

/// Everything the orchestrator needs. Collaborators are shared, not owned.
pub struct Options {
    pub bucket: String,
    pub bucket_prefix: Option<String>,
    pub cache: Arc<dyn Cache>,
    pub udf_client: Arc<dyn UdfClient>,
    pub blob_client: Arc<dyn BlobStorageClient>,
    pub delta_notifier: Arc<dyn DeltaFileNotifier>,
    pub reader_factory: Arc<dyn RowReaderFactory>,
    pub realtime: Vec<Arc<dyn RealtimeNotifier>>,
    pub shard_num: u32,
    pub num_shards: u32,
    pub decoder: DecoderOptions,
    pub backoff_max: Duration,
    pub shutdown_timeout: Duration,
    pub queue_cap: usize,
}

impl Options {
    /// Single shard, no realtime channels, defaults from [`LoaderConfig::default`].
    pub fn new(
        bucket: impl Into<String>,
        cache: Arc<dyn Cache>,
        udf_client: Arc<dyn UdfClient>,
        blob_client: Arc<dyn BlobStorageClient>,
        delta_notifier: Arc<dyn DeltaFileNotifier>,
        reader_factory: Arc<dyn RowReaderFactory>,
    ) -> Self {
        let d = LoaderConfig::default();
        Self {
            bucket: bucket.into(),
            bucket_prefix: None,
            cache,
            udf_client,
            blob_client,
            delta_notifier,
            reader_factory,
            realtime: Vec::new(),
            shard_num: d.shard_num,
            num_shards: d.num_shards,
            decoder: DecoderOptions { value_separator: d.value_separator },
            backoff_max: d.backoff_max,
            shutdown_timeout: d.shutdown_timeout,
            queue_cap: d.queue_cap,
        }
    }

    /// Take prefix, sharding, separator and timing from `cfg`. The bucket and
    /// collaborators are left alone.
    pub fn with_config(mut self, cfg: &LoaderConfig) -> Self {
        self.bucket_prefix = cfg.bucket_prefix.clone();
        self.shard_num = cfg.shard_num;
        self.num_shards = cfg.num_shards;
        self.decoder = DecoderOptions { value_separator: cfg.value_separator };
        self.backoff_max = cfg.backoff_max;
        self.shutdown_timeout = cfg.shutdown_timeout;
        self.queue_cap = cfg.queue_cap;
        self
    }

    pub fn with_shard(mut self, shard_num: u32, num_shards: u32) -> Self {
        self.shard_num = shard_num;
        self.num_shards = num_shards;
        self
    }

    pub fn with_realtime(mut self, notifier: Arc<dyn RealtimeNotifier>) -> Self {
        self.realtime.push(notifier);
        self
    }
}

const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Objects live under `prefix/`; a bare `shard-1` would compare against
/// `shard-1DELTA_...` when listing after the watermark.
fn normalize_prefix(prefix: Option<String>) -> Option<String> {
    match prefix {
        Some(p) if p.is_empty() => None,
        Some(p) if p.ends_with('/') => Some(p),
        Some(p) => Some(format!("{}/", p)),
        None => None,
    }
}

/// Owns the ingestion tasks. Dropping it cancels them.
pub struct DataOrchestrator {
    shared: Arc<Shared>,
    delta_notifier: Arc<dyn DeltaFileNotifier>,
    realtime: Vec<Arc<dyn RealtimeNotifier>>,
    bucket_prefix: Option<String>,
    queue_cap: usize,
    shutdown_timeout: Duration,
    ct: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl DataOrchestrator {
    /// Validate `options` and run the initial load. Returns only once the
    /// cache reflects the newest snapshot and every later delta; any
    /// failure along the way is returned and nothing is left running.
    pub async fn try_create(options: Options) -> LoadResult<Self> {
        let filter = ShardFilter::new(options.shard_num, options.num_shards)?;
        if options.bucket.is_empty() {
            return Err(LoadError::InvalidOptions("bucket must not be empty".into()));
        }
        let bucket_prefix = normalize_prefix(options.bucket_prefix);
        let (state_tx, _) = watch::channel(OrchestratorState {
            phase: Phase::Bootstrapping,
            watermark: 0,
            shard_num: filter.shard_num(),
            num_shards: filter.num_shards(),
        });
        let applier = Applier::new(
            options.cache,
            options.udf_client,
            filter,
            options.reader_factory,
            options.decoder,
        );
        let shared = Arc::new(Shared {
            applier,
            client: options.blob_client,
            bucket: options.bucket,
            backoff_max: options.backoff_max,
            state: state_tx,
        });
        let ct = CancellationToken::new();

        let t0 = Instant::now();
        info!(
            bucket = %shared.bucket,
            prefix = ?bucket_prefix,
            shard_num = shared.applier.filter().shard_num(),
            num_shards = shared.applier.filter().num_shards(),
            "loader: bootstrapping"
        );
        let watermark = bootstrap::run(
            shared.client.as_ref(),
            &shared.bucket,
            bucket_prefix.as_deref(),
            &shared.applier,
            &ct,
        )
        .await?;
        shared.state.send_modify(|s| {
            s.watermark = watermark;
            s.phase = Phase::Watching;
        });
        gauge!("loader_watermark", watermark as f64);
        info!(watermark, took_ms = %t0.elapsed().as_millis(), "loader: bootstrap complete");

        Ok(Self {
            shared,
            delta_notifier: options.delta_notifier,
            realtime: options.realtime,
            bucket_prefix,
            queue_cap: options.queue_cap.max(1),
            shutdown_timeout: options.shutdown_timeout,
            ct,
            tasks: Vec::new(),
            started: false,
        })
    }

    /// Spawn the delta and realtime ingestion tasks. Must be called from
    /// within a tokio runtime, at most once.
    pub fn start(&mut self) -> LoadResult<()> {
        if self.ct.is_cancelled() {
            return Err(LoadError::ShutdownInProgress);
        }
        if self.started {
            return Err(LoadError::InvalidOptions("orchestrator already started".into()));
        }
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| LoadError::InvalidOptions(format!("start needs a tokio runtime: {}", e)))?;
        self.started = true;

        let watermark = self.shared.watermark();
        let start_after = format!(
            "{}{}",
            self.bucket_prefix.as_deref().unwrap_or(""),
            FileDescriptor::new(FileKind::Delta, watermark)?
        );

        let (tx, rx) = mpsc::channel(self.queue_cap);
        let notifier = Arc::clone(&self.delta_notifier);
        let bucket = self.shared.bucket.clone();
        let prefix = self.bucket_prefix.clone();
        let ct = self.ct.child_token();
        self.tasks.push(rt.spawn(async move {
            if let Err(e) = notifier.run(&bucket, prefix.as_deref(), start_after, tx, ct).await {
                warn!(error = %e, "deltas: notifier stopped with error");
            }
        }));
        self.tasks.push(rt.spawn(ingest::delta_loop(Arc::clone(&self.shared), rx, self.ct.child_token())));

        for (channel, notifier) in self.realtime.iter().enumerate() {
            let (tx, rx) = mpsc::channel(self.queue_cap);
            let notifier = Arc::clone(notifier);
            let ct = self.ct.child_token();
            self.tasks.push(rt.spawn(async move {
                if let Err(e) = notifier.run(tx, ct).await {
                    warn!(channel, error = %e, "realtime: notifier stopped with error");
                }
            }));
            self.tasks.push(rt.spawn(ingest::realtime_loop(
                Arc::clone(&self.shared),
                channel,
                rx,
                self.ct.child_token(),
            )));
        }
        info!(watermark, realtime_channels = self.realtime.len(), "loader: ingestion started");
        Ok(())
    }

    pub fn state(&self) -> OrchestratorState { *self.shared.state.borrow() }

    /// Observe watermark and phase changes.
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> { self.shared.state.subscribe() }

    pub fn is_shutting_down(&self) -> bool { self.ct.is_cancelled() }

    /// Stop all tasks. Waits up to the configured timeout for in-flight
    /// records to finish, then aborts whatever is left and waits for the
    /// aborts to land. Idempotent.
    pub async fn shutdown(&mut self) {
        self.ct.cancel();
        if self.tasks.is_empty() {
            return;
        }
        let t0 = Instant::now();
        let joined = tokio::time::timeout(self.shutdown_timeout, join_all(self.tasks.iter_mut())).await;
        if joined.is_err() {
            warn!(timeout_ms = self.shutdown_timeout.as_millis() as u64, "loader: shutdown timed out; aborting tasks");
            for t in &self.tasks {
                t.abort();
            }
            // Handles that already completed must not be polled again.
            let pending = self.tasks.iter_mut().filter(|t| !t.is_finished());
            if tokio::time::timeout(ABORT_GRACE, join_all(pending)).await.is_err() {
                warn!("loader: aborted tasks did not finish");
            }
        }
        self.tasks.clear();
        info!(watermark = self.shared.watermark(), took_ms = %t0.elapsed().as_millis(), "loader: stopped");
    }
}

/// Best effort: cancels and aborts without waiting, so a task may still be
/// finishing its current record when this returns. Call
/// [`DataOrchestrator::shutdown`] for an orderly stop.
impl Drop for DataOrchestrator {
    fn drop(&mut self) {
        self.ct.cancel();
        for t in &self.tasks {
            t.abort();
        }
    }
}
