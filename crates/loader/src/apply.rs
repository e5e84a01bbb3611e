//! Shared record path used by bootstrap, delta ingestion and realtime updates:
//! decode, shard filter, route to cache or UDF client.

use std::sync::Arc;

use bytes::Bytes;
use kvload_cache::{Cache, UdfClient};
use kvload_core::{DataRecord, LoadError, LoadResult, ShardFilter};
use kvload_records::{decode_stream, DecoderOptions, RowReaderFactory};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Records between cooperative yields while applying a large blob.
const YIELD_EVERY: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Snapshot,
    Delta,
    Realtime,
}

impl Source {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Source::Snapshot => "snapshot",
            Source::Delta => "delta",
            Source::Realtime => "realtime",
        }
    }
}

/// What to do with a record that fails to decode or apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnRecordError {
    /// Fail the whole blob (bootstrap).
    Abort,
    /// Log, count and continue (continuous ingestion).
    Skip,
}

/// Per-blob counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: u64,
    pub stale: u64,
    pub skipped_shard: u64,
    pub errors: u64,
    /// Highest commit time among key/value records this shard accepted.
    pub max_commit_time: Option<i64>,
}

impl ApplyStats {
    fn observe_commit(&mut self, ts: i64) {
        self.max_commit_time = Some(self.max_commit_time.map_or(ts, |m| m.max(ts)));
    }
}

pub(crate) struct Applier {
    cache: Arc<dyn Cache>,
    udf: Arc<dyn UdfClient>,
    filter: ShardFilter,
    reader: Arc<dyn RowReaderFactory>,
    decoder: DecoderOptions,
}

impl Applier {
    pub(crate) fn new(
        cache: Arc<dyn Cache>,
        udf: Arc<dyn UdfClient>,
        filter: ShardFilter,
        reader: Arc<dyn RowReaderFactory>,
        decoder: DecoderOptions,
    ) -> Self {
        Self { cache, udf, filter, reader, decoder }
    }

    pub(crate) fn filter(&self) -> &ShardFilter { &self.filter }

    pub(crate) fn cache(&self) -> &dyn Cache { self.cache.as_ref() }

    /// Apply one record. Runs to completion once started.
    pub(crate) fn apply_record(&self, record: DataRecord, stats: &mut ApplyStats) -> LoadResult<()> {
        if !self.filter.accepts(&record) {
            stats.skipped_shard += 1;
            return Ok(());
        }
        match record {
            DataRecord::KeyValueMutation(kv) => {
                stats.observe_commit(kv.logical_commit_time);
                if self.cache.apply(&kv) {
                    stats.applied += 1;
                } else {
                    stats.stale += 1;
                }
            }
            DataRecord::UdfConfig(cfg) => match self.udf.apply(&cfg) {
                Ok(true) => stats.applied += 1,
                Ok(false) => stats.stale += 1,
                Err(e) => return Err(LoadError::Udf(e.to_string())),
            },
        }
        Ok(())
    }

    /// Decode and apply every record in `blob`, stopping early with
    /// `ShutdownInProgress` if `ct` fires between records.
    pub(crate) async fn apply_blob(
        &self,
        source: Source,
        name: &str,
        blob: Bytes,
        on_error: OnRecordError,
        ct: &CancellationToken,
    ) -> LoadResult<ApplyStats> {
        let mut stats = ApplyStats::default();
        let mut seen = 0u64;
        for item in decode_stream(self.reader.as_ref(), blob, self.decoder) {
            if ct.is_cancelled() {
                return Err(LoadError::ShutdownInProgress);
            }
            let res = item.map_err(LoadError::from).and_then(|record| self.apply_record(record, &mut stats));
            if let Err(e) = res {
                counter!("loader_decode_errors_total", 1u64, "source" => source.as_str());
                match on_error {
                    OnRecordError::Abort => return Err(e),
                    OnRecordError::Skip => {
                        stats.errors += 1;
                        warn!(source = source.as_str(), name, error = %e, "loader: record skipped");
                    }
                }
            }
            seen += 1;
            if seen % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        counter!("loader_records_applied_total", stats.applied, "source" => source.as_str());
        counter!("loader_records_skipped_shard_total", stats.skipped_shard, "source" => source.as_str());
        Ok(stats)
    }
}
