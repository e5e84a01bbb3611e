#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kvload_blob::{
    BlobError, BucketDeltaFileNotifier, ChannelDeltaFileNotifier, ChannelRealtimeNotifier, DeltaFileNotifier,
    MemoryBlobStorageClient, RealtimeMessage,
};
use kvload_cache::{InMemoryCache, InMemoryUdfClient};
use kvload_core::{
    fnv1a64, DataRecord, DataRecordType, KeyValueMutationRecord, LoadError, MutationType, Value,
};
use kvload_loader::{DataOrchestrator, Options, OrchestratorState, Phase};
use kvload_records::{encode_json_line, JsonLinesReaderFactory};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "kv";

fn kv(key: &str, value: &str, ts: i64) -> String {
    let rec = DataRecord::KeyValueMutation(KeyValueMutationRecord {
        key: key.into(),
        value: Value::String(value.into()),
        logical_commit_time: ts,
        mutation_type: MutationType::Update,
    });
    encode_json_line(&rec, ',')
}

fn del(key: &str, ts: i64) -> String {
    let rec = DataRecord::KeyValueMutation(KeyValueMutationRecord {
        key: key.into(),
        value: Value::String(String::new()),
        logical_commit_time: ts,
        mutation_type: MutationType::Delete,
    });
    encode_json_line(&rec, ',')
}

fn file(lines: &[String]) -> Vec<u8> {
    let mut out = lines.join("\n");
    out.push('\n');
    out.into_bytes()
}

struct Fixture {
    blob: Arc<MemoryBlobStorageClient>,
    cache: Arc<InMemoryCache>,
    udf: Arc<InMemoryUdfClient>,
}

impl Fixture {
    fn new() -> Self {
        let blob = Arc::new(MemoryBlobStorageClient::new());
        blob.create_bucket(BUCKET);
        Self { blob, cache: Arc::new(InMemoryCache::new()), udf: Arc::new(InMemoryUdfClient::new()) }
    }

    fn options(&self, notifier: Arc<dyn DeltaFileNotifier>) -> Options {
        let mut opts = Options::new(
            BUCKET,
            self.cache.clone(),
            self.udf.clone(),
            self.blob.clone(),
            notifier,
            Arc::new(JsonLinesReaderFactory::new(DataRecordType::KeyValueMutation)),
        );
        opts.shutdown_timeout = Duration::from_secs(2);
        opts
    }

    fn get(&self, key: &str) -> Option<String> {
        match self.cache.get(key) {
            Some(Value::String(s)) => Some(s),
            other => other.map(|v| format!("{:?}", v)),
        }
    }

    fn seed_base(&self) {
        self.blob.put(BUCKET, "SNAPSHOT_0000000000000100", file(&[kv("a", "1", 100)]));
        self.blob.put(BUCKET, "DELTA_0000000000000200", file(&[kv("a", "2", 200)]));
    }
}

async fn wait_for_watermark(mut rx: watch::Receiver<OrchestratorState>, target: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while rx.borrow_and_update().watermark < target {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("watermark reached");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_applies_snapshot_then_deltas() {
    let fx = Fixture::new();
    fx.seed_base();
    fx.blob.put(BUCKET, "SNAPSHOT_0000000000000050", file(&[kv("old", "x", 50)]));
    fx.blob.put(BUCKET, "DELTA_0000000000000080", file(&[kv("older", "y", 80)]));
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);

    let orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    let state = orch.state();
    assert_eq!(state.phase, Phase::Watching);
    assert_eq!(state.watermark, 200);
    assert_eq!(fx.get("a").as_deref(), Some("2"));
    assert_eq!(fx.get("old"), None);
    assert_eq!(fx.get("older"), None);
    assert_eq!(fx.blob.reads(), vec!["SNAPSHOT_0000000000000100", "DELTA_0000000000000200"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_bucket_bootstraps_to_zero() {
    let fx = Fixture::new();
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    assert_eq!(orch.state().watermark, 0);
    assert!(fx.cache.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_decode_failure_is_fatal() {
    let fx = Fixture::new();
    fx.blob.put(
        BUCKET,
        "SNAPSHOT_0000000000000100",
        file(&[kv("a", "1", 100), r#"{"key":"b","value":"v","mutation_type":"update","value_type":"string"}"#.into()]),
    );
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let err = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.err().expect("create fails");
    assert!(matches!(err, LoadError::Decode(_)), "got {:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_bucket_and_bad_shard_are_rejected() {
    let fx = Fixture::new();
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let mut opts = fx.options(Arc::new(notifier));
    opts.bucket = "nope".into();
    let err = DataOrchestrator::try_create(opts).await.err().expect("create fails");
    assert!(matches!(err, LoadError::Transport { .. }), "got {:?}", err);

    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let opts = fx.options(Arc::new(notifier)).with_shard(2, 2);
    let err = DataOrchestrator::try_create(opts).await.err().expect("create fails");
    assert!(matches!(err, LoadError::InvalidOptions(_)), "got {:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_notification_is_not_read() {
    let fx = Fixture::new();
    fx.seed_base();
    fx.blob.put(BUCKET, "DELTA_0000000000000150", file(&[kv("a", "stale", 150)]));
    fx.blob.put(BUCKET, "DELTA_0000000000000300", file(&[kv("c", "3", 300)]));
    let (tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let mut orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    orch.start().unwrap();

    tx.send("DELTA_0000000000000150".into()).await.unwrap();
    tx.send("DELTA_0000000000000300".into()).await.unwrap();
    wait_for_watermark(orch.subscribe(), 300).await;

    assert!(!fx.blob.reads().iter().any(|n| n == "DELTA_0000000000000150"));
    assert_eq!(fx.get("a").as_deref(), Some("2"));
    assert_eq!(fx.get("c").as_deref(), Some("3"));
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redelivered_delta_is_applied_once() {
    let fx = Fixture::new();
    fx.seed_base();
    fx.blob.put(BUCKET, "DELTA_0000000000000300", file(&[kv("c", "3", 300)]));
    fx.blob.put(BUCKET, "DELTA_0000000000000400", file(&[kv("d", "4", 400)]));
    let (tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let mut orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    orch.start().unwrap();

    for name in ["DELTA_0000000000000300", "DELTA_0000000000000300", "DELTA_0000000000000400"] {
        tx.send(name.into()).await.unwrap();
    }
    wait_for_watermark(orch.subscribe(), 400).await;
    let reads = fx.blob.reads();
    assert_eq!(reads.iter().filter(|n| *n == "DELTA_0000000000000300").count(), 1);
    assert_eq!(fx.get("d").as_deref(), Some("4"));
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_record_in_delta_is_skipped() {
    let fx = Fixture::new();
    fx.seed_base();
    fx.blob.put(
        BUCKET,
        "DELTA_0000000000000300",
        file(&[
            r#"{"key":"x","value":"v","logical_commit_time":"300","mutation_type":"upsert","value_type":"string"}"#.into(),
            "not json".into(),
            kv("y", "ok", 300),
        ]),
    );
    let (tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let mut orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    orch.start().unwrap();
    tx.send("DELTA_0000000000000300".into()).await.unwrap();
    wait_for_watermark(orch.subscribe(), 300).await;
    assert_eq!(fx.get("x"), None);
    assert_eq!(fx.get("y").as_deref(), Some("ok"));
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_in_delta_removes_key() {
    let fx = Fixture::new();
    fx.seed_base();
    fx.blob.put(BUCKET, "DELTA_0000000000000300", file(&[del("a", 250)]));
    let (tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let mut orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    orch.start().unwrap();
    tx.send("DELTA_0000000000000300".into()).await.unwrap();
    wait_for_watermark(orch.subscribe(), 300).await;
    assert_eq!(fx.get("a"), None);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_updates_respect_commit_time_and_leave_watermark() {
    let fx = Fixture::new();
    fx.seed_base();
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let (publisher, realtime) = ChannelRealtimeNotifier::channel(8);
    let opts = fx.options(Arc::new(notifier)).with_realtime(Arc::new(realtime));
    let mut orch = DataOrchestrator::try_create(opts).await.unwrap();
    orch.start().unwrap();

    publisher
        .publish(RealtimeMessage::new(file(&[kv("a", "3", 150), kv("b", "fresh", 300)])))
        .await
        .unwrap();
    wait_until(|| fx.get("b").is_some()).await;
    assert_eq!(fx.get("a").as_deref(), Some("2"));
    assert_eq!(fx.get("b").as_deref(), Some("fresh"));
    assert_eq!(orch.state().watermark, 200);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shard_filter_keeps_only_owned_keys() {
    let fx = Fixture::new();
    let keys: Vec<String> = (0..40).map(|i| format!("key-{}", i)).collect();
    let lines: Vec<String> = keys.iter().map(|k| kv(k, "v", 10)).collect();
    fx.blob.put(BUCKET, "SNAPSHOT_0000000000000010", file(&lines));
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let opts = fx.options(Arc::new(notifier)).with_shard(1, 3);
    let orch = DataOrchestrator::try_create(opts).await.unwrap();
    assert_eq!((orch.state().shard_num, orch.state().num_shards), (1, 3));

    for k in &keys {
        let owned = fnv1a64(k.as_bytes()) % 3 == 1;
        assert_eq!(fx.get(k).is_some(), owned, "key {}", k);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udf_config_reaches_udf_client() {
    let fx = Fixture::new();
    let udf = DataRecord::UdfConfig(kvload_core::UserDefinedFunctionsConfigRecord {
        code_snippet: "function h(k) { return k; }".into(),
        handler_name: "h".into(),
        logical_commit_time: 5,
        language: kvload_core::UdfLanguage::Javascript,
    });
    fx.blob.put(BUCKET, "SNAPSHOT_0000000000000010", file(&[encode_json_line(&udf, ','), kv("a", "1", 10)]));
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let opts = fx.options(Arc::new(notifier)).with_shard(0, 64);
    DataOrchestrator::try_create(opts).await.unwrap();
    assert_eq!(fx.udf.active().map(|c| c.handler_name.clone()).as_deref(), Some("h"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_twice_and_after_shutdown_fail() {
    let fx = Fixture::new();
    fx.seed_base();
    fx.blob.put(BUCKET, "DELTA_0000000000000300", file(&[kv("c", "3", 300)]));
    let (tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let mut orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    orch.start().unwrap();
    assert!(matches!(orch.start(), Err(LoadError::InvalidOptions(_))));

    orch.shutdown().await;
    assert!(orch.is_shutting_down());
    assert!(matches!(orch.start(), Err(LoadError::ShutdownInProgress)));
    orch.shutdown().await;

    let _ = tx.send("DELTA_0000000000000300".into()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.get("c"), None);
    assert_eq!(orch.state().watermark, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bucket_notifier_drives_ingestion_end_to_end() {
    let fx = Fixture::new();
    fx.seed_base();
    let notifier = BucketDeltaFileNotifier::new(fx.blob.clone(), Duration::from_millis(20), Duration::from_millis(200));
    let mut orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    orch.start().unwrap();

    fx.blob.put(BUCKET, "DELTA_0000000000000350", file(&[kv("a", "3", 350)]));
    wait_for_watermark(orch.subscribe(), 350).await;
    assert_eq!(fx.get("a").as_deref(), Some("3"));
    assert_eq!(fx.blob.reads().iter().filter(|n| *n == "DELTA_0000000000000200").count(), 1);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_orchestrator_stops_ingestion() {
    let fx = Fixture::new();
    let (tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let mut orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    orch.start().unwrap();
    drop(orch);
    fx.blob.put(BUCKET, "DELTA_0000000000000010", file(&[kv("z", "1", 10)]));
    let _ = tx.send("DELTA_0000000000000010".into()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.get("z"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn older_update_after_tombstone_cleanup_stays_deleted() {
    let fx = Fixture::new();
    fx.blob.put(BUCKET, "SNAPSHOT_0000000000000100", file(&[kv("a", "1", 100)]));
    fx.blob.put(BUCKET, "DELTA_0000000000000200", file(&[del("a", 150)]));
    fx.blob.put(BUCKET, "DELTA_0000000000000300", file(&[kv("a", "old", 120), kv("b", "2", 250)]));
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let orch = DataOrchestrator::try_create(fx.options(Arc::new(notifier))).await.unwrap();
    assert_eq!(orch.state().watermark, 300);
    assert_eq!(fx.cache.tombstones(), 0);
    assert_eq!(fx.get("a"), None);
    assert_eq!(fx.get("b").as_deref(), Some("2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_update_older_than_cleaned_delete_is_dropped() {
    let fx = Fixture::new();
    fx.blob.put(BUCKET, "SNAPSHOT_0000000000000100", file(&[kv("a", "1", 100)]));
    fx.blob.put(BUCKET, "DELTA_0000000000000200", file(&[del("a", 200)]));
    let (_tx, notifier) = ChannelDeltaFileNotifier::channel(8);
    let (publisher, realtime) = ChannelRealtimeNotifier::channel(8);
    let opts = fx.options(Arc::new(notifier)).with_realtime(Arc::new(realtime));
    let mut orch = DataOrchestrator::try_create(opts).await.unwrap();
    orch.start().unwrap();

    publisher
        .publish(RealtimeMessage::new(file(&[kv("a", "stale", 150), kv("c", "marker", 400)])))
        .await
        .unwrap();
    wait_until(|| fx.get("c").is_some()).await;
    assert_eq!(fx.get("a"), None);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prefix_without_trailing_slash_still_follows_new_deltas() {
    let fx = Fixture::new();
    fx.blob.put(BUCKET, "shard-1/SNAPSHOT_0000000000000100", file(&[kv("a", "1", 100)]));
    fx.blob.put(BUCKET, "shard-10/DELTA_0000000000000150", file(&[kv("other", "x", 150)]));
    let notifier = BucketDeltaFileNotifier::new(fx.blob.clone(), Duration::from_millis(20), Duration::from_millis(200));
    let mut opts = fx.options(Arc::new(notifier));
    opts.bucket_prefix = Some("shard-1".into());
    let mut orch = DataOrchestrator::try_create(opts).await.unwrap();
    assert_eq!(orch.state().watermark, 100);
    assert_eq!(fx.get("other"), None);
    orch.start().unwrap();

    fx.blob.put(BUCKET, "shard-1/DELTA_0000000000000200", file(&[kv("a", "2", 200)]));
    wait_for_watermark(orch.subscribe(), 200).await;
    assert_eq!(fx.get("a").as_deref(), Some("2"));
    assert_eq!(fx.get("other"), None);
    orch.shutdown().await;
}

/// Ignores cancellation. Each running call holds one extra `alive` count.
struct HangingNotifier {
    alive: Arc<()>,
}

#[async_trait::async_trait]
impl DeltaFileNotifier for HangingNotifier {
    async fn run(
        &self,
        _bucket: &str,
        _prefix: Option<&str>,
        _start_after: String,
        _tx: mpsc::Sender<String>,
        _ct: CancellationToken,
    ) -> Result<(), BlobError> {
        let _guard = Arc::clone(&self.alive);
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_timeout_waits_for_aborted_tasks() {
    let fx = Fixture::new();
    let alive = Arc::new(());
    let notifier = HangingNotifier { alive: Arc::clone(&alive) };
    let mut opts = fx.options(Arc::new(notifier));
    opts.shutdown_timeout = Duration::from_millis(50);
    let mut orch = DataOrchestrator::try_create(opts).await.unwrap();
    orch.start().unwrap();
    wait_until(|| Arc::strong_count(&alive) == 3).await;

    tokio::time::timeout(Duration::from_secs(2), orch.shutdown()).await.expect("shutdown returns");
    assert_eq!(Arc::strong_count(&alive), 2);
}
