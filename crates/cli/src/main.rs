use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kvload_blob::{
    BlobStorageClient, BucketDeltaFileNotifier, ChannelRealtimeNotifier, ListOptions, LocalBlobStorageClient,
    RealtimeMessage, RealtimeNotifier, RealtimePublisher,
};
use kvload_cache::{InMemoryCache, InMemoryUdfClient};
use kvload_core::constants::{self, ohttp};
use kvload_core::{DataRecordType, FileDescriptor};
use kvload_loader::{plan_load, DataOrchestrator, LoaderConfig, Options};
use kvload_records::{decode_stream, DecoderOptions, JsonLinesReaderFactory};
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kvloadctl", version, about = "kvload data loader CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding one subdirectory per bucket
    #[arg(long = "root", global = true, default_value = ".")]
    root: PathBuf,

    /// Bucket name (default: KVLOAD_BUCKET)
    #[arg(long = "bucket", global = true)]
    bucket: Option<String>,

    /// Object name prefix inside the bucket (default: KVLOAD_BUCKET_PREFIX)
    #[arg(long = "prefix", global = true)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum RecordKind { Kv, Udf }

impl From<RecordKind> for DataRecordType {
    fn from(k: RecordKind) -> Self {
        match k {
            RecordKind::Kv => DataRecordType::KeyValueMutation,
            RecordKind::Udf => DataRecordType::UdfConfig,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap from the bucket, then follow new deltas until Ctrl-C
    Run {
        #[arg(long = "shard-num")]
        shard_num: Option<u32>,
        #[arg(long = "num-shards")]
        num_shards: Option<u32>,
        /// Separator for string_set values
        #[arg(long = "separator")]
        separator: Option<char>,
        /// Realtime channels; stdin lines are published round-robin
        #[arg(long = "realtime-channels")]
        realtime_channels: Option<usize>,
        /// Bucket poll interval in milliseconds
        #[arg(long = "poll-ms")]
        poll_ms: Option<u64>,
        /// Print every key after bootstrap and on exit
        #[arg(long = "dump", action = ArgAction::SetTrue)]
        dump: bool,
    },
    /// List bucket objects and the load plan derived from them
    Ls,
    /// Decode a data file and print its records
    Decode {
        file: PathBuf,
        /// Record type for rows without a record_type column
        #[arg(long = "type", value_enum, default_value_t = RecordKind::Kv)]
        record_type: RecordKind,
        #[arg(long = "separator")]
        separator: Option<char>,
    },
    /// Print file naming constants and the OHTTP key configuration
    Info,
}

fn init_tracing() {
    let env = std::env::var("KVLOAD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KVLOAD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KVLOAD_METRICS_ADDR; expected host:port");
        }
    }
}

fn bucket_of(cli_bucket: Option<String>, cfg: &LoaderConfig) -> Result<String> {
    match cli_bucket.or_else(|| cfg.bucket.clone()) {
        Some(b) => Ok(b),
        None => bail!("no bucket given; pass --bucket or set KVLOAD_BUCKET"),
    }
}

#[derive(Serialize)]
struct Entry<'a> {
    name: &'a str,
    descriptor: Option<FileDescriptor>,
}

#[derive(Serialize)]
struct Dump {
    watermark: u64,
    keys: Vec<(String, kvload_core::Value)>,
}

fn print_dump(output: Output, watermark: u64, cache: &InMemoryCache) -> Result<()> {
    let mut keys = cache.entries();
    keys.sort_by(|a, b| a.0.cmp(&b.0));
    match output {
        Output::Human => {
            println!("watermark {}", watermark);
            for (k, v) in &keys {
                println!("{} = {:?}", k, v);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&Dump { watermark, keys })?),
    }
    Ok(())
}

/// Publish stdin lines to the realtime channels, round-robin.
async fn pump_stdin(publishers: Vec<RealtimePublisher>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut next = 0usize;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let p = &publishers[next % publishers.len()];
                next += 1;
                if let Err(e) = p.publish(RealtimeMessage::new(line.into_bytes())).await {
                    warn!(error = %e, "realtime: publish failed");
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "realtime: stdin read failed");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut cfg = LoaderConfig::from_env();
    if cli.prefix.is_some() {
        cfg.bucket_prefix = cli.prefix.clone();
    }

    match cli.command {
        Commands::Run { shard_num, num_shards, separator, realtime_channels, poll_ms, dump } => {
            cfg.shard_num = shard_num.unwrap_or(cfg.shard_num);
            cfg.num_shards = num_shards.unwrap_or(cfg.num_shards);
            cfg.value_separator = separator.unwrap_or(cfg.value_separator);
            cfg.realtime_channels = realtime_channels.unwrap_or(cfg.realtime_channels);
            if let Some(ms) = poll_ms {
                cfg.poll_interval = Duration::from_millis(ms);
            }
            let bucket = bucket_of(cli.bucket, &cfg)?;
            let client: Arc<dyn BlobStorageClient> = Arc::new(
                LocalBlobStorageClient::new(&cli.root).with_context(|| format!("opening {}", cli.root.display()))?,
            );
            let cache = Arc::new(InMemoryCache::new());
            let notifier = BucketDeltaFileNotifier::new(client.clone(), cfg.poll_interval, cfg.backoff_max);
            let mut opts = Options::new(
                bucket.clone(),
                cache.clone(),
                Arc::new(InMemoryUdfClient::new()),
                client,
                Arc::new(notifier),
                Arc::new(JsonLinesReaderFactory::default()),
            )
            .with_config(&cfg);
            let mut publishers = Vec::new();
            for _ in 0..cfg.realtime_channels {
                let (publisher, channel) = ChannelRealtimeNotifier::channel(cfg.queue_cap);
                publishers.push(publisher);
                opts = opts.with_realtime(Arc::new(channel) as Arc<dyn RealtimeNotifier>);
            }

            let t0 = Instant::now();
            let mut orch = DataOrchestrator::try_create(opts).await.context("bootstrap failed")?;
            info!(bucket = %bucket, watermark = orch.state().watermark, keys = cache.len(), took_ms = %t0.elapsed().as_millis(), "run: bootstrap ok");
            if dump {
                print_dump(cli.output, orch.state().watermark, &cache)?;
            }
            orch.start()?;
            let stdin_task = (!publishers.is_empty()).then(|| tokio::spawn(pump_stdin(publishers)));

            let mut rx = orch.subscribe();
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => break,
                    changed = rx.changed() => {
                        if changed.is_err() { break; }
                        let s = *rx.borrow_and_update();
                        info!(watermark = s.watermark, keys = cache.len(), "run: watermark advanced");
                    }
                }
            }
            info!("run: shutting down");
            orch.shutdown().await;
            if let Some(t) = stdin_task {
                t.abort();
            }
            if dump {
                print_dump(cli.output, orch.state().watermark, &cache)?;
            }
        }
        Commands::Ls => {
            let bucket = bucket_of(cli.bucket, &cfg)?;
            let client = LocalBlobStorageClient::new(&cli.root).with_context(|| format!("opening {}", cli.root.display()))?;
            let t0 = Instant::now();
            let names = client
                .list(&bucket, &ListOptions { prefix: cfg.bucket_prefix.clone(), start_after: None })
                .await?;
            info!(count = names.len(), took_ms = %t0.elapsed().as_millis(), "ls: list ok");
            let plan = plan_load(&names);
            match cli.output {
                Output::Human => {
                    for name in &names {
                        match FileDescriptor::parse_object_name(name) {
                            Ok(fd) => println!("{} • {:?} • {}", name, fd.kind(), fd.logical_timestamp()),
                            Err(e) => println!("{} • ignored ({})", name, e),
                        }
                    }
                    println!("---");
                    for (_, name) in plan.files() {
                        println!("load {}", name);
                    }
                    println!("watermark after bootstrap: {}", plan.watermark());
                }
                Output::Json => {
                    let entries: Vec<Entry> = names
                        .iter()
                        .map(|n| Entry { name: n, descriptor: FileDescriptor::parse_object_name(n).ok() })
                        .collect();
                    let load: Vec<&str> = plan.files().map(|(_, n)| n.as_str()).collect();
                    let out = serde_json::json!({ "objects": entries, "load": load, "watermark": plan.watermark() });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Decode { file, record_type, separator } => {
            let data = tokio::fs::read(&file).await.with_context(|| format!("reading {}", file.display()))?;
            let factory = JsonLinesReaderFactory::new(record_type.into());
            let opts = DecoderOptions { value_separator: separator.unwrap_or(cfg.value_separator) };
            let (mut ok, mut bad) = (0usize, 0usize);
            for (i, item) in decode_stream(&factory, bytes::Bytes::from(data), opts).enumerate() {
                match item {
                    Ok(record) => {
                        ok += 1;
                        match cli.output {
                            Output::Human => println!("{:?}", record),
                            Output::Json => println!("{}", serde_json::to_string(&record)?),
                        }
                    }
                    Err(e) => {
                        bad += 1;
                        eprintln!("row {}: {}", i + 1, e);
                    }
                }
            }
            info!(ok, bad, file = %file.display(), "decode: done");
            if bad > 0 {
                bail!("{} of {} rows failed to decode", bad, ok + bad);
            }
        }
        Commands::Info => {
            let out = serde_json::json!({
                "service": constants::SERVICE_NAME,
                "snapshot_prefix": constants::SNAPSHOT_FILE_PREFIX,
                "delta_prefix": constants::DELTA_FILE_PREFIX,
                "delimiter": constants::FILE_COMPONENT_DELIMITER.to_string(),
                "timestamp_digits": constants::LOGICAL_TIME_DIGITS,
                "value_separator": constants::DEFAULT_VALUE_SEPARATOR.to_string(),
                "query_arg_delimiter": constants::QUERY_ARG_DELIMITER.to_string(),
                "ohttp": {
                    "public_key": ohttp::TEST_PUBLIC_KEY,
                    "kem": format!("0x{:04X}", ohttp::KEM),
                    "kdf": format!("0x{:04X}", ohttp::KDF),
                    "aead": format!("0x{:04X}", ohttp::AEAD),
                },
            });
            match cli.output {
                Output::Human => {
                    println!("service            {}", constants::SERVICE_NAME);
                    println!("snapshot file      {}", FileDescriptor::new(kvload_core::FileKind::Snapshot, 1)?);
                    println!("delta file         {}", FileDescriptor::new(kvload_core::FileKind::Delta, 1)?);
                    println!("value separator    {:?}", constants::DEFAULT_VALUE_SEPARATOR);
                    println!("query delimiter    {:?}", constants::QUERY_ARG_DELIMITER);
                    println!(
                        "ohttp              kem=0x{:04X} kdf=0x{:04X} aead=0x{:04X}",
                        ohttp::KEM,
                        ohttp::KDF,
                        ohttp::AEAD
                    );
                    println!("ohttp test key     {}", ohttp::TEST_PUBLIC_KEY);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
    }
    Ok(())
}
