//! Runtime configuration read from `KVLOAD_*` environment variables.

use std::time::Duration;

use kvload_core::constants::DEFAULT_VALUE_SEPARATOR;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderConfig {
    pub bucket: Option<String>,
    pub bucket_prefix: Option<String>,
    pub shard_num: u32,
    pub num_shards: u32,
    pub value_separator: char,
    pub realtime_channels: usize,
    pub poll_interval: Duration,
    pub backoff_max: Duration,
    pub shutdown_timeout: Duration,
    pub queue_cap: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            bucket_prefix: None,
            shard_num: 0,
            num_shards: 1,
            value_separator: DEFAULT_VALUE_SEPARATOR,
            realtime_channels: 0,
            poll_interval: Duration::from_millis(5000),
            backoff_max: Duration::from_secs(30),
            shutdown_timeout: Duration::from_millis(5000),
            queue_cap: 1024,
        }
    }
}

impl LoaderConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Same as [`LoaderConfig::from_env`] with an explicit variable source.
    /// Unparseable values fall back to the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            bucket: get("KVLOAD_BUCKET").filter(|s| !s.is_empty()),
            bucket_prefix: get("KVLOAD_BUCKET_PREFIX").filter(|s| !s.is_empty()),
            shard_num: num("KVLOAD_SHARD_NUM").map(|v| v as u32).unwrap_or(d.shard_num),
            num_shards: num("KVLOAD_NUM_SHARDS").map(|v| v as u32).unwrap_or(d.num_shards),
            value_separator: get("KVLOAD_VALUE_SEPARATOR")
                .and_then(|s| {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Some(c),
                        _ => None,
                    }
                })
                .unwrap_or(d.value_separator),
            realtime_channels: num("KVLOAD_REALTIME_CHANNELS").map(|v| v as usize).unwrap_or(d.realtime_channels),
            poll_interval: num("KVLOAD_POLL_INTERVAL_MS").map(Duration::from_millis).unwrap_or(d.poll_interval),
            backoff_max: num("KVLOAD_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            shutdown_timeout: num("KVLOAD_SHUTDOWN_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.shutdown_timeout),
            queue_cap: num("KVLOAD_QUEUE_CAP").map(|v| v as usize).unwrap_or(d.queue_cap),
        }
    }
}
