//! kvload blob: bucket storage access and the notification transports that
//! tell the loader about new data.
//!
//! Transports push what they observe into `tokio::sync::mpsc` channels and
//! run until their `CancellationToken` fires. Transient failures are retried
//! inside the transport; the loader never sees them as fatal.

#![forbid(unsafe_code)]

use bytes::Bytes;
use kvload_core::LoadError;
use thiserror::Error;

pub mod local;
pub mod memory;
pub mod notifier;
pub mod realtime;

pub use local::LocalBlobStorageClient;
pub use memory::MemoryBlobStorageClient;
pub use notifier::{
    Backoff, BlobStorageChangeNotifier, BucketDeltaFileNotifier, ChannelChangeNotifier, ChannelDeltaFileNotifier,
    DeltaFileNotifier,
};
pub use realtime::{ChannelRealtimeNotifier, RealtimeMessage, RealtimeNotifier, RealtimePublisher};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("bucket {bucket:?} not found")]
    BucketNotFound { bucket: String },
    #[error("object {name:?} not found in bucket {bucket:?}")]
    ObjectNotFound { bucket: String, name: String },
    #[error("invalid object name {0:?}")]
    InvalidName(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl From<BlobError> for LoadError {
    fn from(e: BlobError) -> Self {
        LoadError::Transport { message: e.to_string(), source: Some(Box::new(e)) }
    }
}

/// Listing filter. `start_after` compares whole object names lexicographically;
/// fixed-width file names make that the same as logical-time order per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub start_after: Option<String>,
}

impl ListOptions {
    pub fn matches(&self, name: &str) -> bool {
        if let Some(p) = &self.prefix {
            if !name.starts_with(p.as_str()) {
                return false;
            }
        }
        match &self.start_after {
            Some(after) => name > after.as_str(),
            None => true,
        }
    }
}

/// Read access to a bucket of snapshot and delta objects.
#[async_trait::async_trait]
pub trait BlobStorageClient: Send + Sync {
    /// Object names matching `opts`, sorted ascending.
    async fn list(&self, bucket: &str, opts: &ListOptions) -> Result<Vec<String>, BlobError>;

    /// Full content of one object.
    async fn read(&self, bucket: &str, name: &str) -> Result<Bytes, BlobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_options_filter_by_prefix_and_start_after() {
        let opts = ListOptions { prefix: Some("s1/".into()), start_after: Some("s1/DELTA_0000000000000200".into()) };
        assert!(!opts.matches("s0/DELTA_0000000000000300"));
        assert!(!opts.matches("s1/DELTA_0000000000000200"));
        assert!(!opts.matches("s1/DELTA_0000000000000150"));
        assert!(opts.matches("s1/DELTA_0000000000000201"));
        assert!(ListOptions::default().matches("anything"));
    }

    #[test]
    fn converts_into_transport_error() {
        let e: LoadError = BlobError::Unavailable("down".into()).into();
        assert!(matches!(e, LoadError::Transport { .. }));
    }
}
