//! UDF client apply contract and an in-memory code-object holder.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use kvload_core::UserDefinedFunctionsConfigRecord;
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UdfError {
    #[error("invalid code object: {0}")]
    InvalidCodeObject(&'static str),
    #[error("udf engine unavailable: {0}")]
    Unavailable(String),
}

/// Receives UDF configuration changes. Shared across ingestion contexts.
pub trait UdfClient: Send + Sync {
    /// Replace the active code object unless the stored one is newer.
    /// `Ok(false)` means the config was older and ignored.
    fn apply(&self, config: &UserDefinedFunctionsConfigRecord) -> Result<bool, UdfError>;
}

/// Holds the active code object; reads are lock-free.
#[derive(Default)]
pub struct InMemoryUdfClient {
    active: ArcSwapOption<UserDefinedFunctionsConfigRecord>,
    write: Mutex<()>,
}

impl InMemoryUdfClient {
    pub fn new() -> Self { Self::default() }

    pub fn active(&self) -> Option<Arc<UserDefinedFunctionsConfigRecord>> { self.active.load_full() }
}

impl UdfClient for InMemoryUdfClient {
    fn apply(&self, config: &UserDefinedFunctionsConfigRecord) -> Result<bool, UdfError> {
        if config.handler_name.is_empty() {
            return Err(UdfError::InvalidCodeObject("empty handler name"));
        }
        if config.code_snippet.is_empty() {
            return Err(UdfError::InvalidCodeObject("empty code snippet"));
        }
        let _w = self.write.lock().unwrap();
        if let Some(cur) = self.active.load_full() {
            if config.logical_commit_time < cur.logical_commit_time {
                counter!("udf_stale_configs_total", 1u64);
                warn!(
                    incoming = config.logical_commit_time,
                    active = cur.logical_commit_time,
                    "udf: older code object ignored"
                );
                return Ok(false);
            }
        }
        self.active.store(Some(Arc::new(config.clone())));
        info!(handler = %config.handler_name, ts = config.logical_commit_time, "udf: code object updated");
        Ok(true)
    }
}

/// Host hook exposed to UDF code for logging a string. Returns an empty
/// string since the runtime requires a return value.
pub fn log_message(input: &str) -> String {
    info!(target: "udf", message = %input, "udf: log");
    String::new()
}
