use thiserror::Error;

/// A single row could not be turned into a `DataRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode error in column {column:?}: {reason}")]
pub struct DecodeError {
    pub column: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { column: column.into(), reason: reason.into() }
    }
}

/// Errors raised while loading data into the cache and UDF client.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("malformed file name {name:?}: {reason}")]
    MalformedName { name: String, reason: &'static str },
    #[error("unknown file kind {kind:?} in {name:?}")]
    UnknownKind { name: String, kind: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("transport: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("udf: {0}")]
    Udf(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl LoadError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), source: None }
    }

    /// Name-level failures are skipped during listings; everything else is not.
    pub fn is_file_name_error(&self) -> bool {
        matches!(self, Self::MalformedName { .. } | Self::UnknownKind { .. })
    }
}

pub type LoadResult<T> = Result<T, LoadError>;
