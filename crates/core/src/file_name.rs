//! Bucket object names as a totally ordered mutation log.
//!
//! A name is `<KIND>_<16 digits>`, e.g. `DELTA_1659978505000000`. Only the
//! numeric order of the digits matters; a larger number is a more recent file.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DELTA_FILE_PREFIX, FILE_COMPONENT_DELIMITER, FILE_NAME_RE, MAX_LOGICAL_TIMESTAMP, SNAPSHOT_FILE_PREFIX,
};
use crate::error::{LoadError, LoadResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileKind {
    Snapshot,
    Delta,
}

impl FileKind {
    pub fn prefix(self) -> &'static str {
        match self {
            FileKind::Snapshot => SNAPSHOT_FILE_PREFIX,
            FileKind::Delta => DELTA_FILE_PREFIX,
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            SNAPSHOT_FILE_PREFIX => Some(FileKind::Snapshot),
            DELTA_FILE_PREFIX => Some(FileKind::Delta),
            _ => None,
        }
    }
}

/// Parsed identity of a snapshot or delta file.
///
/// Descriptors of the same kind order by timestamp. Descriptors of different
/// kinds are not comparable (`partial_cmp` returns `None`); mixing them is
/// only meaningful against a watermark, see [`FileDescriptor::is_newer_than`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileDescriptor {
    kind: FileKind,
    logical_timestamp: u64,
}

impl FileDescriptor {
    pub fn new(kind: FileKind, logical_timestamp: u64) -> LoadResult<Self> {
        if logical_timestamp > MAX_LOGICAL_TIMESTAMP {
            return Err(LoadError::MalformedName {
                name: format!("{}{}{}", kind.prefix(), FILE_COMPONENT_DELIMITER, logical_timestamp),
                reason: "logical time does not fit in 16 digits",
            });
        }
        Ok(Self { kind, logical_timestamp })
    }

    /// Parse a file basename.
    pub fn parse(name: &str) -> LoadResult<Self> {
        let caps = FILE_NAME_RE.captures(name).ok_or_else(|| LoadError::MalformedName {
            name: name.to_string(),
            reason: "expected <KIND>_ followed by exactly 16 decimal digits",
        })?;
        let kind_str = &caps["kind"];
        let kind = FileKind::from_prefix(kind_str).ok_or_else(|| LoadError::UnknownKind {
            name: name.to_string(),
            kind: kind_str.to_string(),
        })?;
        // 16 ASCII digits always fit in u64
        let logical_timestamp = caps["ts"].parse::<u64>().map_err(|_| LoadError::MalformedName {
            name: name.to_string(),
            reason: "logical time is not a number",
        })?;
        Ok(Self { kind, logical_timestamp })
    }

    /// Parse a full object name; only the part after the last `/` is the file name.
    pub fn parse_object_name(object_name: &str) -> LoadResult<Self> {
        let base = object_name.rsplit('/').next().unwrap_or(object_name);
        Self::parse(base)
    }

    pub fn kind(&self) -> FileKind { self.kind }
    pub fn logical_timestamp(&self) -> u64 { self.logical_timestamp }
    pub fn is_snapshot(&self) -> bool { self.kind == FileKind::Snapshot }
    pub fn is_delta(&self) -> bool { self.kind == FileKind::Delta }

    /// Watermark rule: a file is worth applying only when strictly newer.
    pub fn is_newer_than(&self, watermark: u64) -> bool {
        self.logical_timestamp > watermark
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:0width$}",
            self.kind.prefix(),
            FILE_COMPONENT_DELIMITER,
            self.logical_timestamp,
            width = crate::constants::LOGICAL_TIME_DIGITS
        )
    }
}

impl FromStr for FileDescriptor {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl PartialOrd for FileDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.kind != other.kind {
            return None;
        }
        Some(self.logical_timestamp.cmp(&other.logical_timestamp))
    }
}
