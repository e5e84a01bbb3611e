//! kvload core types: file identity, data records, shard planning and errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod constants;
mod error;
mod file_name;

pub use error::{DecodeError, LoadError, LoadResult};
pub use file_name::{FileDescriptor, FileKind};

pub mod prelude {
    pub use super::{
        DataRecord, DataRecordType, DecodeError, FileDescriptor, FileKind, KeyValueMutationRecord, LoadError,
        MutationType, ShardFilter, ShardPlanner, UdfLanguage, UserDefinedFunctionsConfigRecord, Value,
    };
}

/// Ordered values of a `string_set` mutation. Empty segments are kept.
pub type StringSet = SmallVec<[String; 4]>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Value {
    String(String),
    StringSet(StringSet),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MutationType {
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueMutationRecord {
    pub key: String,
    pub value: Value,
    pub logical_commit_time: i64,
    pub mutation_type: MutationType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UdfLanguage {
    Javascript,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserDefinedFunctionsConfigRecord {
    pub code_snippet: String,
    pub handler_name: String,
    pub logical_commit_time: i64,
    pub language: UdfLanguage,
}

/// One decoded mutation. `logical_commit_time` decides conflicts, not arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataRecord {
    KeyValueMutation(KeyValueMutationRecord),
    UdfConfig(UserDefinedFunctionsConfigRecord),
}

impl DataRecord {
    pub fn logical_commit_time(&self) -> i64 {
        match self {
            DataRecord::KeyValueMutation(r) => r.logical_commit_time,
            DataRecord::UdfConfig(r) => r.logical_commit_time,
        }
    }

    pub fn record_type(&self) -> DataRecordType {
        match self {
            DataRecord::KeyValueMutation(_) => DataRecordType::KeyValueMutation,
            DataRecord::UdfConfig(_) => DataRecordType::UdfConfig,
        }
    }
}

/// Declared type of a row, chosen by the reader before decoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataRecordType {
    KeyValueMutation,
    UdfConfig,
}

// ---- sharding ----

/// Maps a key onto one of `num_shards` partitions.
pub trait ShardPlanner: Send + Sync {
    fn num_shards(&self) -> u32;
    fn shard_for(&self, key: &str) -> u32;
}

/// 64-bit FNV-1a over the key bytes.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Default planner: FNV-1a of the key modulo the shard count.
///
/// Every node in a fleet must use the same function, so this is the only
/// planner the loader constructs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModuloKeyPlanner { num_shards: u32 }

impl ModuloKeyPlanner {
    pub fn new(num_shards: u32) -> Self {
        Self { num_shards: num_shards.max(1) }
    }
}

impl ShardPlanner for ModuloKeyPlanner {
    fn num_shards(&self) -> u32 { self.num_shards }

    fn shard_for(&self, key: &str) -> u32 {
        if self.num_shards <= 1 {
            return 0;
        }
        (fnv1a64(key.as_bytes()) % self.num_shards as u64) as u32
    }
}

/// Decides whether a record is this node's responsibility.
#[derive(Debug, Clone, Copy)]
pub struct ShardFilter {
    shard_num: u32,
    planner: ModuloKeyPlanner,
}

impl ShardFilter {
    pub fn new(shard_num: u32, num_shards: u32) -> LoadResult<Self> {
        if num_shards == 0 {
            return Err(LoadError::InvalidOptions("num_shards must be at least 1".into()));
        }
        if shard_num >= num_shards {
            return Err(LoadError::InvalidOptions(format!(
                "shard_num {} out of range for {} shards",
                shard_num, num_shards
            )));
        }
        Ok(Self { shard_num, planner: ModuloKeyPlanner::new(num_shards) })
    }

    pub fn shard_num(&self) -> u32 { self.shard_num }
    pub fn num_shards(&self) -> u32 { self.planner.num_shards() }

    pub fn owns_key(&self, key: &str) -> bool {
        self.planner.shard_for(key) == self.shard_num
    }

    /// UDF configs are never sharded; they apply on every node.
    pub fn accepts(&self, record: &DataRecord) -> bool {
        match record {
            DataRecord::KeyValueMutation(r) => self.owns_key(&r.key),
            DataRecord::UdfConfig(_) => true,
        }
    }
}
