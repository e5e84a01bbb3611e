//! kvload cache: the apply contract the loader writes through, plus an
//! in-memory last-write-wins implementation.

#![forbid(unsafe_code)]

use std::sync::RwLock;

use kvload_core::{KeyValueMutationRecord, MutationType, Value};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

pub mod udf;

pub use udf::{InMemoryUdfClient, UdfClient, UdfError};

/// Serving cache as seen by the loader. Shared by every ingestion context,
/// so implementations must accept concurrent calls.
///
/// The visible state of a key is always the mutation with the greatest
/// `logical_commit_time` seen so far, whatever order calls arrive in.
pub trait Cache: Send + Sync {
    /// Returns false when the mutation lost to a newer one already stored.
    fn apply(&self, record: &KeyValueMutationRecord) -> bool;

    /// Forget delete markers at or below `logical_commit_time`. Afterwards a
    /// mutation at or below that time for a key the cache does not hold is
    /// treated as stale.
    fn remove_deleted_keys(&self, _logical_commit_time: i64) {}
}

#[derive(Debug, Clone)]
enum Slot {
    Live { value: Value, commit: i64 },
    /// Kept so an older update arriving late cannot resurrect the key.
    Deleted { commit: i64 },
}

impl Slot {
    fn commit(&self) -> i64 {
        match self {
            Slot::Live { commit, .. } | Slot::Deleted { commit } => *commit,
        }
    }
}

#[derive(Default)]
struct Inner {
    map: FxHashMap<String, Slot>,
    /// Highest cutoff passed to `remove_deleted_keys`. A key with no slot may
    /// have lost its tombstone, so mutations at or below this are stale.
    max_cleanup_commit_time: Option<i64>,
}

/// Hash map cache. Updates need a strictly newer commit time; deletes win ties.
#[derive(Default)]
pub struct InMemoryCache {
    inner: RwLock<Inner>,
}

impl InMemoryCache {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.read().unwrap();
        match inner.map.get(key) {
            Some(Slot::Live { value, .. }) => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().map.values().filter(|s| matches!(s, Slot::Live { .. })).count()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Copy of every live key and value, unordered.
    pub fn entries(&self) -> Vec<(String, Value)> {
        let inner = self.inner.read().unwrap();
        inner
            .map
            .iter()
            .filter_map(|(k, s)| match s {
                Slot::Live { value, .. } => Some((k.clone(), value.clone())),
                Slot::Deleted { .. } => None,
            })
            .collect()
    }

    pub fn tombstones(&self) -> usize {
        self.inner.read().unwrap().map.values().filter(|s| matches!(s, Slot::Deleted { .. })).count()
    }
}

impl Cache for InMemoryCache {
    fn apply(&self, record: &KeyValueMutationRecord) -> bool {
        let mut inner = self.inner.write().unwrap();
        let stored = inner.map.get(&record.key).map(Slot::commit);
        let ts = record.logical_commit_time;
        let wins = match (record.mutation_type, stored) {
            (_, None) => inner.max_cleanup_commit_time.map_or(true, |cutoff| ts > cutoff),
            (MutationType::Update, Some(cur)) => ts > cur,
            (MutationType::Delete, Some(cur)) => ts >= cur,
        };
        if !wins {
            counter!("cache_stale_mutations_total", 1u64);
            debug!(key = %record.key, ts, stored = ?stored, "cache: stale mutation ignored");
            return false;
        }
        let slot = match record.mutation_type {
            MutationType::Update => Slot::Live { value: record.value.clone(), commit: ts },
            MutationType::Delete => Slot::Deleted { commit: ts },
        };
        inner.map.insert(record.key.clone(), slot);
        true
    }

    fn remove_deleted_keys(&self, logical_commit_time: i64) {
        let mut inner = self.inner.write().unwrap();
        inner.max_cleanup_commit_time =
            Some(inner.max_cleanup_commit_time.map_or(logical_commit_time, |c| c.max(logical_commit_time)));
        let before = inner.map.len();
        inner.map.retain(|_, s| !matches!(s, Slot::Deleted { commit } if *commit <= logical_commit_time));
        let removed = before - inner.map.len();
        if removed > 0 {
            debug!(removed, logical_commit_time, "cache: tombstones removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: &str, value: &str, ts: i64, mutation_type: MutationType) -> KeyValueMutationRecord {
        KeyValueMutationRecord {
            key: key.into(),
            value: Value::String(value.into()),
            logical_commit_time: ts,
            mutation_type,
        }
    }

    #[test]
    fn newer_update_wins_in_either_order() {
        let older = rec("a", "1", 100, MutationType::Update);
        let newer = rec("a", "2", 200, MutationType::Update);
        for order in [[&older, &newer], [&newer, &older]] {
            let cache = InMemoryCache::new();
            for r in order {
                cache.apply(r);
            }
            assert_eq!(cache.get("a"), Some(Value::String("2".into())));
        }
    }

    #[test]
    fn delete_then_stale_update_stays_deleted() {
        let cache = InMemoryCache::new();
        assert!(cache.apply(&rec("a", "1", 100, MutationType::Update)));
        assert!(cache.apply(&rec("a", "", 150, MutationType::Delete)));
        assert!(!cache.apply(&rec("a", "late", 120, MutationType::Update)));
        assert_eq!(cache.get("a"), None);
        assert!(cache.apply(&rec("a", "back", 160, MutationType::Update)));
        assert_eq!(cache.get("a"), Some(Value::String("back".into())));
    }

    #[test]
    fn delete_wins_a_tie_update_does_not() {
        let cache = InMemoryCache::new();
        cache.apply(&rec("a", "1", 100, MutationType::Update));
        assert!(!cache.apply(&rec("a", "dup", 100, MutationType::Update)));
        assert!(cache.apply(&rec("a", "", 100, MutationType::Delete)));
        assert!(cache.is_empty());
    }

    #[test]
    fn tombstone_cleanup_respects_commit_time() {
        let cache = InMemoryCache::new();
        cache.apply(&rec("a", "", 100, MutationType::Delete));
        cache.apply(&rec("b", "", 300, MutationType::Delete));
        cache.remove_deleted_keys(200);
        assert_eq!(cache.tombstones(), 1);
    }

    #[test]
    fn entries_skip_tombstones() {
        let cache = InMemoryCache::new();
        cache.apply(&rec("a", "1", 100, MutationType::Update));
        cache.apply(&rec("b", "", 100, MutationType::Delete));
        let entries = cache.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a");
    }

    #[test]
    fn cleanup_cutoff_keeps_deleted_keys_deleted() {
        let cache = InMemoryCache::new();
        cache.apply(&rec("a", "1", 100, MutationType::Update));
        assert!(cache.apply(&rec("a", "", 150, MutationType::Delete)));
        cache.remove_deleted_keys(150);
        assert_eq!(cache.tombstones(), 0);
        assert!(!cache.apply(&rec("a", "old", 120, MutationType::Update)));
        assert!(!cache.apply(&rec("a", "tie", 150, MutationType::Update)));
        assert_eq!(cache.get("a"), None);
        assert!(cache.apply(&rec("a", "new", 151, MutationType::Update)));
        assert_eq!(cache.get("a"), Some(Value::String("new".into())));
    }

    #[test]
    fn cleanup_cutoff_never_moves_back() {
        let cache = InMemoryCache::new();
        cache.remove_deleted_keys(200);
        cache.remove_deleted_keys(50);
        assert!(!cache.apply(&rec("b", "x", 100, MutationType::Update)));
        assert!(cache.apply(&rec("b", "x", 201, MutationType::Update)));
    }
}
