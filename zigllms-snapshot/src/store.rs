//! ABOUTME: SnapshotStore - bounded-count/bounded-size snapshot retention with oldest-first eviction (§3)
//! ABOUTME: Grounded on StatePool's own bounded Mutex<Vec<_>> shape rather than the teacher's full retention-policy framework

use crate::snapshot::{Snapshot, SnapshotId};
use parking_lot::Mutex;

/// Caps for a `SnapshotStore` (§3: "holds at most `max_snapshots` snapshots
/// whose total size ≤ `max_snapshot_size_bytes`").
#[derive(Debug, Clone, Copy)]
pub struct SnapshotStoreConfig {
    pub max_snapshots: usize,
    pub max_snapshot_size_bytes: u64,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 16,
            max_snapshot_size_bytes: 64 * 1024 * 1024,
        }
    }
}

struct StoreInner {
    snapshots: Vec<Snapshot>,
    total_size: u64,
}

/// Per-`ManagedState` store of snapshots, insertion-ordered so eviction can
/// always drop index 0 (§4.9/§4.12: "on overflow it evicts oldest first").
pub struct SnapshotStore {
    config: SnapshotStoreConfig,
    inner: Mutex<StoreInner>,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(config: SnapshotStoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(StoreInner { snapshots: Vec::new(), total_size: 0 }),
        }
    }

    /// Inserts `snapshot`, evicting the oldest entries first until both the
    /// count and total-size caps are satisfied. A single snapshot larger
    /// than `max_snapshot_size_bytes` is still accepted (there is nothing
    /// smaller to evict it in favor of) but immediately becomes the sole
    /// occupant, evicting everything else.
    pub fn insert(&self, snapshot: Snapshot) {
        let mut inner = self.inner.lock();
        inner.total_size += snapshot.size_bytes;
        inner.snapshots.push(snapshot);
        while inner.snapshots.len() > self.config.max_snapshots || inner.total_size > self.config.max_snapshot_size_bytes {
            if inner.snapshots.len() <= 1 {
                break;
            }
            let evicted = inner.snapshots.remove(0);
            inner.total_size = inner.total_size.saturating_sub(evicted.size_bytes);
        }
    }

    #[must_use]
    pub fn get(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.inner.lock().snapshots.iter().find(|s| &s.id == id).cloned()
    }

    pub fn remove(&self, id: &SnapshotId) -> Option<Snapshot> {
        let mut inner = self.inner.lock();
        let index = inner.snapshots.iter().position(|s| &s.id == id)?;
        let removed = inner.snapshots.remove(index);
        inner.total_size = inner.total_size.saturating_sub(removed.size_bytes);
        Some(removed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.inner.lock().total_size
    }

    /// Ids of every snapshot currently held, oldest first.
    #[must_use]
    pub fn ids(&self) -> Vec<SnapshotId> {
        self.inner.lock().snapshots.iter().map(|s| s.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn stub_snapshot(id: &str, size_bytes: u64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            created_at: SystemTime::now(),
            metadata: HashMap::new(),
            globals: Vec::new(),
            serialized_registry_subset: Vec::new(),
            gc_state_hints: crate::snapshot::GcStateHints { memory_bytes_at_snapshot: 0 },
            checksum: 0,
            size_bytes,
        }
    }

    #[test]
    fn evicts_oldest_when_count_exceeded() {
        let store = SnapshotStore::new(SnapshotStoreConfig { max_snapshots: 2, max_snapshot_size_bytes: u64::MAX });
        store.insert(stub_snapshot("a", 10));
        store.insert(stub_snapshot("b", 10));
        store.insert(stub_snapshot("c", 10));
        assert_eq!(store.ids(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn evicts_oldest_when_size_exceeded() {
        let store = SnapshotStore::new(SnapshotStoreConfig { max_snapshots: 100, max_snapshot_size_bytes: 25 });
        store.insert(stub_snapshot("a", 10));
        store.insert(stub_snapshot("b", 10));
        store.insert(stub_snapshot("c", 10));
        assert_eq!(store.ids(), vec!["b".to_string(), "c".to_string()]);
        assert!(store.total_size_bytes() <= 25);
    }

    #[test]
    fn get_and_remove_operate_by_id() {
        let store = SnapshotStore::new(SnapshotStoreConfig::default());
        store.insert(stub_snapshot("a", 5));
        assert!(store.get(&"a".to_string()).is_some());
        let removed = store.remove(&"a".to_string()).unwrap();
        assert_eq!(removed.id, "a");
        assert!(store.is_empty());
    }
}
