//! Root watcher: the only thing that keeps cached entries coherent

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use common::kv::{normalize_path, parent_path};
use common::{KvStore, NodeChange, Operation};

use super::{listing_cache_key, node_cache_key, Inner, KvFs};

impl<S: KvStore> KvFs<S> {
    /// Apply one observed change
    ///
    /// Records or forgets the change time, then drops the node entry for the
    /// path and the listing entry of its parent. Nothing else is touched.
    pub fn apply_change(&self, change: &NodeChange) {
        let path = normalize_path(&change.node.path);
        tracing::debug!(path = %path, operation = ?change.operation, "applying change");

        match change.operation {
            Operation::Changed => {
                self.inner
                    .node_changes
                    .write()
                    .insert(path.clone(), SystemTime::now());
            }
            Operation::Deleted => {
                self.inner.node_changes.write().remove(&path);
            }
            Operation::Unknown => {}
        }

        self.invalidate(&path);
    }

    /// Drop the cached node at `path` and the cached listing of its parent
    pub fn invalidate(&self, path: &str) {
        let node_key = node_cache_key(path);
        let listing_key = listing_cache_key(&parent_path(path));
        tracing::trace!(node_key = %node_key, listing_key = %listing_key, "invalidating");
        let mut generation = self.inner.generation.lock();
        *generation += 1;
        self.inner.cache.delete(&node_key);
        self.inner.cache.delete(&listing_key);
    }
}

/// Drain the root watch until the driver closes the channel or the
/// filesystem goes away
pub(super) async fn run<S: KvStore>(inner: Weak<Inner<S>>, updates: flume::Receiver<NodeChange>) {
    while let Ok(change) = updates.recv_async().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        KvFs::from_inner(inner).apply_change(&change);
    }
    tracing::debug!("root watcher exited");
}

impl<S> KvFs<S> {
    fn from_inner(inner: Arc<Inner<S>>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::testkit::MemoryStore;
    use common::Node;

    use super::super::CachedData;
    use super::*;

    fn seeded_fs() -> KvFs<MemoryStore> {
        let fs = KvFs::new(MemoryStore::new());
        for path in ["/app", "/app/db", "/app/db/host", "/other"] {
            fs.cache().set(
                node_cache_key(path),
                CachedData::Node(Node::directory(path)),
                Duration::ZERO,
            );
            fs.cache().set(
                listing_cache_key(path),
                CachedData::Listing(Vec::new()),
                Duration::ZERO,
            );
        }
        fs
    }

    #[test]
    fn test_invalidates_node_and_parent_listing_only() {
        let fs = seeded_fs();
        fs.apply_change(&NodeChange::changed(Node::file("/app/db/host", "x")));

        assert!(!fs.cache().exists(&node_cache_key("/app/db/host")));
        assert!(!fs.cache().exists(&listing_cache_key("/app/db")));

        assert!(fs.cache().exists(&listing_cache_key("/app/db/host")));
        assert!(fs.cache().exists(&node_cache_key("/app/db")));
        assert!(fs.cache().exists(&node_cache_key("/app")));
        assert!(fs.cache().exists(&listing_cache_key("/app")));
        assert!(fs.cache().exists(&node_cache_key("/other")));
        assert_eq!(fs.cache().len(), 6);
    }

    #[test]
    fn test_change_times() {
        let fs = KvFs::new(MemoryStore::new());
        assert!(fs.changed_at("/k").is_none());

        fs.apply_change(&NodeChange::changed(Node::file("/k", "v")));
        assert!(fs.changed_at("/k").is_some());

        fs.apply_change(&NodeChange::deleted("/k"));
        assert!(fs.changed_at("/k").is_none());
    }

    #[test]
    fn test_invalidation_is_idempotent() {
        let fs = seeded_fs();
        let change = NodeChange::changed(Node::file("/app/db/host", "x"));
        fs.apply_change(&change);
        fs.apply_change(&change);
        assert_eq!(fs.cache().len(), 6);
    }

    #[test]
    fn test_top_level_change_drops_root_listing() {
        let fs = KvFs::new(MemoryStore::new());
        fs.cache().set(
            listing_cache_key("/"),
            CachedData::Listing(Vec::new()),
            Duration::ZERO,
        );
        fs.apply_change(&NodeChange::changed(Node::file("/top", "v")));
        assert!(fs.cache().is_empty());
    }
}
