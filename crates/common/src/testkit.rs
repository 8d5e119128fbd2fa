//! In-memory `KvStore` for tests of code that sits on top of a backend
//!
//! Behaves like etcd: directories are real nodes, created implicitly by
//! writes beneath them, and watches report `Changed` for writes and `Deleted`
//! for removals.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::kv::{
    normalize_path, parent_path, KvError, KvStore, Node, NodeChange, WatchHandle,
};

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    watchers: Vec<(String, flume::Sender<NodeChange>)>,
}

/// Shared in-memory key-value tree
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

fn is_beneath(path: &str, prefix: &str) -> bool {
    prefix == "/" || path == prefix || path.starts_with(&format!("{}/", prefix))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `(path, value)` leaves
    pub fn with_entries(entries: &[(&str, &str)]) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for (path, value) in entries {
                let path = normalize_path(path);
                Self::insert(&mut inner, &path, Node::file(path.clone(), *value));
            }
        }
        store
    }

    /// Make every subsequent call fail with `KvError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get` and `list` calls served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of live watch subscriptions
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|(_, tx)| !tx.is_disconnected());
        inner.watchers.len()
    }

    /// Mutate the tree as an outside writer would, notifying watchers
    pub fn put(&self, path: &str, value: &str) {
        let path = normalize_path(path);
        let mut inner = self.inner.lock();
        Self::insert(&mut inner, &path, Node::file(path.clone(), value));
        Self::notify(&mut inner, NodeChange::changed(Node::file(path, value)));
    }

    /// Remove a subtree as an outside writer would, notifying watchers
    pub fn remove(&self, path: &str) {
        let path = normalize_path(path);
        let mut inner = self.inner.lock();
        inner.nodes.retain(|key, _| !is_beneath(key, &path));
        Self::notify(&mut inner, NodeChange::deleted(path));
    }

    fn check(&self) -> Result<(), KvError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(KvError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn insert(inner: &mut Inner, path: &str, node: Node) {
        let mut parent = parent_path(path);
        while parent != "/" {
            inner
                .nodes
                .entry(parent.clone())
                .or_insert_with(|| Node::directory(parent.clone()));
            parent = parent_path(&parent);
        }
        inner.nodes.insert(path.to_string(), node);
    }

    fn notify(inner: &mut Inner, change: NodeChange) {
        inner.watchers.retain(|(prefix, tx)| {
            if !is_beneath(&change.node.path, prefix) {
                return !tx.is_disconnected();
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Node, KvError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Node::directory("/"));
        }
        self.inner
            .lock()
            .nodes
            .get(&path)
            .cloned()
            .ok_or(KvError::NotFound(path))
    }

    async fn list(&self, path: &str) -> Result<Vec<Node>, KvError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let path = normalize_path(path);
        let inner = self.inner.lock();
        if path != "/" {
            match inner.nodes.get(&path) {
                None => return Err(KvError::NotFound(path)),
                Some(node) if node.is_file() => return Err(KvError::NotADirectory(path)),
                Some(_) => {}
            }
        }
        Ok(inner
            .nodes
            .values()
            .filter(|node| parent_path(&node.path) == path && node.path != "/")
            .cloned()
            .collect())
    }

    async fn set(&self, path: &str, value: &str) -> Result<(), KvError> {
        self.check()?;
        self.put(path, value);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), KvError> {
        self.check()?;
        let path = normalize_path(path);
        let mut inner = self.inner.lock();
        match inner.nodes.get(&path) {
            None => return Err(KvError::NotFound(path)),
            Some(node) if node.is_dir() => {
                return Err(KvError::Status {
                    status: 403,
                    message: format!("{} is a directory", path),
                })
            }
            Some(_) => {}
        }
        inner.nodes.remove(&path);
        Self::notify(&mut inner, NodeChange::deleted(path));
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> Result<(), KvError> {
        self.check()?;
        self.remove(path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), KvError> {
        self.check()?;
        let path = normalize_path(path);
        let mut inner = self.inner.lock();
        Self::insert(&mut inner, &path, Node::directory(path.clone()));
        Ok(())
    }

    async fn watch(
        &self,
        path: &str,
        updates: flume::Sender<NodeChange>,
    ) -> Result<WatchHandle, KvError> {
        self.check()?;
        let path = normalize_path(path);
        let (tx, rx) = flume::unbounded();
        self.inner.lock().watchers.push((path.clone(), tx));

        Ok(WatchHandle::spawn(path, move |stop| async move {
            loop {
                let change = tokio::select! {
                    _ = stop.recv_async() => break,
                    change = rx.recv_async() => match change {
                        Ok(change) => change,
                        Err(_) => break,
                    },
                };
                if updates.send_async(change).await.is_err() {
                    break;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Operation;

    #[tokio::test]
    async fn test_implicit_directories() {
        let store = MemoryStore::with_entries(&[("/app/db/host", "10.0.0.1"), ("/top", "x")]);

        assert!(store.get("/app").await.unwrap().is_dir());
        assert!(store.get("/app/db").await.unwrap().is_dir());

        let root = store.list("/").await.unwrap();
        let paths: Vec<_> = root.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["/app", "/top"]);

        assert!(matches!(
            store.list("/top").await.unwrap_err(),
            KvError::NotADirectory(_)
        ));
    }

    #[tokio::test]
    async fn test_watch_receives_changes() {
        let store = MemoryStore::new();
        let (tx, rx) = flume::unbounded();
        let handle = store.watch("/app", tx).await.unwrap();

        store.put("/other", "ignored");
        store.put("/app/key", "v");
        store.delete("/app/key").await.unwrap();

        let first = rx.recv_async().await.unwrap();
        assert_eq!(first, NodeChange::changed(Node::file("/app/key", "v")));
        let second = rx.recv_async().await.unwrap();
        assert_eq!(second, NodeChange::deleted("/app/key"));

        handle.stop().await;
        assert_eq!(store.watcher_count(), 0);
    }
    async fn write_then_read<S: KvStore>(store: &S) {
        for (path, value) in [("/a", "1"), ("/nested/b", "two"), ("/nested/deeper/c", "")] {
            store.set(path, value).await.unwrap();
            assert_eq!(store.get(path).await.unwrap(), Node::file(path, value));
        }

        store.set("/a", "overwritten").await.unwrap();
        assert_eq!(store.get("/a").await.unwrap().value, "overwritten");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        write_then_read(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_list_is_one_level() {
        let store = MemoryStore::with_entries(&[("/x/y/z", "deep"), ("/x/w", "leaf")]);

        let children = store.list("/x").await.unwrap();
        assert_eq!(children, vec![Node::file("/x/w", "leaf"), Node::directory("/x/y")]);
    }

    #[tokio::test]
    async fn test_errors_are_not_wrapped() {
        let store = MemoryStore::with_entries(&[("/leaf", "v")]);

        assert!(matches!(
            store.get("/nope").await.unwrap_err(),
            KvError::NotFound(ref p) if p == "/nope"
        ));
        assert!(matches!(
            store.list("/leaf").await.unwrap_err(),
            KvError::NotADirectory(_)
        ));

        store.set_unavailable(true);
        let err = store.get("/leaf").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_path_takes_subtree() {
        let store =
            MemoryStore::with_entries(&[("/app/a", "1"), ("/app/b/c", "2"), ("/apple", "3")]);

        store.remove_path("/app").await.unwrap();
        assert!(store.get("/app").await.unwrap_err().is_not_found());
        assert!(store.get("/app/b/c").await.unwrap_err().is_not_found());
        assert_eq!(store.get("/apple").await.unwrap().value, "3");
    }

    #[tokio::test]
    async fn test_watch_stream_until_stopped() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let store = MemoryStore::new();
        let (tx, rx) = flume::unbounded();
        let handle = store.watch("/", tx).await.unwrap();
        assert_eq!(handle.path(), "/");

        store.set("/k", "v").await.unwrap();
        store.delete("/k").await.unwrap();

        assert_eq!(rx.recv_async().await.unwrap().operation, Operation::Changed);
        let deleted = rx.recv_async().await.unwrap();
        assert_eq!(deleted.operation, Operation::Deleted);
        assert_eq!(deleted.node.path, "/k");

        handle.stop().await;
        store.set("/k", "again").await.unwrap();
        let after =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv_async()).await;
        assert!(!matches!(after, Ok(Ok(_))));
    }
}
