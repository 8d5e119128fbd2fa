//! Filesystem translation layer
//!
//! Turns path-based filesystem requests into key-value lookups, memoizing
//! every backend read in a [`CacheStore`] that only the root watcher
//! invalidates.
//!
//! # Architecture
//!
//! - `KvFs`: one mounted namespace; resolves attributes, directory listings
//!   and unlinks, and owns the root watch
//! - `KvFile`: handle returned by `open`, serving reads through the node cache
//! - `FsStatus`: the small failure vocabulary every request reports
//! - watcher: applies `NodeChange` events to the cache and the change-time map
//!
//! # Cache keys
//!
//! Single-node lookups and directory listings live in the same cache under
//! distinct suffixes (`/app-node`, `/app-list`), so a node and a listing at
//! one path never collide and are invalidated independently.

mod attr;
mod file;
mod status;
mod watcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use common::kv::normalize_path;
use common::{Backend, CacheStore, KvError, KvStore, Node, WatchHandle};

pub use attr::{DirEntry, NodeAttr, DIR_PERM, FILE_PERM};
pub use file::KvFile;
pub use status::FsStatus;

pub const NODE_KEY_SUFFIX: &str = "-node";
pub const LISTING_KEY_SUFFIX: &str = "-list";

/// Cache key of the single node at `path`
pub fn node_cache_key(path: &str) -> String {
    format!("{}{}", normalize_path(path), NODE_KEY_SUFFIX)
}

/// Cache key of the children listing of `path`
pub fn listing_cache_key(path: &str) -> String {
    format!("{}{}", normalize_path(path), LISTING_KEY_SUFFIX)
}

/// What a cache entry holds, told apart by its key suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedData {
    Node(Node),
    Listing(Vec<Node>),
}

/// Lifecycle of a mounted namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Created, root watch not yet established
    Initializing,
    /// Root watch running; cache entries are kept coherent
    Watching,
    /// Terminal; the root watch has been stopped
    Unmounting,
}

struct ActiveWatch {
    handle: WatchHandle,
    watcher: JoinHandle<()>,
}

struct Inner<S> {
    store: S,
    cache: CacheStore<CachedData>,
    /// Path -> time of the last change the watcher saw
    node_changes: RwLock<HashMap<String, SystemTime>>,
    started_at: SystemTime,
    state: RwLock<MountState>,
    /// Bumped by every invalidation; a fill that started under an older
    /// generation must not write back
    generation: Mutex<u64>,
    /// Serializes lifecycle transitions and owns the running watch
    active: tokio::sync::Mutex<Option<ActiveWatch>>,
}

/// A key-value namespace presented as a filesystem
pub struct KvFs<S = Backend> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for KvFs<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: KvStore> KvFs<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache: CacheStore::new(),
                node_changes: RwLock::new(HashMap::new()),
                started_at: SystemTime::now(),
                state: RwLock::new(MountState::Initializing),
                generation: Mutex::new(0),
                active: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn cache(&self) -> &CacheStore<CachedData> {
        &self.inner.cache
    }

    pub fn state(&self) -> MountState {
        *self.inner.state.read()
    }

    pub fn started_at(&self) -> SystemTime {
        self.inner.started_at
    }

    /// When the watcher last saw `path` change, if it has
    pub fn changed_at(&self, path: &str) -> Option<SystemTime> {
        self.inner
            .node_changes
            .read()
            .get(&normalize_path(path))
            .copied()
    }

    /// Resolve a node through the node cache, filling it from the backend
    pub async fn cached_node(&self, path: &str) -> Result<Node, KvError> {
        let key = node_cache_key(path);
        if let Some(CachedData::Node(node)) = self.inner.cache.get(&key) {
            return Ok(node);
        }

        let generation = *self.inner.generation.lock();
        let node = self.inner.store.get(path).await?;
        self.fill(generation, key, CachedData::Node(node.clone()));
        Ok(node)
    }

    /// Resolve a directory's children through the listing cache
    pub async fn cached_listing(&self, path: &str) -> Result<Vec<Node>, KvError> {
        let key = listing_cache_key(path);
        if let Some(CachedData::Listing(nodes)) = self.inner.cache.get(&key) {
            return Ok(nodes);
        }

        let generation = *self.inner.generation.lock();
        let nodes = self.inner.store.list(path).await?;
        self.fill(generation, key, CachedData::Listing(nodes.clone()));
        Ok(nodes)
    }

    /// Cache a backend read unless an invalidation ran while it was in flight
    fn fill(&self, generation: u64, key: String, data: CachedData) {
        let current = self.inner.generation.lock();
        if *current != generation {
            tracing::trace!(key = %key, "invalidated during fetch, not caching");
            return;
        }
        self.inner.cache.set(key, data, Duration::ZERO);
    }

    pub async fn get_attr(&self, path: &str) -> Result<NodeAttr, FsStatus> {
        let path = normalize_path(path);
        let started_at = self.inner.started_at;
        if path == "/" {
            return Ok(NodeAttr::root(started_at));
        }

        let node = self.cached_node(&path).await.map_err(|e| {
            if !e.is_not_found() {
                tracing::warn!(path = %path, "failed to resolve attributes: {}", e);
            }
            FsStatus::from(e)
        })?;
        let mtime = self.changed_at(&node.path).unwrap_or(started_at);
        Ok(NodeAttr::for_node(&node, started_at, mtime))
    }

    pub async fn open_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsStatus> {
        let path = normalize_path(path);
        tracing::trace!(path = %path, "open dir");
        let nodes = self.cached_listing(&path).await.map_err(|e| {
            match &e {
                KvError::NotFound(_) | KvError::NotADirectory(_) => {}
                _ => tracing::warn!(path = %path, "failed to list directory: {}", e),
            }
            FsStatus::from(e)
        })?;
        Ok(nodes.iter().map(DirEntry::from_node).collect())
    }

    /// Open a file for reading; the value is only fetched on read
    pub fn open(&self, path: &str) -> KvFile<S> {
        let path = normalize_path(path);
        tracing::trace!(path = %path, "open");
        KvFile::new(self.clone(), path)
    }

    /// Delete a leaf in the backend
    ///
    /// Every backend failure, whatever its cause, is reported as permission
    /// denied.
    pub async fn unlink(&self, path: &str) -> Result<(), FsStatus> {
        let path = normalize_path(path);
        tracing::debug!(path = %path, "unlink");
        self.inner.store.delete(&path).await.map_err(|e| {
            tracing::error!(path = %path, "failed to delete key: {}", e);
            FsStatus::PermissionDenied
        })
    }

    pub fn create(&self, path: &str) -> Result<(), FsStatus> {
        tracing::debug!(path = %path, "create refused");
        Err(FsStatus::PermissionDenied)
    }

    pub fn mkdir(&self, path: &str) -> Result<(), FsStatus> {
        tracing::debug!(path = %path, "mkdir refused");
        Err(FsStatus::PermissionDenied)
    }

    pub fn rmdir(&self, path: &str) -> Result<(), FsStatus> {
        tracing::debug!(path = %path, "rmdir refused");
        Err(FsStatus::PermissionDenied)
    }

    /// Open the root watch and start applying its changes
    ///
    /// Moves `Initializing -> Watching`. If the backend refuses the watch the
    /// state is left untouched and the error returned.
    pub async fn start_watching(&self) -> Result<(), KvError> {
        let mut active = self.inner.active.lock().await;
        let state = self.state();
        if state != MountState::Initializing {
            tracing::warn!(state = ?state, "start_watching called out of order, ignoring");
            return Ok(());
        }

        let (tx, rx) = flume::unbounded();
        let handle = self.inner.store.watch("/", tx).await.map_err(|e| {
            tracing::error!("unable to create a watch on root: {}", e);
            e
        })?;
        let watcher = tokio::spawn(watcher::run(Arc::downgrade(&self.inner), rx));

        *active = Some(ActiveWatch { handle, watcher });
        *self.inner.state.write() = MountState::Watching;
        tracing::info!("watching backend for changes");
        Ok(())
    }

    /// Stop the root watch and wait for both the driver loop and the watcher
    /// task to exit
    pub async fn unmount(&self) {
        let mut active = self.inner.active.lock().await;
        let state = self.state();
        if state != MountState::Watching {
            tracing::warn!(state = ?state, "unmount called out of order, ignoring");
            return;
        }

        *self.inner.state.write() = MountState::Unmounting;
        tracing::info!("unmounting, stopping root watch");
        if let Some(ActiveWatch { handle, watcher }) = active.take() {
            handle.stop().await;
            if let Err(e) = watcher.await {
                tracing::warn!("watcher task ended abnormally: {}", e);
            }
        }
    }
}
