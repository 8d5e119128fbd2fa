//! Key-value backend contract and drivers
//!
//! # Architecture
//!
//! - `KvStore`: the capability contract every backend satisfies
//! - `Backend`: the closed set of drivers a mount can select by url
//! - `EtcdStore`: etcd v2 keys API, recursive long-poll watches
//! - `ConsulStore`: Consul KV API, blocking queries with a wait index
//!
//! Both drivers push changes through the same `NodeChange` stream, so the
//! filesystem layer treats them as interchangeable.

mod config;
pub mod consul;
mod error;
pub mod etcd;
mod node;
mod watch;

use async_trait::async_trait;

pub use config::{
    BackendConfig, BackendKind, DEFAULT_BACKEND_URL, DEFAULT_CONSUL_DATACENTER,
    DEFAULT_CONSUL_WAIT, DEFAULT_RETRY_BACKOFF,
};
pub use consul::ConsulStore;
pub use error::KvError;
pub use etcd::EtcdStore;
pub use node::{normalize_path, parent_path, Node, NodeChange, NodeType, Operation};
pub use watch::WatchHandle;

/// Operations every key-value backend must provide
///
/// All paths are `/`-delimited. Errors come back untouched from the driver;
/// none of these calls retry.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Fetch one node, `KvError::NotFound` if absent
    async fn get(&self, path: &str) -> Result<Node, KvError>;

    /// Immediate children of a directory, `KvError::NotADirectory` for a leaf
    async fn list(&self, path: &str) -> Result<Vec<Node>, KvError>;

    /// Write or overwrite a leaf
    async fn set(&self, path: &str, value: &str) -> Result<(), KvError>;

    /// Remove a single leaf
    async fn delete(&self, path: &str) -> Result<(), KvError>;

    /// Remove a path and everything beneath it
    async fn remove_path(&self, path: &str) -> Result<(), KvError>;

    /// Create an empty directory node
    async fn mkdir(&self, path: &str) -> Result<(), KvError>;

    /// Subscribe to every change beneath `path`
    ///
    /// Changes are pushed on `updates` until the returned handle is stopped or
    /// dropped, or the receiving end goes away. Transport failures inside the
    /// loop are retried with backoff and never reach the caller.
    async fn watch(
        &self,
        path: &str,
        updates: flume::Sender<NodeChange>,
    ) -> Result<WatchHandle, KvError>;
}

/// The backend selected for a mount
#[derive(Debug, Clone)]
pub enum Backend {
    Etcd(EtcdStore),
    Consul(ConsulStore),
}

impl Backend {
    /// Build the driver the configured url selects
    pub fn from_config(config: &BackendConfig) -> Result<Self, KvError> {
        tracing::info!(url = %config.url, "creating key-value backend");
        match config.kind()? {
            BackendKind::Etcd { endpoints } => Ok(Backend::Etcd(EtcdStore::connect(
                endpoints, config,
            )?)),
            BackendKind::Consul { address } => Ok(Backend::Consul(ConsulStore::connect(
                address, config,
            )?)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Etcd(_) => "etcd",
            Backend::Consul(_) => "consul",
        }
    }
}

#[async_trait]
impl KvStore for Backend {
    async fn get(&self, path: &str) -> Result<Node, KvError> {
        match self {
            Backend::Etcd(store) => store.get(path).await,
            Backend::Consul(store) => store.get(path).await,
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<Node>, KvError> {
        match self {
            Backend::Etcd(store) => store.list(path).await,
            Backend::Consul(store) => store.list(path).await,
        }
    }

    async fn set(&self, path: &str, value: &str) -> Result<(), KvError> {
        match self {
            Backend::Etcd(store) => store.set(path, value).await,
            Backend::Consul(store) => store.set(path, value).await,
        }
    }

    async fn delete(&self, path: &str) -> Result<(), KvError> {
        match self {
            Backend::Etcd(store) => store.delete(path).await,
            Backend::Consul(store) => store.delete(path).await,
        }
    }

    async fn remove_path(&self, path: &str) -> Result<(), KvError> {
        match self {
            Backend::Etcd(store) => store.remove_path(path).await,
            Backend::Consul(store) => store.remove_path(path).await,
        }
    }

    async fn mkdir(&self, path: &str) -> Result<(), KvError> {
        match self {
            Backend::Etcd(store) => store.mkdir(path).await,
            Backend::Consul(store) => store.mkdir(path).await,
        }
    }

    async fn watch(
        &self,
        path: &str,
        updates: flume::Sender<NodeChange>,
    ) -> Result<WatchHandle, KvError> {
        match self {
            Backend::Etcd(store) => store.watch(path, updates).await,
            Backend::Consul(store) => store.watch(path, updates).await,
        }
    }
}
