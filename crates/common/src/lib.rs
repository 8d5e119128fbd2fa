//! Core building blocks for confstore
//!
//! This crate holds everything that does not depend on a mounted filesystem:
//! the key-value data model, the backend contract every driver satisfies,
//! the etcd and Consul drivers, and the TTL cache the filesystem layer
//! memoizes backend reads in.

pub mod cache;
pub mod kv;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use cache::CacheStore;
pub use kv::{
    Backend, BackendConfig, BackendKind, KvError, KvStore, Node, NodeChange, NodeType, Operation,
    WatchHandle,
};
