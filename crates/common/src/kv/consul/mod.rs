//! Consul driver
//!
//! Consul keys carry no leading slash and have no first-class directories: a
//! key is a directory when other keys live beneath its prefix. Watches are
//! blocking queries keyed on the `X-Consul-Index` wait index. A response whose
//! index did not move is a long-poll timeout and is dropped; a moved index is
//! diffed against the previous snapshot so each touched key yields exactly one
//! `Changed` event. Consul does not report deletes through this primitive, so a
//! key that disappears is also reported as `Changed` and the next read finds it
//! gone.

mod client;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

pub use client::{BlockingQuery, ConsulApi, ConsulClient, KvPair, QueryMeta};

use super::watch::{backoff_or_stop, stop_requested};
use super::{normalize_path, BackendConfig, KvError, KvStore, Node, NodeChange, WatchHandle};

/// Consul-backed `KvStore`
#[derive(Debug)]
pub struct ConsulStore<A = ConsulClient> {
    api: Arc<A>,
    retry_backoff: Duration,
    wait: Duration,
}

impl<A> Clone for ConsulStore<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            retry_backoff: self.retry_backoff,
            wait: self.wait,
        }
    }
}

impl ConsulStore<ConsulClient> {
    pub fn connect(address: Url, config: &BackendConfig) -> Result<Self, KvError> {
        tracing::info!(
            address = %address,
            datacenter = %config.consul_datacenter,
            "creating consul client"
        );
        let api = ConsulClient::new(
            address,
            config.consul_datacenter.clone(),
            config.consul_token.clone(),
            config.request_timeout,
        )?;
        Ok(Self::with_api(api, config.retry_backoff, config.consul_wait))
    }
}

impl<A: ConsulApi> ConsulStore<A> {
    pub fn with_api(api: A, retry_backoff: Duration, wait: Duration) -> Self {
        Self {
            api: Arc::new(api),
            retry_backoff,
            wait,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }
}

/// Consul key for a path: no leading or trailing slash, empty for the root
fn consul_key(path: &str) -> String {
    normalize_path(path).trim_start_matches('/').to_string()
}

/// Prefix that selects everything strictly beneath `key`
fn child_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

fn node_from_pair(pair: &KvPair) -> Result<Node, KvError> {
    let path = normalize_path(&pair.key);
    if pair.is_folder() {
        Ok(Node::directory(path))
    } else {
        Ok(Node::file(path, pair.decoded_value()?))
    }
}

/// Fold a recursive listing under `prefix` into its immediate children
///
/// A name that is both a leaf and a prefix of deeper keys is a directory.
fn immediate_children(prefix: &str, pairs: &[KvPair]) -> Result<Vec<Node>, KvError> {
    let mut children: BTreeMap<String, Node> = BTreeMap::new();
    for pair in pairs {
        let Some(rel) = pair.key.strip_prefix(prefix) else {
            continue;
        };
        if rel.is_empty() {
            continue;
        }
        match rel.split_once('/') {
            Some((name, _)) => {
                let path = normalize_path(&format!("{}{}", prefix, name));
                children.insert(name.to_string(), Node::directory(path));
            }
            None => {
                if !children.contains_key(rel) {
                    children.insert(rel.to_string(), node_from_pair(pair)?);
                }
            }
        }
    }
    Ok(children.into_values().collect())
}

/// Changes between two snapshots of key → modify index
fn diff_snapshot(previous: &HashMap<String, u64>, pairs: &[KvPair]) -> Vec<NodeChange> {
    let mut changes = Vec::new();
    for pair in pairs {
        if previous.get(&pair.key) == Some(&pair.modify_index) {
            continue;
        }
        let node = node_from_pair(pair).unwrap_or_else(|e| {
            tracing::warn!(key = %pair.key, "undecodable consul value: {}", e);
            Node::file(normalize_path(&pair.key), "")
        });
        changes.push(NodeChange::changed(node));
    }

    let current: HashMap<&str, ()> = pairs.iter().map(|p| (p.key.as_str(), ())).collect();
    let mut removed: Vec<&String> = previous
        .keys()
        .filter(|key| !current.contains_key(key.as_str()))
        .collect();
    removed.sort();
    for key in removed {
        changes.push(NodeChange::changed(Node::file(normalize_path(key), "")));
    }
    changes
}

async fn run_watch<A: ConsulApi>(
    api: Arc<A>,
    prefix: String,
    updates: flume::Sender<NodeChange>,
    stop: flume::Receiver<()>,
    retry_backoff: Duration,
    wait: Duration,
) {
    tracing::debug!(prefix = %prefix, "consul watch started");
    let mut wait_index = 0u64;
    // `None` until the first response establishes the baseline
    let mut snapshot: Option<HashMap<String, u64>> = None;

    'watch: loop {
        if stop_requested(&stop) {
            break;
        }

        let query = BlockingQuery {
            index: wait_index,
            wait,
        };
        let result = tokio::select! {
            _ = stop.recv_async() => break,
            result = api.list(&prefix, Some(query)) => result,
        };

        let (pairs, meta) = match result {
            Ok((_, meta)) if meta.last_index == 0 => {
                tracing::warn!(prefix = %prefix, "consul response carried no index, retrying");
                if backoff_or_stop(&stop, retry_backoff).await {
                    break;
                }
                continue;
            }
            Ok(response) => response,
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    prefix = %prefix,
                    backoff_secs = retry_backoff.as_secs_f64(),
                    "consul watch failed, retrying: {}",
                    e
                );
                if backoff_or_stop(&stop, retry_backoff).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::error!(prefix = %prefix, "consul watch failed permanently: {}", e);
                break;
            }
        };

        if meta.last_index == wait_index {
            tracing::trace!(prefix = %prefix, index = wait_index, "index unchanged, skipping");
            continue;
        }
        if meta.last_index < wait_index {
            tracing::debug!(
                prefix = %prefix,
                previous = wait_index,
                current = meta.last_index,
                "consul index went backwards, resetting"
            );
            wait_index = 0;
            continue;
        }

        let changes = match &snapshot {
            Some(previous) => diff_snapshot(previous, &pairs),
            None => Vec::new(),
        };
        snapshot = Some(
            pairs
                .iter()
                .map(|p| (p.key.clone(), p.modify_index))
                .collect(),
        );
        wait_index = meta.last_index;

        for change in changes {
            tracing::trace!(prefix = %prefix, change = ?change, "consul watch event");
            let sent = tokio::select! {
                _ = stop.recv_async() => break 'watch,
                sent = updates.send_async(change) => sent,
            };
            if sent.is_err() {
                tracing::debug!(prefix = %prefix, "watch receiver dropped");
                break 'watch;
            }
        }
    }
    tracing::debug!(prefix = %prefix, "consul watch exited");
}

#[async_trait]
impl<A: ConsulApi> KvStore for ConsulStore<A> {
    async fn get(&self, path: &str) -> Result<Node, KvError> {
        let path = normalize_path(path);
        let key = consul_key(&path);
        if key.is_empty() {
            return Ok(Node::directory(path));
        }

        // One level of key names tells us both whether the key itself exists
        // and whether anything lives beneath it
        let names = self.api.keys(&key, Some("/")).await?;
        let folder = child_prefix(&key);
        if names.iter().any(|name| *name == folder) {
            return Ok(Node::directory(path));
        }
        if !names.iter().any(|name| *name == key) {
            return Err(KvError::NotFound(path));
        }

        match self.api.get(&key).await? {
            Some(pair) => Ok(Node::file(path, pair.decoded_value()?)),
            None => Err(KvError::NotFound(path)),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<Node>, KvError> {
        let path = normalize_path(path);
        let key = consul_key(&path);
        let prefix = child_prefix(&key);
        tracing::trace!(path = %path, "consul list");

        let (pairs, _) = self.api.list(&prefix, None).await?;
        let children = immediate_children(&prefix, &pairs)?;
        if !children.is_empty() || key.is_empty() {
            return Ok(children);
        }

        // Nothing beneath: an empty folder marker, a leaf, or nothing at all
        if pairs.iter().any(|p| p.key == prefix) {
            return Ok(children);
        }
        match self.api.get(&key).await? {
            Some(_) => Err(KvError::NotADirectory(path)),
            None => Err(KvError::NotFound(path)),
        }
    }

    async fn set(&self, path: &str, value: &str) -> Result<(), KvError> {
        let key = consul_key(path);
        tracing::debug!(key = %key, "consul set");
        self.api.put(&key, value).await
    }

    async fn delete(&self, path: &str) -> Result<(), KvError> {
        let key = consul_key(path);
        tracing::debug!(key = %key, "consul delete");
        self.api.delete(&key).await
    }

    async fn remove_path(&self, path: &str) -> Result<(), KvError> {
        let key = consul_key(path);
        tracing::debug!(key = %key, "consul remove path");
        if !key.is_empty() {
            self.api.delete(&key).await?;
        }
        // Trailing slash keeps siblings sharing the name as a prefix
        self.api.delete_tree(&child_prefix(&key)).await
    }

    /// Consul has no directory nodes; a prefix exists once a key lives under it
    async fn mkdir(&self, path: &str) -> Result<(), KvError> {
        tracing::debug!(path = %path, "consul mkdir is a no-op");
        Ok(())
    }

    async fn watch(
        &self,
        path: &str,
        updates: flume::Sender<NodeChange>,
    ) -> Result<WatchHandle, KvError> {
        let prefix = child_prefix(&consul_key(path));
        let api = self.api.clone();
        let retry_backoff = self.retry_backoff;
        let wait = self.wait;
        Ok(WatchHandle::spawn(normalize_path(path), move |stop| {
            run_watch(api, prefix, updates, stop, retry_backoff, wait)
        }))
    }
}
