//! etcd driver
//!
//! Watches issue one recursive long poll at a time; each call returns on the
//! next change anywhere beneath the watched key, so no index bookkeeping is
//! needed. Transport failures sleep a fixed backoff and retry until stopped.

mod client;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

pub use client::{EtcdApi, EtcdClient, EtcdNode, EtcdResponse};

use super::watch::{backoff_or_stop, stop_requested};
use super::{
    normalize_path, BackendConfig, KvError, KvStore, Node, NodeChange, Operation, WatchHandle,
};

/// etcd-backed `KvStore`
#[derive(Debug)]
pub struct EtcdStore<A = EtcdClient> {
    api: Arc<A>,
    retry_backoff: Duration,
}

impl<A> Clone for EtcdStore<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            retry_backoff: self.retry_backoff,
        }
    }
}

impl EtcdStore<EtcdClient> {
    pub fn connect(endpoints: Vec<Url>, config: &BackendConfig) -> Result<Self, KvError> {
        tracing::info!(
            hosts = ?endpoints.iter().map(Url::as_str).collect::<Vec<_>>(),
            "creating etcd client"
        );
        let api = EtcdClient::new(endpoints, config.request_timeout)?;
        Ok(Self::with_api(api, config.retry_backoff))
    }
}

impl<A: EtcdApi> EtcdStore<A> {
    pub fn with_api(api: A, retry_backoff: Duration) -> Self {
        Self {
            api: Arc::new(api),
            retry_backoff,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }
}

fn node_from_etcd(path: String, node: &EtcdNode) -> Node {
    if node.dir {
        Node::directory(path)
    } else {
        Node::file(path, node.value.clone().unwrap_or_default())
    }
}

/// Translate a watch response into the uniform change event
fn change_from_response(response: &EtcdResponse) -> NodeChange {
    let operation = match response.action.as_str() {
        "set" | "create" | "update" | "compareAndSwap" => Operation::Changed,
        "delete" | "expire" | "compareAndDelete" => Operation::Deleted,
        _ => Operation::Unknown,
    };
    let node = node_from_etcd(normalize_path(&response.node.key), &response.node);
    NodeChange { node, operation }
}

async fn run_watch<A: EtcdApi>(
    api: Arc<A>,
    key: String,
    updates: flume::Sender<NodeChange>,
    stop: flume::Receiver<()>,
    retry_backoff: Duration,
) {
    tracing::debug!(key = %key, "etcd watch started");
    loop {
        if stop_requested(&stop) {
            break;
        }

        let result = tokio::select! {
            _ = stop.recv_async() => break,
            result = api.watch(&key, true) => result,
        };

        match result {
            Ok(response) => {
                let change = change_from_response(&response);
                tracing::trace!(key = %key, change = ?change, "etcd watch event");
                let sent = tokio::select! {
                    _ = stop.recv_async() => break,
                    sent = updates.send_async(change) => sent,
                };
                if sent.is_err() {
                    tracing::debug!(key = %key, "watch receiver dropped");
                    break;
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    key = %key,
                    backoff_secs = retry_backoff.as_secs_f64(),
                    "etcd watch failed, retrying: {}",
                    e
                );
                if backoff_or_stop(&stop, retry_backoff).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(key = %key, "etcd watch failed permanently: {}", e);
                break;
            }
        }
    }
    tracing::debug!(key = %key, "etcd watch exited");
}

#[async_trait]
impl<A: EtcdApi> KvStore for EtcdStore<A> {
    async fn get(&self, path: &str) -> Result<Node, KvError> {
        let path = normalize_path(path);
        let response = self.api.get(&path).await?;
        Ok(node_from_etcd(path, &response.node))
    }

    async fn list(&self, path: &str) -> Result<Vec<Node>, KvError> {
        let path = normalize_path(path);
        tracing::trace!(path = %path, "etcd list");
        let response = self.api.get(&path).await?;
        if !response.node.dir {
            return Err(KvError::NotADirectory(path));
        }

        Ok(response
            .node
            .nodes
            .iter()
            .map(|item| node_from_etcd(normalize_path(&item.key), item))
            .collect())
    }

    async fn set(&self, path: &str, value: &str) -> Result<(), KvError> {
        let path = normalize_path(path);
        tracing::debug!(path = %path, "etcd set");
        self.api.set(&path, value).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<(), KvError> {
        let path = normalize_path(path);
        tracing::debug!(path = %path, "etcd delete");
        self.api.delete(&path, false).await.map(|_| ())
    }

    async fn remove_path(&self, path: &str) -> Result<(), KvError> {
        let path = normalize_path(path);
        tracing::debug!(path = %path, "etcd remove path");
        self.api.delete(&path, true).await.map(|_| ())
    }

    async fn mkdir(&self, path: &str) -> Result<(), KvError> {
        let path = normalize_path(path);
        tracing::debug!(path = %path, "etcd mkdir");
        self.api.create_dir(&path).await.map(|_| ())
    }

    async fn watch(
        &self,
        path: &str,
        updates: flume::Sender<NodeChange>,
    ) -> Result<WatchHandle, KvError> {
        let key = normalize_path(path);
        let api = self.api.clone();
        let retry_backoff = self.retry_backoff;
        Ok(WatchHandle::spawn(key.clone(), move |stop| {
            run_watch(api, key, updates, stop, retry_backoff)
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Scripted etcd transport: stored keys, recorded writes, queued watch results
    #[derive(Default)]
    struct FakeEtcd {
        gets: Mutex<HashMap<String, EtcdResponse>>,
        writes: Mutex<Vec<String>>,
        watch_script: Mutex<VecDeque<Result<EtcdResponse, KvError>>>,
        /// Returned once the script runs out; `None` blocks forever
        watch_fallback: Option<fn() -> KvError>,
        watch_calls: AtomicUsize,
    }

    #[async_trait]
    impl EtcdApi for FakeEtcd {
        async fn get(&self, key: &str) -> Result<EtcdResponse, KvError> {
            self.gets
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| KvError::NotFound(key.to_string()))
        }

        async fn set(&self, key: &str, value: &str) -> Result<EtcdResponse, KvError> {
            self.writes.lock().push(format!("set {}={}", key, value));
            let response = event("set", leaf(key, value));
            self.gets
                .lock()
                .insert(key.to_string(), event("get", leaf(key, value)));
            Ok(response)
        }

        async fn create_dir(&self, key: &str) -> Result<EtcdResponse, KvError> {
            self.writes.lock().push(format!("mkdir {}", key));
            Ok(EtcdResponse::default())
        }

        async fn delete(&self, key: &str, recursive: bool) -> Result<EtcdResponse, KvError> {
            self.writes
                .lock()
                .push(format!("delete {} recursive={}", key, recursive));
            Ok(EtcdResponse::default())
        }

        async fn watch(&self, _key: &str, _recursive: bool) -> Result<EtcdResponse, KvError> {
            self.watch_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.watch_script.lock().pop_front();
            match next {
                Some(result) => result,
                None => match self.watch_fallback {
                    Some(make_err) => Err(make_err()),
                    None => std::future::pending().await,
                },
            }
        }
    }

    fn dir(key: &str, children: Vec<EtcdNode>) -> EtcdNode {
        EtcdNode {
            key: key.to_string(),
            dir: true,
            nodes: children,
            ..Default::default()
        }
    }

    fn leaf(key: &str, value: &str) -> EtcdNode {
        EtcdNode {
            key: key.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    fn event(action: &str, node: EtcdNode) -> EtcdResponse {
        EtcdResponse {
            action: action.to_string(),
            node,
            prev_node: None,
        }
    }

    fn seeded() -> FakeEtcd {
        let mut fake = FakeEtcd::default();
        fake.gets.get_mut().insert(
            "/app".to_string(),
            event("get", dir("/app", vec![dir("/app/db", vec![])])),
        );
        fake.gets.get_mut().insert(
            "/app/db/host".to_string(),
            event("get", leaf("/app/db/host", "10.0.0.1")),
        );
        fake
    }

    #[tokio::test]
    async fn test_get_file_and_directory() {
        let store = EtcdStore::with_api(seeded(), Duration::from_secs(3));

        let file = store.get("/app/db/host").await.unwrap();
        assert_eq!(file, Node::file("/app/db/host", "10.0.0.1"));

        let dir = store.get("app").await.unwrap();
        assert!(dir.is_dir());
        assert!(dir.value.is_empty());

        assert!(store.get("/nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_children() {
        let store = EtcdStore::with_api(seeded(), Duration::from_secs(3));

        let children = store.list("/app").await.unwrap();
        assert_eq!(children, vec![Node::directory("/app/db")]);

        let err = store.list("/app/db/host").await.unwrap_err();
        assert!(matches!(err, KvError::NotADirectory(ref p) if p == "/app/db/host"));
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let store = EtcdStore::with_api(FakeEtcd::default(), Duration::from_secs(3));
        store.set("app/key", "v").await.unwrap();
        store.delete("/app/key").await.unwrap();
        store.remove_path("/app").await.unwrap();
        store.mkdir("/new").await.unwrap();

        assert_eq!(
            *store.api().writes.lock(),
            vec![
                "set /app/key=v".to_string(),
                "delete /app/key recursive=false".to_string(),
                "delete /app recursive=true".to_string(),
                "mkdir /new".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let store = EtcdStore::with_api(FakeEtcd::default(), Duration::from_secs(3));

        for (path, value) in [("/app/db/host", "10.0.0.1"), ("app/name", ""), ("/a", "1")] {
            store.set(path, value).await.unwrap();
            let node = store.get(path).await.unwrap();
            assert_eq!(node, Node::file(normalize_path(path), value));
        }

        store.set("/a", "overwritten").await.unwrap();
        assert_eq!(store.get("/a").await.unwrap().value, "overwritten");
    }

    #[test]
    fn test_change_from_response() {
        let change = change_from_response(&event("set", leaf("/app/db/host", "10.0.0.2")));
        assert_eq!(change.operation, Operation::Changed);
        assert_eq!(change.node, Node::file("/app/db/host", "10.0.0.2"));

        let change = change_from_response(&event("delete", leaf("/app/db/host", "")));
        assert_eq!(change.operation, Operation::Deleted);

        let change = change_from_response(&event("expire", leaf("/tmp/lease", "")));
        assert_eq!(change.operation, Operation::Deleted);

        let change = change_from_response(&event("get", leaf("/x", "")));
        assert_eq!(change.operation, Operation::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_retries_after_backoff() {
        let fake = FakeEtcd::default();
        fake.watch_script
            .lock()
            .push_back(Err(KvError::Unavailable("connection refused".into())));
        fake.watch_script
            .lock()
            .push_back(Ok(event("set", leaf("/app/db/host", "10.0.0.2"))));

        let backoff = Duration::from_secs(3);
        let store = EtcdStore::with_api(fake, backoff);
        let (tx, rx) = flume::unbounded();

        let started = tokio::time::Instant::now();
        let handle = store.watch("/", tx).await.unwrap();

        let change = rx.recv_async().await.unwrap();
        assert!(started.elapsed() >= backoff);
        assert_eq!(change.operation, Operation::Changed);
        assert_eq!(change.node.path, "/app/db/host");
        assert_eq!(store.api().watch_calls.load(Ordering::SeqCst), 2);

        handle.stop().await;
        assert!(rx.recv_async().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_runs_until_stopped() {
        let fake = FakeEtcd {
            watch_fallback: Some(|| KvError::Unavailable("connection refused".into())),
            ..Default::default()
        };
        let store = EtcdStore::with_api(fake, Duration::from_secs(3));
        let (tx, rx) = flume::unbounded();

        let handle = store.watch("/", tx).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Still retrying, nothing emitted, channel still open
        let calls = store.api().watch_calls.load(Ordering::SeqCst);
        assert!(calls >= 10, "expected repeated retries, got {}", calls);
        assert!(!handle.is_finished());
        assert!(rx.try_recv().is_err());
        assert!(!rx.is_disconnected());

        handle.stop().await;
        assert!(rx.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_stop_abandons_inflight_poll() {
        let store = EtcdStore::with_api(FakeEtcd::default(), Duration::from_secs(3));
        let (tx, rx) = flume::unbounded();

        let handle = store.watch("/", tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.api().watch_calls.load(Ordering::SeqCst), 1);

        handle.stop().await;
        assert!(rx.is_disconnected());
    }
}
