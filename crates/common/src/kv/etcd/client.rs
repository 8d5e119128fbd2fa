use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use url::Url;

use crate::kv::KvError;

const ERROR_KEY_NOT_FOUND: u32 = 100;
const ERROR_NOT_A_DIRECTORY: u32 = 104;
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

/// Response envelope of the etcd v2 keys API
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdResponse {
    pub action: String,
    #[serde(default)]
    pub node: EtcdNode,
    #[serde(default)]
    pub prev_node: Option<EtcdNode>,
}

/// One node of an etcd v2 response; the root node carries no key
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdNode {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<EtcdNode>,
    #[serde(default)]
    pub modified_index: u64,
    #[serde(default)]
    pub created_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

/// Raw etcd v2 keys primitives the driver is built on
#[async_trait]
pub trait EtcdApi: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<EtcdResponse, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<EtcdResponse, KvError>;

    async fn create_dir(&self, key: &str) -> Result<EtcdResponse, KvError>;

    async fn delete(&self, key: &str, recursive: bool) -> Result<EtcdResponse, KvError>;

    /// Block until the next change at or (with `recursive`) beneath `key`
    async fn watch(&self, key: &str, recursive: bool) -> Result<EtcdResponse, KvError>;
}

/// HTTP client for an etcd cluster, failing over between members
#[derive(Debug)]
pub struct EtcdClient {
    endpoints: Vec<Url>,
    /// Index of the member that last answered
    current: AtomicUsize,
    client: Client,
    request_timeout: Duration,
}

impl EtcdClient {
    pub fn new(endpoints: Vec<Url>, request_timeout: Duration) -> Result<Self, KvError> {
        if endpoints.is_empty() {
            return Err(KvError::InvalidUrl("no etcd endpoints".to_string()));
        }
        // No overall timeout on the client: watches hold the connection open
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
            client,
            request_timeout,
        })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Each key segment is percent-encoded, so `?`, `#` and `%` stay in the path
    fn key_url(endpoint: &Url, key: &str) -> Result<Url, KvError> {
        let key = key.trim_start_matches('/');
        let mut url = endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| KvError::InvalidUrl(format!("{} cannot be a base", endpoint)))?
            .pop_if_empty()
            .extend(["v2", "keys"])
            .extend(key.split('/'));
        Ok(url)
    }

    /// Send a request to each member in turn, starting from the last good one,
    /// until one of them answers at the transport level
    async fn call<F>(&self, key: &str, build: F) -> Result<EtcdResponse, KvError>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = None;

        for attempt in 0..self.endpoints.len() {
            let index = (start + attempt) % self.endpoints.len();
            let url = Self::key_url(&self.endpoints[index], key)?;

            match build(&self.client, url).send().await {
                Ok(response) => {
                    self.current.store(index, Ordering::Relaxed);
                    return Self::decode(key, response).await;
                }
                Err(e) => {
                    tracing::debug!(
                        endpoint = %self.endpoints[index],
                        "etcd member unreachable: {}",
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .map(KvError::from)
            .unwrap_or_else(|| KvError::Unavailable("no etcd members reachable".to_string())))
    }

    async fn decode(key: &str, response: reqwest::Response) -> Result<EtcdResponse, KvError> {
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| KvError::Decode(e.to_string()));
        }

        match serde_json::from_slice::<EtcdErrorBody>(&body) {
            Ok(err) => match err.error_code {
                ERROR_KEY_NOT_FOUND => Err(KvError::NotFound(key.to_string())),
                ERROR_NOT_A_DIRECTORY => Err(KvError::NotADirectory(key.to_string())),
                ERROR_EVENT_INDEX_CLEARED => Err(KvError::Unavailable(err.message)),
                _ => Err(KvError::Status {
                    status: status.as_u16(),
                    message: match err.cause {
                        Some(cause) => format!("{} ({})", err.message, cause),
                        None => err.message,
                    },
                }),
            },
            Err(_) => Err(KvError::Status {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }
}

#[async_trait]
impl EtcdApi for EtcdClient {
    async fn get(&self, key: &str) -> Result<EtcdResponse, KvError> {
        self.call(key, |client, url| {
            client
                .get(url)
                .query(&[("recursive", "false"), ("sorted", "true")])
                .timeout(self.request_timeout)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<EtcdResponse, KvError> {
        self.call(key, |client, url| {
            client
                .request(Method::PUT, url)
                .form(&[("value", value)])
                .timeout(self.request_timeout)
        })
        .await
    }

    async fn create_dir(&self, key: &str) -> Result<EtcdResponse, KvError> {
        self.call(key, |client, url| {
            client
                .request(Method::PUT, url)
                .form(&[("dir", "true")])
                .query(&[("prevExist", "false")])
                .timeout(self.request_timeout)
        })
        .await
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<EtcdResponse, KvError> {
        self.call(key, |client, url| {
            let request = client.delete(url).timeout(self.request_timeout);
            if recursive {
                request.query(&[("recursive", "true"), ("dir", "true")])
            } else {
                request
            }
        })
        .await
    }

    async fn watch(&self, key: &str, recursive: bool) -> Result<EtcdResponse, KvError> {
        let recursive = if recursive { "true" } else { "false" };
        self.call(key, |client, url| {
            client
                .get(url)
                .query(&[("wait", "true"), ("recursive", recursive)])
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_url() {
        let endpoint = Url::parse("http://localhost:4001").unwrap();
        assert_eq!(
            EtcdClient::key_url(&endpoint, "/app/db/host").unwrap().as_str(),
            "http://localhost:4001/v2/keys/app/db/host"
        );
        assert_eq!(
            EtcdClient::key_url(&endpoint, "/").unwrap().as_str(),
            "http://localhost:4001/v2/keys/"
        );
    }

    #[test]
    fn test_key_url_escapes_reserved_characters() {
        let endpoint = Url::parse("http://localhost:4001").unwrap();
        let url = EtcdClient::key_url(&endpoint, "/app/weird?key#x%41").unwrap();
        assert_eq!(url.path(), "/v2/keys/app/weird%3Fkey%23x%2541");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn test_decode_response() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/app",
                "dir": true,
                "nodes": [
                    {"key": "/app/db", "dir": true, "modifiedIndex": 4, "createdIndex": 4},
                    {"key": "/app/name", "value": "demo", "modifiedIndex": 5, "createdIndex": 5}
                ],
                "modifiedIndex": 3,
                "createdIndex": 3
            }
        }"#;
        let response: EtcdResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.action, "get");
        assert!(response.node.dir);
        assert_eq!(response.node.nodes.len(), 2);
        assert_eq!(response.node.nodes[1].value.as_deref(), Some("demo"));
    }

    #[test]
    fn test_decode_root_without_key() {
        let body = r#"{"action":"get","node":{"dir":true,"nodes":[{"key":"/app","dir":true}]}}"#;
        let response: EtcdResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.node.key, "");
        assert_eq!(response.node.nodes[0].key, "/app");
    }

    #[test]
    fn test_requires_endpoints() {
        assert!(matches!(
            EtcdClient::new(vec![], Duration::from_secs(1)).unwrap_err(),
            KvError::InvalidUrl(_)
        ));
    }
}
