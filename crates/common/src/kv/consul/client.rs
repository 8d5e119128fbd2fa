use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{header::HeaderMap, header::HeaderValue, Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::kv::KvError;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// One entry of the Consul KV store as returned by `/v1/kv`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    pub key: String,
    /// Base64-encoded value, `None` for folder markers and empty keys
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub lock_index: u64,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: &str, modify_index: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(base64::engine::general_purpose::STANDARD.encode(value)),
            create_index: modify_index,
            modify_index,
            ..Default::default()
        }
    }

    /// Decoded value as text; invalid UTF-8 is replaced rather than rejected
    pub fn decoded_value(&self) -> Result<String, KvError> {
        match &self.value {
            None => Ok(String::new()),
            Some(encoded) => {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| KvError::Decode(format!("value of {}: {}", self.key, e)))?;
                match String::from_utf8(raw) {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        tracing::warn!(
                            key = %self.key,
                            bytes = e.as_bytes().len(),
                            "value is not valid UTF-8, replacing invalid sequences"
                        );
                        Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
                    }
                }
            }
        }
    }

    /// Keys ending in `/` are folder markers rather than leaves
    pub fn is_folder(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Index metadata of a read; the basis of blocking queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    pub last_index: u64,
}

/// Parameters of a Consul blocking query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingQuery {
    /// Return only once the index moves past this value (or `wait` elapses)
    pub index: u64,
    pub wait: Duration,
}

/// Raw Consul KV primitives the driver is built on
#[async_trait]
pub trait ConsulApi: Send + Sync + 'static {
    /// Fetch a single key, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError>;

    /// Key names under `prefix`, folded at `separator` when given
    async fn keys(&self, prefix: &str, separator: Option<&str>) -> Result<Vec<String>, KvError>;

    /// Every pair under `prefix`; with `query`, block until the index moves
    async fn list(
        &self,
        prefix: &str,
        query: Option<BlockingQuery>,
    ) -> Result<(Vec<KvPair>, QueryMeta), KvError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn delete_tree(&self, prefix: &str) -> Result<(), KvError>;
}

/// HTTP client for a Consul agent
#[derive(Debug)]
pub struct ConsulClient {
    address: Url,
    datacenter: String,
    token: Option<String>,
    client: Client,
    request_timeout: Duration,
}

impl ConsulClient {
    pub fn new(
        address: Url,
        datacenter: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, KvError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("Accept", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            address,
            datacenter: datacenter.into(),
            token: token.filter(|t| !t.is_empty()),
            client,
            request_timeout,
        })
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    /// Each key segment is percent-encoded, so `?`, `#` and `%` stay in the path
    fn kv_url(&self, key: &str) -> Result<Url, KvError> {
        let mut url = self.address.clone();
        url.path_segments_mut()
            .map_err(|_| KvError::InvalidUrl(format!("{} cannot be a base", self.address)))?
            .pop_if_empty()
            .extend(["v1", "kv"])
            .extend(key.split('/'));
        Ok(url)
    }

    fn read(&self, key: &str) -> Result<RequestBuilder, KvError> {
        Ok(self
            .client
            .get(self.kv_url(key)?)
            .query(&[("dc", self.datacenter.as_str())]))
    }

    /// Write requests carry the ACL token; reads never do
    fn write(&self, method: reqwest::Method, key: &str) -> Result<RequestBuilder, KvError> {
        let request = self
            .client
            .request(method, self.kv_url(key)?)
            .query(&[("dc", self.datacenter.as_str())])
            .timeout(self.request_timeout);
        Ok(match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        })
    }

    fn query_meta(response: &reqwest::Response) -> QueryMeta {
        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        QueryMeta { last_index }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, KvError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(KvError::Status {
                status: status.as_u16(),
                message: response.text().await?,
            })
        }
    }
}

#[async_trait]
impl ConsulApi for ConsulClient {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError> {
        let response = self.read(key)?.timeout(self.request_timeout).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pairs: Vec<KvPair> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        Ok(pairs.into_iter().find(|p| p.key == key))
    }

    async fn keys(&self, prefix: &str, separator: Option<&str>) -> Result<Vec<String>, KvError> {
        let mut request = self
            .read(prefix)?
            .query(&[("keys", "true")])
            .timeout(self.request_timeout);
        if let Some(separator) = separator {
            request = request.query(&[("separator", separator)]);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))
    }

    async fn list(
        &self,
        prefix: &str,
        query: Option<BlockingQuery>,
    ) -> Result<(Vec<KvPair>, QueryMeta), KvError> {
        let mut request = self.read(prefix)?.query(&[("recurse", "true")]);
        request = match query {
            Some(query) => {
                // Consul adds up to wait/16 of jitter before answering
                let timeout = query.wait + query.wait / 16 + self.request_timeout;
                request
                    .query(&[
                        ("index", query.index.to_string()),
                        ("wait", format!("{}s", query.wait.as_secs().max(1))),
                    ])
                    .timeout(timeout)
            }
            None => request.timeout(self.request_timeout),
        };

        let response = request.send().await?;
        let meta = Self::query_meta(&response);
        if response.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), meta));
        }
        let pairs = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        Ok((pairs, meta))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        let response = self
            .write(reqwest::Method::PUT, key)?
            .body(value.to_string())
            .send()
            .await?;
        let accepted: bool = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        if accepted {
            Ok(())
        } else {
            Err(KvError::Status {
                status: StatusCode::CONFLICT.as_u16(),
                message: format!("consul rejected write to {}", key),
            })
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let response = self.write(reqwest::Method::DELETE, key)?.send().await?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<(), KvError> {
        let response = self
            .write(reqwest::Method::DELETE, prefix)?
            .query(&[("recurse", "true")])
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }
}
