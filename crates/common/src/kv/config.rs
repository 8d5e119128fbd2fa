use std::time::Duration;

use url::Url;

use super::KvError;

pub const DEFAULT_BACKEND_URL: &str = "etcd://localhost:4001";
pub const DEFAULT_ETCD_PORT: u16 = 4001;
pub const DEFAULT_CONSUL_PORT: u16 = 8500;
pub const DEFAULT_CONSUL_DATACENTER: &str = "dc1";
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);
pub const DEFAULT_CONSUL_WAIT: Duration = Duration::from_secs(300);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for the single backend a mount talks to
///
/// Built once at startup and handed by reference to the backend constructor.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// `etcd://host[,host...]:port` or `consul://host:port`
    pub url: String,
    /// Consul datacenter sent with every request
    pub consul_datacenter: String,
    /// Consul ACL token, only sent on write operations
    pub consul_token: Option<String>,
    /// Sleep between watch retries after a transport failure
    pub retry_backoff: Duration,
    /// How long a Consul blocking query may hold before returning unchanged
    pub consul_wait: Duration,
    /// Timeout for non-watch requests
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            consul_datacenter: DEFAULT_CONSUL_DATACENTER.to_string(),
            consul_token: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            consul_wait: DEFAULT_CONSUL_WAIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Parse the backend url into the kind of backend and its endpoints
    pub fn kind(&self) -> Result<BackendKind, KvError> {
        BackendKind::parse(&self.url)
    }
}

/// Which driver a backend url selects, with the endpoints to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// One `http://host:port` endpoint per cluster member
    Etcd { endpoints: Vec<Url> },
    /// The agent's `http://host:port` address
    Consul { address: Url },
}

impl BackendKind {
    pub fn parse(raw: &str) -> Result<Self, KvError> {
        let uri = Url::parse(raw).map_err(|e| KvError::InvalidUrl(format!("{}: {}", raw, e)))?;
        let host = uri
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| KvError::InvalidUrl(format!("{}: missing host", raw)))?;

        match uri.scheme() {
            "etcd" => {
                let port = uri.port().unwrap_or(DEFAULT_ETCD_PORT);
                let endpoints = host
                    .split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(|h| {
                        let authority = if h.contains(':') {
                            h.to_string()
                        } else {
                            format!("{}:{}", h, port)
                        };
                        Url::parse(&format!("http://{}", authority))
                            .map_err(|e| KvError::InvalidUrl(format!("{}: {}", raw, e)))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if endpoints.is_empty() {
                    return Err(KvError::InvalidUrl(format!("{}: no etcd hosts", raw)));
                }
                Ok(BackendKind::Etcd { endpoints })
            }
            "consul" => {
                let port = uri.port().unwrap_or(DEFAULT_CONSUL_PORT);
                let address = Url::parse(&format!("http://{}:{}", host, port))
                    .map_err(|e| KvError::InvalidUrl(format!("{}: {}", raw, e)))?;
                Ok(BackendKind::Consul { address })
            }
            other => Err(KvError::UnsupportedBackend(other.to_string())),
        }
    }
}
