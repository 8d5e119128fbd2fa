//! Mount configuration
//!
//! Values come from three layers, later ones winning: built-in defaults, an
//! optional TOML file, and command-line flags (applied by the binary).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use common::kv::{
    BackendConfig, BackendKind, KvError, DEFAULT_BACKEND_URL, DEFAULT_CONSUL_DATACENTER,
    DEFAULT_CONSUL_WAIT, DEFAULT_RETRY_BACKOFF,
};

pub const DEFAULT_MOUNT_POINT: &str = "/data";
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const CONFIG_DIR_NAME: &str = "confstore";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid backend: {0}")]
    Backend(#[from] KvError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    pub datacenter: String,
    /// ACL token for writes; empty means none
    pub token: String,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            datacenter: DEFAULT_CONSUL_DATACENTER.to_string(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend url, `etcd://host[,host...]:port` or `consul://host:port`
    pub kv: String,
    /// Where the namespace is mounted
    pub mount_point: PathBuf,
    pub consul: ConsulConfig,
    /// Seconds between watch retries after a transport failure
    pub retry_backoff_secs: u64,
    /// Seconds a Consul blocking query may be held open
    pub consul_wait_secs: u64,
    pub request_timeout_secs: u64,
    /// Kernel attribute cache lifetime
    pub attr_ttl_secs: u64,
    /// Kernel directory entry cache lifetime
    pub entry_ttl_secs: u64,
    /// Owner reported for every node
    pub uid: u32,
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kv: DEFAULT_BACKEND_URL.to_string(),
            mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
            consul: ConsulConfig::default(),
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF.as_secs(),
            consul_wait_secs: DEFAULT_CONSUL_WAIT.as_secs(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            attr_ttl_secs: DEFAULT_ATTR_TTL_SECS,
            entry_ttl_secs: DEFAULT_ATTR_TTL_SECS,
            uid: 0,
            gid: 0,
        }
    }
}

impl Config {
    /// The per-user config file location, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load configuration
    ///
    /// An explicit path must exist. Without one, the per-user file is read if
    /// present and defaults are used otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => {
                    tracing::debug!("no config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "loading config file");
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fail early on a backend url no driver accepts
    pub fn validate(&self) -> Result<BackendKind, ConfigError> {
        Ok(BackendConfig::new(self.kv.clone()).kind()?)
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            url: self.kv.clone(),
            consul_datacenter: self.consul.datacenter.clone(),
            consul_token: Some(self.consul.token.clone()).filter(|t| !t.is_empty()),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            consul_wait: Duration::from_secs(self.consul_wait_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.kv, "etcd://localhost:4001");
        assert_eq!(config.mount_point, PathBuf::from("/data"));
        assert_eq!(config.consul.datacenter, "dc1");
        assert_eq!(config.attr_ttl(), Duration::from_secs(1));

        let backend = config.backend_config();
        assert_eq!(backend.retry_backoff, Duration::from_secs(3));
        assert!(backend.consul_token.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
kv = "consul://10.0.0.5:8500"
mount_point = "/mnt/config"

[consul]
token = "secret"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.kv, "consul://10.0.0.5:8500");
        assert_eq!(config.mount_point, PathBuf::from("/mnt/config"));
        assert_eq!(config.consul.datacenter, "dc1");
        assert_eq!(config.retry_backoff_secs, 3);

        let backend = config.backend_config();
        assert_eq!(backend.consul_token.as_deref(), Some("secret"));
        assert!(matches!(
            config.validate().unwrap(),
            BackendKind::Consul { .. }
        ));
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kv = [").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_unknown_scheme() {
        let config = Config {
            kv: "zookeeper://localhost:2181".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Backend(KvError::UnsupportedBackend(_))
        ));
    }
}
