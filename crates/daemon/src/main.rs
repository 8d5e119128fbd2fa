use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use common::Backend;
use confstore_daemon::{Config, KvFs};

#[derive(Parser, Debug)]
#[command(name = "confstore", version, about = "Mount an etcd or Consul namespace as a filesystem")]
struct Cli {
    /// Config file (default: <config dir>/confstore/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend url: etcd://host[,host...]:port or consul://host:port
    #[arg(long, env = "CONFSTORE_KV")]
    kv: Option<String>,

    /// Directory to mount the namespace on
    #[arg(long, env = "CONFSTORE_MOUNT")]
    mount: Option<PathBuf>,

    /// Consul datacenter
    #[arg(long = "consul-dc", env = "CONFSTORE_CONSUL_DC")]
    consul_dc: Option<String>,

    /// Consul ACL token used for writes
    #[arg(long = "consul-token", env = "CONFSTORE_CONSUL_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

impl Cli {
    /// Flags win over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(kv) = &self.kv {
            config.kv = kv.clone();
        }
        if let Some(mount) = &self.mount {
            config.mount_point = mount.clone();
        }
        if let Some(dc) = &self.consul_dc {
            config.consul.datacenter = dc.clone();
        }
        if let Some(token) = &self.consul_token {
            config.consul.token = token.clone();
        }
    }
}

/// `RUST_LOG` wins; `--debug` only picks the fallback level
fn log_filter(debug: bool, rust_log: &str) -> tracing_subscriber::EnvFilter {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(rust_log)
}

fn init_tracing(debug: bool) {
    let rust_log = std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(debug, &rust_log))
        .init();
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}

#[cfg(feature = "fuse")]
async fn run(fs: KvFs, config: &Config) -> anyhow::Result<()> {
    use confstore_daemon::fuse::{self, FuseOptions};

    let mount = fuse::mount(fs, &config.mount_point, FuseOptions::from(config))
        .await
        .with_context(|| format!("failed to mount {}", config.mount_point.display()))?;

    tracing::info!(
        mount_point = %mount.mount_point().display(),
        "filesystem mounted, waiting for a signal"
    );
    shutdown_signal().await?;
    tracing::info!("received shutdown signal");
    mount.unmount().await;
    Ok(())
}

#[cfg(not(feature = "fuse"))]
async fn run(_fs: KvFs, _config: &Config) -> anyhow::Result<()> {
    anyhow::bail!("confstore was built without the `fuse` feature and cannot mount")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    tracing::info!(version = %confstore_daemon::build_info(), "starting confstore");

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid backend url")?;

    let backend = Backend::from_config(&config.backend_config())
        .context("failed to create key-value backend")?;
    tracing::info!(backend = backend.name(), url = %config.kv, "backend ready");

    run(KvFs::new(backend), &config).await
}
