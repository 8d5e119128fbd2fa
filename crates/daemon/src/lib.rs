// Mount configuration
pub mod config;

// Filesystem translation layer
pub mod fs;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use config::{Config, ConfigError};
pub use fs::{DirEntry, FsStatus, KvFile, KvFs, MountState, NodeAttr};

/// Build and version string reported by `--version` and at startup
pub fn build_info() -> String {
    let features = if cfg!(feature = "fuse") { "fuse" } else { "none" };
    format!("{} (features: {})", env!("CARGO_PKG_VERSION"), features)
}
