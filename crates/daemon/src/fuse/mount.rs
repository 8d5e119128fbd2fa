//! Mount lifecycle: establish the root watch, hand the filesystem to a fuser
//! background session, and tear both down again.

use std::path::{Path, PathBuf};

use fuser::{BackgroundSession, MountOption};
use tokio::runtime::Handle;

use common::{KvError, KvStore};

use super::{FuseOptions, KvFuse};
use crate::fs::KvFs;

pub const FS_NAME: &str = "confstore";

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("mount point {0} is not a directory")]
    InvalidMountPoint(PathBuf),
    #[error("failed to watch backend: {0}")]
    Watch(#[from] KvError),
    #[error("failed to mount at {path}: {source}")]
    Mount {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A mounted namespace; unmount it explicitly to stop the root watch
pub struct LiveMount<S> {
    fs: KvFs<S>,
    session: Option<BackgroundSession>,
    mount_point: PathBuf,
}

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype(FS_NAME.to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ]
}

/// Start watching the backend and mount `fs` at `mount_point`
///
/// Must be called from within a tokio runtime; the session thread uses it to
/// drive the async translation layer.
pub async fn mount<S: KvStore>(
    fs: KvFs<S>,
    mount_point: &Path,
    options: FuseOptions,
) -> Result<LiveMount<S>, MountError> {
    if !mount_point.is_dir() {
        return Err(MountError::InvalidMountPoint(mount_point.to_path_buf()));
    }

    fs.start_watching().await?;

    tracing::info!(mount_point = %mount_point.display(), "mounting filesystem");
    let fuse = KvFuse::new(fs.clone(), Handle::current(), options);
    let session = match fuser::spawn_mount2(fuse, mount_point, &mount_options()) {
        Ok(session) => session,
        Err(source) => {
            tracing::error!(mount_point = %mount_point.display(), "mount failed: {}", source);
            fs.unmount().await;
            return Err(MountError::Mount {
                path: mount_point.to_path_buf(),
                source,
            });
        }
    };

    Ok(LiveMount {
        fs,
        session: Some(session),
        mount_point: mount_point.to_path_buf(),
    })
}

impl<S: KvStore> LiveMount<S> {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn fs(&self) -> &KvFs<S> {
        &self.fs
    }

    /// Unmount the session, then stop the root watch
    pub async fn unmount(mut self) {
        tracing::info!(mount_point = %self.mount_point.display(), "unmounting filesystem");
        if let Some(session) = self.session.take() {
            // Dropping the session unmounts and joins the session thread
            if let Err(e) = tokio::task::spawn_blocking(move || drop(session)).await {
                tracing::warn!("fuse session teardown panicked: {}", e);
            }
        }
        self.fs.unmount().await;
        tracing::info!(mount_point = %self.mount_point.display(), "filesystem unmounted");
    }
}
