use common::KvStore;

use super::{FsStatus, KvFs, NodeAttr};

/// An open, read-only view of one key
///
/// Holds no data of its own: every read goes back through the node cache, so
/// a change the watcher has applied is visible to already-open handles.
pub struct KvFile<S> {
    fs: KvFs<S>,
    path: String,
}

impl<S: KvStore> KvFile<S> {
    pub(crate) fn new(fs: KvFs<S>, path: String) -> Self {
        Self { fs, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Up to `size` bytes of the value starting at `offset`, clamped to the
    /// end of the value
    pub async fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>, FsStatus> {
        let node = self.fs.cached_node(&self.path).await.map_err(|e| {
            tracing::error!(path = %self.path, "failed to read value: {}", e);
            FsStatus::Io
        })?;

        let data = node.value.as_bytes();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    pub async fn get_attr(&self) -> Result<NodeAttr, FsStatus> {
        self.fs.get_attr(&self.path).await.map_err(|_| FsStatus::Io)
    }

    /// Values are changed through the backend, never through the mount
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsStatus> {
        tracing::debug!(path = %self.path, offset, len = data.len(), "write refused");
        Err(FsStatus::PermissionDenied)
    }

    pub fn truncate(&self, size: u64) -> Result<(), FsStatus> {
        tracing::debug!(path = %self.path, size, "truncate refused");
        Err(FsStatus::PermissionDenied)
    }

    pub fn allocate(&self, offset: u64, length: u64) -> Result<(), FsStatus> {
        tracing::debug!(path = %self.path, offset, length, "allocate refused");
        Err(FsStatus::PermissionDenied)
    }

    pub fn flush(&self) -> Result<(), FsStatus> {
        Ok(())
    }

    pub fn fsync(&self) -> Result<(), FsStatus> {
        Ok(())
    }

    pub fn release(self) {
        tracing::trace!(path = %self.path, "release");
    }

    pub fn chmod(&self, mode: u32) -> Result<(), FsStatus> {
        tracing::debug!(path = %self.path, mode, "chmod not implemented");
        Err(FsStatus::NotImplemented)
    }

    pub fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsStatus> {
        tracing::debug!(path = %self.path, ?uid, ?gid, "chown not implemented");
        Err(FsStatus::NotImplemented)
    }

    pub fn utimens(&self) -> Result<(), FsStatus> {
        tracing::debug!(path = %self.path, "utimens not implemented");
        Err(FsStatus::NotImplemented)
    }
}
