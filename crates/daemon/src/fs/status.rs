use common::KvError;

/// Failure outcomes a filesystem request can report
///
/// Success is `Ok(..)`; this is the error half of every request's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsStatus {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("input/output error")]
    Io,
    #[error("function not implemented")]
    NotImplemented,
}

impl FsStatus {
    /// Downgrade a backend error, keeping only the semantic distinctions
    pub fn from_kv(err: &KvError) -> Self {
        match err {
            KvError::NotFound(_) => FsStatus::NotFound,
            KvError::NotADirectory(_) => FsStatus::NotADirectory,
            _ => FsStatus::Io,
        }
    }

    #[cfg(feature = "fuse")]
    pub fn to_errno(self) -> libc::c_int {
        match self {
            FsStatus::NotFound => libc::ENOENT,
            FsStatus::NotADirectory => libc::ENOTDIR,
            FsStatus::PermissionDenied => libc::EPERM,
            FsStatus::Io => libc::EIO,
            FsStatus::NotImplemented => libc::ENOSYS,
        }
    }
}

impl From<KvError> for FsStatus {
    fn from(err: KvError) -> Self {
        Self::from_kv(&err)
    }
}
