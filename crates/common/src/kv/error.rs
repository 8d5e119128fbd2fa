/// Errors returned by key-value backends
///
/// Drivers return these untouched so callers can still tell a missing key
/// from an unreachable backend.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("unsupported backend provider: {0}")]
    UnsupportedBackend(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl KvError {
    /// Whether the error is a transient transport failure worth retrying
    ///
    /// A malformed body counts as transient: long polls cut short by a proxy or
    /// server timeout show up as truncated responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Http(_) | KvError::Unavailable(_) | KvError::Decode(_) => true,
            KvError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound(_))
    }
}
