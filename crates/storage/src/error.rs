//! Storage error types.

/// Errors produced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("invalid response to {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("no such multipart upload: {0}")]
    NoSuchUpload(String),

    #[error("multipart upload {0} is already finished")]
    TransactionFinished(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("injected fault: {reason}")]
    Injected { reason: String, transient: bool },
}

impl StorageError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            StorageError::Status { status, .. } => {
                matches!(*status, 408 | 429) || *status >= 500
            }
            StorageError::Io(e) => is_retryable_io(e),
            StorageError::Injected { transient, .. } => *transient,
            StorageError::Connection { .. }
            | StorageError::InvalidEndpoint(_)
            | StorageError::InvalidResponse { .. }
            | StorageError::NoSuchUpload(_)
            | StorageError::TransactionFinished(_)
            | StorageError::AccessDenied(_) => false,
        }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub(crate) fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
