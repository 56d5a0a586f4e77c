//! Typed errors for splitfetch
//!
//! Every failure that crosses a component boundary is a [`DownloadError`],
//! tagged with enough context to decide whether retrying makes sense.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download engine
#[derive(Debug, Error)]
pub enum DownloadError {
    /// HTTP/network failure. `retryable` follows the engine's retry policy:
    /// transient transport faults and 5xx statuses retry, 4xx and TLS
    /// certificate problems do not.
    #[error("HTTP failure: {message}")]
    Http {
        message: String,
        transport_code: TransportErrorKind,
        /// HTTP status when the server answered, 0 otherwise
        http_status: u16,
        retryable: bool,
    },

    /// Filesystem failure (open, allocate, write, rename)
    #[error("I/O failure at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Invalid input from the caller
    #[error("invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// The operation was cancelled; never retryable
    #[error("operation cancelled")]
    Cancelled,

    /// The worker pool has shut down
    #[error("worker pool is shut down")]
    Shutdown,

    /// Internal error (bug)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Transport-level failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No transport fault (HTTP status errors)
    None,
    /// Connect or overall transfer timeout
    Timeout,
    /// Could not connect (refused, unreachable, DNS, proxy)
    Connect,
    /// TLS certificate failure
    Tls,
    /// Server closed the connection without a response
    EmptyResponse,
    /// Error while receiving the body
    Recv,
    /// Error while sending the request
    Send,
    /// Body ended before the announced length
    PartialTransfer,
    /// Redirect limit exceeded
    TooManyRedirects,
    /// The data sink refused the chunk
    Aborted,
    /// Anything else
    Other,
}

impl TransportErrorKind {
    /// Whether a transport fault of this kind is plausibly transient.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Connect
                | Self::EmptyResponse
                | Self::Recv
                | Self::Send
                | Self::PartialTransfer
        )
    }
}

impl DownloadError {
    /// Create an HTTP failure from a transport fault
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
            transport_code: kind,
            http_status: 0,
            retryable: kind.is_transient(),
        }
    }

    /// Create an HTTP failure from a status code. Everything at or above 400
    /// that is not a 4xx client error is considered retryable.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
            transport_code: TransportErrorKind::None,
            http_status: status,
            retryable: !(400..500).contains(&status),
        }
    }

    /// Create a storage error
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Check if the failed operation may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, DownloadError>;

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest folds TLS problems into connect errors; sniff the chain so
        // certificate failures stay non-retryable.
        let chain = format!("{err:?}");
        let kind = if chain.contains("certificate") || chain.contains("Tls") {
            TransportErrorKind::Tls
        } else if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_redirect() {
            TransportErrorKind::TooManyRedirects
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Recv
        } else if err.is_request() {
            TransportErrorKind::Send
        } else {
            TransportErrorKind::Other
        };

        Self::Http {
            message: err.to_string(),
            transport_code: kind,
            http_status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            retryable: kind.is_transient(),
        }
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_faults_tagged_retryable() {
        assert!(DownloadError::transport(TransportErrorKind::Timeout, "t").is_retryable());
        assert!(DownloadError::transport(TransportErrorKind::PartialTransfer, "p").is_retryable());
        assert!(!DownloadError::transport(TransportErrorKind::Tls, "cert").is_retryable());
        assert!(!DownloadError::transport(TransportErrorKind::Aborted, "sink").is_retryable());
    }

    #[test]
    fn status_errors_follow_4xx_rule() {
        assert!(!DownloadError::http_status(404, "not found").is_retryable());
        assert!(!DownloadError::http_status(403, "forbidden").is_retryable());
        assert!(DownloadError::http_status(500, "ise").is_retryable());
        assert!(DownloadError::http_status(503, "busy").is_retryable());
        assert!(DownloadError::http_status(599, "odd").is_retryable());
    }

    #[test]
    fn cancelled_is_never_retryable() {
        assert!(!DownloadError::Cancelled.is_retryable());
        assert!(!DownloadError::Shutdown.is_retryable());
    }
}
