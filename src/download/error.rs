//! Error types for the download module.
//!
//! [`DownloadError`] is the detailed, context-carrying error of a single HTTP
//! transfer. [`TransferError`] is the coarse classification the failover
//! policy works with; every backend reports failures in that form.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::failure::{ErrorKind, JobError};

/// Errors that can occur during a streaming HTTP transfer.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The mirror served a web page where a file was expected.
    #[error("mirror served {reason} instead of a file: {url}")]
    UnexpectedContent {
        /// The URL that served the page.
        url: String,
        /// What was served, e.g. `text/html`.
        reason: String,
    },

    /// The transfer was cancelled through its token.
    #[error("transfer cancelled: {url}")]
    Cancelled {
        /// The URL being transferred.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an unexpected-content error.
    pub fn unexpected_content(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnexpectedContent {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// url or path the source errors do not carry. Use the constructors above.

/// Backend-independent transfer failure, as consumed by the failover policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Connection reset, timeout, 5xx, 429: may succeed on retry.
    #[error("{message}")]
    Transient {
        message: String,
        /// Server-requested delay, when one was sent.
        retry_after: Option<Duration>,
    },

    /// 404 and friends: retrying the same mirror will not help.
    #[error("{message}")]
    Permanent { message: String },

    /// The backend itself could not be reached.
    #[error("{message}")]
    BackendUnavailable { message: String },
}

impl TransferError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::TransferTransient,
            Self::Permanent { .. } => ErrorKind::TransferPermanent,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
        }
    }

    #[must_use]
    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}
