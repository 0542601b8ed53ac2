//! Error types for mirror resolution and page fetching.

use thiserror::Error;

use crate::failure::{ErrorKind, JobError};

/// Errors returned by [`MirrorResolver::resolve`](super::MirrorResolver::resolve).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// The source page was fetched but carried no mirror links.
    #[error("no mirrors found on {url}")]
    NoMirrorsFound {
        /// Source page URL.
        url: String,
    },

    /// The source page could not be fetched within the bounded retry.
    #[error("source page {url} unreachable after {attempts} attempt(s): {reason}")]
    SourceUnreachable {
        /// Source page URL.
        url: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// An anti-bot challenge was served and no relay is configured.
    #[error(
        "anti-bot challenge on {url}\n  Suggestion: enable the challenge relay under [flaresolverr]"
    )]
    ChallengeRequired {
        /// URL that served the challenge.
        url: String,
    },
}

impl ResolutionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoMirrorsFound { .. } => ErrorKind::NoMirrorsFound,
            Self::SourceUnreachable { .. } => ErrorKind::SourceUnreachable,
            Self::ChallengeRequired { .. } => ErrorKind::ChallengeRequired,
        }
    }

    #[must_use]
    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

/// Transport-level failure of a single page fetch.
///
/// Non-success HTTP statuses are not errors at this level; they are returned
/// in [`FetchedPage`](super::FetchedPage) so callers can inspect challenge pages.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The challenge relay failed or reported an unsolved challenge.
    #[error("challenge relay failed for {url}: {message}")]
    Relay { url: String, message: String },
}

impl FetchError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn relay(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Relay {
            url: url.into(),
            message: message.into(),
        }
    }
}
