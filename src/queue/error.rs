//! Error types for queue operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::item::JobState;

/// Structured classification for persistence failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    /// Reading or writing the state file failed.
    Io,
    /// The state file is not valid JSON for this schema.
    Corrupt,
}

impl fmt::Display for PersistenceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Io => "io",
            Self::Corrupt => "corrupt",
        };
        write!(f, "{label}")
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The input is not a catalog identifier.
    #[error(
        "malformed identifier '{input}'\n  Suggestion: Use a 32-character MD5 or a URL containing /md5/<id>"
    )]
    InvalidIdentifier {
        /// Raw user input.
        input: String,
    },

    /// The identifier is already queued or active.
    #[error("item {id} is already queued\n  Suggestion: Wait for it to finish or cancel it first")]
    DuplicateItem {
        /// Canonical identifier.
        id: String,
    },

    /// No queued or active job carries this identifier.
    #[error("item not found: {id}\n  Suggestion: The item may have finished already; check history")]
    ItemNotFound {
        /// Canonical identifier.
        id: String,
    },

    /// A state change the job state machine does not allow.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },

    /// Another worker is already serving this queue.
    #[error("queue worker already running")]
    AlreadyRunning,

    /// Saving or restoring the state file failed.
    #[error("queue state file {path} ({kind}): {message}")]
    Persistence {
        kind: PersistenceErrorKind,
        path: PathBuf,
        message: String,
    },

    /// A component could not be built from configuration.
    #[error("cannot set up {component}: {message}")]
    Setup {
        component: &'static str,
        message: String,
    },
}

impl QueueError {
    #[must_use]
    pub fn invalid_identifier(input: &str) -> Self {
        Self::InvalidIdentifier {
            input: input.trim().to_string(),
        }
    }

    pub(crate) fn persistence_io(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        Self::Persistence {
            kind: PersistenceErrorKind::Io,
            path: path.into(),
            message: source.to_string(),
        }
    }

    pub(crate) fn persistence_corrupt(path: impl Into<PathBuf>, source: &serde_json::Error) -> Self {
        Self::Persistence {
            kind: PersistenceErrorKind::Corrupt,
            path: path.into(),
            message: source.to_string(),
        }
    }

    pub(crate) fn setup(component: &'static str, message: impl fmt::Display) -> Self {
        Self::Setup {
            component,
            message: message.to_string(),
        }
    }

    /// Returns the persistence error kind, when this is a persistence error.
    #[must_use]
    pub fn persistence_kind(&self) -> Option<PersistenceErrorKind> {
        match self {
            Self::Persistence { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True for errors caused by what the caller asked for.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentifier { .. } | Self::DuplicateItem { .. } | Self::ItemNotFound { .. }
        )
    }
}
