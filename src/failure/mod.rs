//! Failure classification and user-facing descriptors for job errors.
//!
//! Every error that can end a job, or that the failover policy consumes, maps
//! to one [`ErrorKind`]. The kind is what gets persisted in history and shown
//! in status output; the message carries the details.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Flat error taxonomy shared by resolution, quota, transfer, and verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The source page carried no mirror links.
    NoMirrorsFound,
    /// The source page could not be fetched after bounded retries.
    SourceUnreachable,
    /// An anti-bot challenge blocked the source page and no relay is configured.
    ChallengeRequired,
    /// The fast-lane quota is used up.
    QuotaExhausted,
    /// The fast-lane key was rejected.
    InvalidKey,
    /// A transfer failure that may succeed on retry.
    TransferTransient,
    /// A transfer failure that will not succeed against the same mirror.
    TransferPermanent,
    /// The configured backend could not be reached.
    BackendUnavailable,
    /// The artifact size differs from the advertised size.
    SizeMismatch,
    /// The artifact is an error page or placeholder instead of real content.
    InvalidContent,
    /// The user cancelled the job.
    Cancelled,
}

/// Component family an [`ErrorKind`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    Resolution,
    Quota,
    Transfer,
    Verification,
    Cancelled,
}

impl ErrorKind {
    /// Stable snake_case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoMirrorsFound => "no_mirrors_found",
            Self::SourceUnreachable => "source_unreachable",
            Self::ChallengeRequired => "challenge_required",
            Self::QuotaExhausted => "quota_exhausted",
            Self::InvalidKey => "invalid_key",
            Self::TransferTransient => "transfer_transient",
            Self::TransferPermanent => "transfer_permanent",
            Self::BackendUnavailable => "backend_unavailable",
            Self::SizeMismatch => "size_mismatch",
            Self::InvalidContent => "invalid_content",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn family(self) -> ErrorFamily {
        match self {
            Self::NoMirrorsFound | Self::SourceUnreachable | Self::ChallengeRequired => {
                ErrorFamily::Resolution
            }
            Self::QuotaExhausted | Self::InvalidKey => ErrorFamily::Quota,
            Self::TransferTransient | Self::TransferPermanent | Self::BackendUnavailable => {
                ErrorFamily::Transfer
            }
            Self::SizeMismatch | Self::InvalidContent => ErrorFamily::Verification,
            Self::Cancelled => ErrorFamily::Cancelled,
        }
    }

    /// True when only a configuration change can clear the error.
    #[must_use]
    pub fn requires_settings_change(self) -> bool {
        matches!(self, Self::ChallengeRequired | Self::InvalidKey)
    }

    /// True when the error clears by itself after waiting.
    #[must_use]
    pub fn clears_with_time(self) -> bool {
        matches!(
            self,
            Self::QuotaExhausted | Self::SourceUnreachable | Self::TransferTransient
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last error recorded on a job: kind plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by user")
    }

    #[must_use]
    pub fn describe(&self) -> FailureDescriptor {
        describe(self.kind)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What the user can do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureCategory {
    /// A setting must change before a retry can help.
    Settings,
    /// Waiting is enough.
    Wait,
    /// The item or its mirrors are the problem.
    Source,
    /// Connectivity or the download backend.
    Network,
    /// The user stopped the job.
    Cancelled,
}

impl FailureCategory {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Settings => "Settings",
            Self::Wait => "Wait",
            Self::Source => "Source",
            Self::Network => "Network",
            Self::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDescriptor {
    pub category: FailureCategory,
    pub what: &'static str,
    pub why: &'static str,
    pub fix: &'static str,
}

/// Maps an error kind to a user-facing descriptor.
#[must_use]
pub fn describe(kind: ErrorKind) -> FailureDescriptor {
    match kind {
        ErrorKind::ChallengeRequired => FailureDescriptor {
            category: FailureCategory::Settings,
            what: "Source page is behind an anti-bot challenge",
            why: "The catalog served a challenge page and no challenge relay is configured.",
            fix: "Enable the challenge relay (`[flaresolverr] enabled = true`) and point it at a running solver.",
        },
        ErrorKind::InvalidKey => FailureDescriptor {
            category: FailureCategory::Settings,
            what: "Fast download key rejected",
            why: "The fast download API refused the configured key or the account is not a member.",
            fix: "Update `[fast_download] key` with a valid membership key, or disable the fast lane.",
        },
        ErrorKind::QuotaExhausted => FailureDescriptor {
            category: FailureCategory::Wait,
            what: "Fast download quota used up",
            why: "The account has no fast downloads left for the current period.",
            fix: "Wait for the daily quota to reset; regular mirrors are still used meanwhile.",
        },
        ErrorKind::NoMirrorsFound => FailureDescriptor {
            category: FailureCategory::Source,
            what: "No mirrors found",
            why: "The item page did not list any download mirror.",
            fix: "Check the identifier, or adjust `[source] mirror_patterns` if the page layout changed.",
        },
        ErrorKind::SourceUnreachable => FailureDescriptor {
            category: FailureCategory::Wait,
            what: "Catalog unreachable",
            why: "The item page could not be fetched after several attempts.",
            fix: "Check connectivity and retry later.",
        },
        ErrorKind::TransferTransient => FailureDescriptor {
            category: FailureCategory::Network,
            what: "Transfer interrupted",
            why: "Every mirror failed with timeouts or server errors.",
            fix: "Retry later; partial files are kept when the mirror supports resume.",
        },
        ErrorKind::TransferPermanent => FailureDescriptor {
            category: FailureCategory::Source,
            what: "Mirrors refused the file",
            why: "Every mirror answered with a permanent error such as 404.",
            fix: "The item may have been removed from its mirrors; try another identifier.",
        },
        ErrorKind::BackendUnavailable => FailureDescriptor {
            category: FailureCategory::Network,
            what: "Download backend unreachable",
            why: "The external downloader did not answer on its control endpoint.",
            fix: "Start the external downloader or switch `[downloads] backend` to streaming.",
        },
        ErrorKind::SizeMismatch => FailureDescriptor {
            category: FailureCategory::Source,
            what: "Incomplete file",
            why: "The received size never matched the size the mirror advertised.",
            fix: "Retry later or try another mirror.",
        },
        ErrorKind::InvalidContent => FailureDescriptor {
            category: FailureCategory::Source,
            what: "Mirror returned a web page instead of the file",
            why: "Every mirror served an error page or placeholder.",
            fix: "Try again later; mirrors often rotate their download pages.",
        },
        ErrorKind::Cancelled => FailureDescriptor {
            category: FailureCategory::Cancelled,
            what: "Cancelled",
            why: "The job was cancelled before it finished.",
            fix: "Enqueue the item again to restart it.",
        },
    }
}
