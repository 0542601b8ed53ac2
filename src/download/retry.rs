//! Retry and failover policy with exponential backoff.
//!
//! When a transfer attempt fails, the failure is first classified into a
//! [`TransferError`] (or arrives as a [`VerificationError`]). The
//! [`FailoverPolicy`] then makes a pure decision:
//!
//! - [`FailoverDecision::RetrySameMirror`] - transient failure, budget left on this mirror
//! - [`FailoverDecision::AdvanceMirror`] - permanent failure, or this mirror's budget is spent
//! - [`FailoverDecision::SwitchBackend`] - the external backend is unreachable (once per job)
//! - [`FailoverDecision::GiveUp`] - no mirror left to try
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stacks_core::backend::BackendKind;
//! use stacks_core::download::{
//!     AttemptFailure, FailoverContext, FailoverDecision, FailoverPolicy, TransferError,
//! };
//!
//! let policy = FailoverPolicy::new(3, Duration::ZERO, Duration::ZERO);
//! let context = FailoverContext {
//!     mirror_index: 0,
//!     mirror_count: 2,
//!     attempts_on_mirror: 1,
//!     backend: BackendKind::Streaming,
//!     backend_switched: false,
//! };
//! let failure = AttemptFailure::Transfer(TransferError::permanent("HTTP 404"));
//! assert_eq!(policy.decide_for(&context, &failure), FailoverDecision::AdvanceMirror);
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::constants::{MAX_JITTER, MAX_RETRY_AFTER};
use super::error::{DownloadError, TransferError};
use super::verify::VerificationError;
use crate::backend::BackendKind;
use crate::config::DownloadSettings;
use crate::failure::JobError;
use crate::queue::DownloadJob;
use crate::resolver::FetchError;

/// Default per-mirror attempt cap.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Exponential backoff bounded by a maximum delay.
///
/// ```text
/// delay = min(min(base * 2^(attempt-1), max) + jitter, max)
/// ```
///
/// Jitter is uniform in `[0, min(500ms, max/10)]`, so a zero maximum yields
/// zero delays (useful in tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base: base.min(max),
            max,
        }
    }

    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (1-indexed: the first retry follows attempt 1).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let exponential = self
            .base
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        (exponential + self.jitter()).min(self.max)
    }

    fn jitter(&self) -> Duration {
        let bound = MAX_JITTER.min(self.max / 10);
        let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(0);
        if bound_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound_ms))
    }
}

/// Why an attempt failed: during transfer or during verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    Transfer(TransferError),
    Verification(VerificationError),
}

impl AttemptFailure {
    #[must_use]
    pub fn to_job_error(&self) -> JobError {
        match self {
            Self::Transfer(error) => error.to_job_error(),
            Self::Verification(error) => error.to_job_error(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transfer(TransferError::Transient { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

/// Outcome of [`FailoverPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    /// Try the same mirror again after `delay`.
    RetrySameMirror { delay: Duration },
    /// Move to the next mirror immediately.
    AdvanceMirror,
    /// Retry the same mirror on the streaming backend.
    SwitchBackend,
    /// No mirror left; the job fails.
    GiveUp,
}

/// The parts of a job the policy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverContext {
    /// Index of the mirror that just failed.
    pub mirror_index: usize,
    pub mirror_count: usize,
    /// Attempts made on the current mirror, including the failed one.
    pub attempts_on_mirror: u32,
    pub backend: BackendKind,
    /// Whether this job already switched backends once.
    pub backend_switched: bool,
}

/// Per-mirror retry cap plus backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPolicy {
    per_mirror_cap: u32,
    backoff: Backoff,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            per_mirror_cap: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

impl FailoverPolicy {
    /// Creates a policy. A cap of zero is raised to one.
    #[must_use]
    pub fn new(per_mirror_cap: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            per_mirror_cap: per_mirror_cap.max(1),
            backoff: Backoff::new(base_delay, max_delay),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &DownloadSettings) -> Self {
        Self::new(
            settings.retry_count,
            Duration::from_millis(settings.backoff_base_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    #[must_use]
    pub fn per_mirror_cap(&self) -> u32 {
        self.per_mirror_cap
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Decides the next step for `job` after `failure`.
    #[must_use]
    pub fn decide(&self, job: &DownloadJob, failure: &AttemptFailure) -> FailoverDecision {
        self.decide_for(&job.failover_context(), failure)
    }

    /// Decision over an explicit context.
    #[instrument(level = "debug", skip(self), fields(cap = self.per_mirror_cap))]
    pub fn decide_for(
        &self,
        context: &FailoverContext,
        failure: &AttemptFailure,
    ) -> FailoverDecision {
        let transient = match failure {
            AttemptFailure::Transfer(TransferError::BackendUnavailable { .. })
                if context.backend == BackendKind::External && !context.backend_switched =>
            {
                debug!("external backend unreachable, switching to streaming");
                return FailoverDecision::SwitchBackend;
            }
            AttemptFailure::Transfer(TransferError::Permanent { .. })
            | AttemptFailure::Verification(VerificationError::InvalidContent { .. }) => false,
            AttemptFailure::Transfer(
                TransferError::Transient { .. } | TransferError::BackendUnavailable { .. },
            )
            | AttemptFailure::Verification(VerificationError::SizeMismatch { .. }) => true,
        };

        if transient && context.attempts_on_mirror < self.per_mirror_cap {
            let mut delay = self.backoff.delay(context.attempts_on_mirror);
            if let Some(requested) = failure.retry_after() {
                delay = delay.max(requested).min(self.backoff.max());
            }
            debug!(
                attempt = context.attempts_on_mirror,
                delay_ms = delay.as_millis(),
                "retrying same mirror"
            );
            return FailoverDecision::RetrySameMirror { delay };
        }

        if context.mirror_index + 1 < context.mirror_count {
            debug!(
                mirror_index = context.mirror_index,
                transient, "advancing to next mirror"
            );
            FailoverDecision::AdvanceMirror
        } else {
            debug!(mirror_count = context.mirror_count, "mirrors exhausted");
            FailoverDecision::GiveUp
        }
    }
}

/// Classifies a streaming transfer error.
///
/// # HTTP Status Code Classification
///
/// | Status | Class | Rationale |
/// |--------|-------|-----------|
/// | 408 | Transient | Request timeout - may succeed |
/// | 429 | Transient | Rate limited - retry after backoff / Retry-After |
/// | 5xx | Transient | Server may recover |
/// | 401, 403 | Permanent | This mirror refuses us |
/// | 404, 410, 451 | Permanent | Not here, not coming back |
/// | other 4xx | Permanent | Request won't change on retry |
///
/// # Non-HTTP Errors
///
/// | Error | Class |
/// |-------|-------|
/// | Timeout | Transient |
/// | Network (TLS) | Permanent |
/// | Network (other) | Transient |
/// | IO | Permanent |
/// | InvalidUrl | Permanent |
/// | UnexpectedContent | Permanent |
/// | Cancelled | Permanent |
#[must_use]
pub fn classify_error(error: &DownloadError) -> TransferError {
    match error {
        DownloadError::HttpStatus {
            status,
            retry_after,
            ..
        } => classify_http_status(*status, retry_after.as_deref(), error.to_string()),
        DownloadError::Timeout { .. } => TransferError::transient(error.to_string()),
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                TransferError::permanent(error.to_string())
            } else {
                TransferError::transient(error.to_string())
            }
        }
        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::UnexpectedContent { .. }
        | DownloadError::Cancelled { .. } => TransferError::permanent(error.to_string()),
    }
}

/// Classifies a page-fetch transport error (mirror page follow-through).
#[must_use]
pub fn classify_fetch_error(error: &FetchError) -> TransferError {
    match error {
        FetchError::InvalidUrl { .. } => TransferError::permanent(error.to_string()),
        FetchError::Network { source, .. } if is_tls_error(source) => {
            TransferError::permanent(error.to_string())
        }
        FetchError::Timeout { .. } | FetchError::Network { .. } | FetchError::Relay { .. } => {
            TransferError::transient(error.to_string())
        }
    }
}

/// Classifies an HTTP status code.
#[must_use]
pub fn classify_http_status(
    status: u16,
    retry_after: Option<&str>,
    message: String,
) -> TransferError {
    if is_transient_status(status) {
        TransferError::Transient {
            message,
            retry_after: retry_after.and_then(parse_retry_after),
        }
    } else {
        TransferError::Permanent { message }
    }
}

/// True for statuses worth retrying against the same server.
#[must_use]
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Parses a Retry-After header value: integer seconds or an HTTP-date.
///
/// Values are capped at one hour; negative values and past dates yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let duration = datetime.duration_since(std::time::SystemTime::now()).ok()?;
    Some(duration.min(MAX_RETRY_AFTER))
}
