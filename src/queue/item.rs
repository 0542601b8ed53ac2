//! Queue item and job types.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::QueueError;
use crate::backend::BackendKind;
use crate::clock::unix_millis;
use crate::download::FailoverContext;
use crate::failure::JobError;
use crate::resolver::{Liveness, Mirror};

static BARE_MD5_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{32}$").unwrap_or_else(|e| panic!("invalid static regex: {e}"))
});

static URL_MD5_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/md5/([0-9a-fA-F]{32})(?:[/?#]|$)")
        .unwrap_or_else(|e| panic!("invalid static regex: {e}"))
});

/// Catalog identifier: a lowercase 32-character hex MD5.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Parses a bare MD5 or a URL containing `/md5/<id>`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidIdentifier`] for anything else.
    pub fn parse(input: &str) -> Result<Self, QueueError> {
        let trimmed = input.trim();
        if BARE_MD5_RE.is_match(trimmed) {
            return Ok(Self(trimmed.to_ascii_lowercase()));
        }
        URL_MD5_RE
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .map(|m| Self(m.as_str().to_ascii_lowercase()))
            .ok_or_else(|| QueueError::invalid_identifier(input))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ItemId {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

/// A requested item. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: Option<String>,
    pub size_estimate: Option<u64>,
    pub requested_at_ms: u64,
}

impl Item {
    #[must_use]
    pub fn new(id: ItemId, title: Option<String>) -> Self {
        Self {
            id,
            title: title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            size_estimate: None,
            requested_at_ms: unix_millis(),
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Resolving,
    Downloading,
    Verifying,
    Completed,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Resolving, downloading, or verifying.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Resolving | Self::Downloading | Self::Verifying)
    }

    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::{Completed, Downloading, Failed, Queued, Resolving, Verifying};
        match (self, next) {
            (Queued, Resolving)
            | (Resolving, Downloading)
            | (Downloading, Downloading | Verifying)
            | (Verifying, Completed | Downloading) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mirror plus what this job spent on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMirror {
    #[serde(flatten)]
    pub mirror: Mirror,
    pub attempts: u32,
    /// Total backoff slept before retries on this mirror.
    pub backoff_ms: u64,
}

impl JobMirror {
    fn new(mirror: Mirror) -> Self {
        Self {
            mirror,
            attempts: 0,
            backoff_ms: 0,
        }
    }
}

/// Progress sample used for the transfer rate.
#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: Instant,
    bytes: u64,
}

/// One download job. Only the queue manager mutates it.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub item: Item,
    state: JobState,
    mirrors: Vec<JobMirror>,
    mirror_index: usize,
    pub backend: BackendKind,
    pub backend_switched: bool,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    rate_bytes_per_sec: Option<u64>,
    last_sample: Option<RateSample>,
    pub last_error: Option<JobError>,
    pub notes: Vec<String>,
    pub used_fast_lane: bool,
    pub saved_path: Option<PathBuf>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
}

impl DownloadJob {
    #[must_use]
    pub fn new(item: Item, backend: BackendKind) -> Self {
        Self {
            item,
            state: JobState::Queued,
            mirrors: Vec::new(),
            mirror_index: 0,
            backend,
            backend_switched: false,
            bytes_transferred: 0,
            total_bytes: None,
            rate_bytes_per_sec: None,
            last_sample: None,
            last_error: None,
            notes: Vec::new(),
            used_fast_lane: false,
            saved_path: None,
            created_at_ms: unix_millis(),
            started_at_ms: None,
            finished_at_ms: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ItemId {
        &self.item.id
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Applies a state-machine transition.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] when the move is not allowed.
    pub fn transition(&mut self, next: JobState) -> Result<(), QueueError> {
        if !self.state.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if self.state == JobState::Queued {
            self.started_at_ms = Some(unix_millis());
        }
        if next.is_terminal() {
            self.finished_at_ms = Some(unix_millis());
            self.rate_bytes_per_sec = None;
        }
        self.state = next;
        Ok(())
    }

    /// Terminal failure with `error`. Allowed from any non-terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] when the job already ended.
    pub fn fail(&mut self, error: JobError) -> Result<(), QueueError> {
        self.transition(JobState::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Puts an interrupted job back into `Queued`, keeping its notes.
    pub(crate) fn requeue(&mut self) {
        self.state = JobState::Queued;
        self.mirrors.clear();
        self.mirror_index = 0;
        self.bytes_transferred = 0;
        self.total_bytes = None;
        self.rate_bytes_per_sec = None;
        self.last_sample = None;
        self.started_at_ms = None;
    }

    pub fn set_mirrors(&mut self, mirrors: Vec<Mirror>) {
        self.mirrors = mirrors.into_iter().map(JobMirror::new).collect();
        self.mirror_index = 0;
    }

    #[must_use]
    pub fn mirrors(&self) -> &[JobMirror] {
        &self.mirrors
    }

    #[must_use]
    pub fn mirror_index(&self) -> usize {
        self.mirror_index
    }

    #[must_use]
    pub fn current_mirror(&self) -> Option<&Mirror> {
        self.mirrors.get(self.mirror_index).map(|m| &m.mirror)
    }

    /// Counts a new attempt on the current mirror.
    pub fn record_attempt(&mut self) {
        if let Some(slot) = self.mirrors.get_mut(self.mirror_index) {
            slot.attempts += 1;
        }
        self.bytes_transferred = 0;
        self.total_bytes = None;
        self.rate_bytes_per_sec = None;
        self.last_sample = None;
    }

    pub fn record_backoff(&mut self, delay: Duration) {
        if let Some(slot) = self.mirrors.get_mut(self.mirror_index) {
            let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            slot.backoff_ms = slot.backoff_ms.saturating_add(millis);
        }
    }

    /// Marks the current mirror dead and moves to the next one.
    ///
    /// Returns `false` when no mirror is left.
    pub fn advance_mirror(&mut self) -> bool {
        self.set_current_liveness(Liveness::ConfirmedDead);
        if self.mirror_index + 1 < self.mirrors.len() {
            self.mirror_index += 1;
            true
        } else {
            false
        }
    }

    pub fn mark_mirror_working(&mut self) {
        self.set_current_liveness(Liveness::ConfirmedWorking);
    }

    fn set_current_liveness(&mut self, liveness: Liveness) {
        if let Some(slot) = self.mirrors.get_mut(self.mirror_index) {
            slot.mirror.liveness = liveness;
        }
    }

    /// Switches to the streaming backend. Only once per job.
    pub fn switch_to_streaming(&mut self) {
        self.backend = BackendKind::Streaming;
        self.backend_switched = true;
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Records a progress sample and updates the transfer rate.
    pub fn record_progress(&mut self, bytes: u64, total: Option<u64>) {
        let now = Instant::now();
        if let Some(previous) = self.last_sample {
            let elapsed = now.duration_since(previous.at).as_secs_f64();
            if elapsed > 0.0 && bytes >= previous.bytes {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let rate = ((bytes - previous.bytes) as f64 / elapsed) as u64;
                self.rate_bytes_per_sec = Some(rate);
            }
        }
        self.last_sample = Some(RateSample { at: now, bytes });
        self.bytes_transferred = bytes;
        self.total_bytes = total.or(self.total_bytes);
    }

    #[must_use]
    pub fn rate_bytes_per_sec(&self) -> Option<u64> {
        self.rate_bytes_per_sec
    }

    /// Percentage complete, when the total is known.
    #[must_use]
    pub fn percentage(&self) -> Option<f64> {
        let total = self.total_bytes.filter(|t| *t > 0)?;
        #[allow(clippy::cast_precision_loss)]
        let pct = self.bytes_transferred as f64 * 100.0 / total as f64;
        Some(pct.min(100.0))
    }

    /// Attempts across all mirrors.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.mirrors.iter().map(|m| m.attempts).sum()
    }

    /// The slice of the job the failover policy decides on.
    #[must_use]
    pub fn failover_context(&self) -> FailoverContext {
        FailoverContext {
            mirror_index: self.mirror_index,
            mirror_count: self.mirrors.len(),
            attempts_on_mirror: self
                .mirrors
                .get(self.mirror_index)
                .map_or(0, |m| m.attempts),
            backend: self.backend,
            backend_switched: self.backend_switched,
        }
    }

    /// Display title: the item title, else the identifier.
    #[must_use]
    pub fn display_title(&self) -> String {
        self.item
            .title
            .clone()
            .unwrap_or_else(|| self.item.id.to_string())
    }

    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.item.id.clone(),
            title: self.item.title.clone(),
            state: self.state,
            percentage: self.percentage(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            rate_bytes_per_sec: self.rate_bytes_per_sec,
            mirror: self.current_mirror().map(|m| m.url.clone()),
            mirror_index: self.mirror_index,
            mirror_count: self.mirrors.len(),
            backend: self.backend,
            attempts: self.total_attempts(),
            last_error: self.last_error.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// Serializable view of a queued or active job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: ItemId,
    pub title: Option<String>,
    pub state: JobState,
    pub percentage: Option<f64>,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub rate_bytes_per_sec: Option<u64>,
    pub mirror: Option<String>,
    pub mirror_index: usize,
    pub mirror_count: usize,
    pub backend: BackendKind,
    pub attempts: u32,
    pub last_error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}
