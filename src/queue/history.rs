//! Bounded, append-only job history.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::item::{DownloadJob, ItemId, JobMirror, JobState};
use crate::backend::BackendKind;
use crate::failure::JobError;

/// Terminal snapshot of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: ItemId,
    pub title: Option<String>,
    pub state: JobState,
    pub backend: BackendKind,
    /// Mirror that produced the artifact, or the last one tried.
    pub mirror: Option<String>,
    pub saved_path: Option<PathBuf>,
    pub total_bytes: Option<u64>,
    pub duration_ms: u64,
    pub error: Option<JobError>,
    pub used_fast_lane: bool,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub mirrors: Vec<JobMirror>,
    pub finished_at_ms: u64,
}

impl HistoryRecord {
    /// Demotes a terminal job to its history record.
    #[must_use]
    pub fn from_job(job: &DownloadJob) -> Self {
        let finished_at_ms = job.finished_at_ms.unwrap_or(job.created_at_ms);
        let started = job.started_at_ms.unwrap_or(job.created_at_ms);
        Self {
            id: job.id().clone(),
            title: job.item.title.clone(),
            state: job.state(),
            backend: job.backend,
            mirror: job.current_mirror().map(|m| m.url.clone()),
            saved_path: job.saved_path.clone(),
            total_bytes: job.total_bytes,
            duration_ms: finished_at_ms.saturating_sub(started),
            error: job.last_error.clone(),
            used_fast_lane: job.used_fast_lane,
            notes: job.notes.clone(),
            mirrors: job.mirrors().to_vec(),
            finished_at_ms,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Completed
    }
}

/// History bounded to `capacity` records; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct History {
    records: VecDeque<HistoryRecord>,
    capacity: usize,
}

impl History {
    /// Creates an empty history. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuilds a history from persisted records, keeping the newest.
    #[must_use]
    pub fn from_records(records: Vec<HistoryRecord>, capacity: usize) -> Self {
        let mut history = Self::new(capacity);
        for record in records {
            history.push(record);
        }
        history
    }

    pub fn push(&mut self, record: HistoryRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<HistoryRecord> {
        self.records.iter().cloned().collect()
    }

    /// Most recent record for `id`.
    #[must_use]
    pub fn latest_for(&self, id: &ItemId) -> Option<&HistoryRecord> {
        self.records.iter().rev().find(|r| &r.id == id)
    }
}
