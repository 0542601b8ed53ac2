//! Status snapshots for presentation layers.
//!
//! A [`StatusSnapshot`] is rebuilt after every queue transition and published
//! on a `watch` channel; pollers can also ask the queue for one at any time.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::fastlane::QuotaSnapshot;
use crate::queue::{HistoryRecord, JobSummary};

/// Everything a dashboard needs in one value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// The job in resolving, downloading, or verifying.
    pub current: Option<JobSummary>,
    /// Queued jobs in service order.
    pub queue: Vec<JobSummary>,
    /// Oldest first.
    pub history: Vec<HistoryRecord>,
    pub quota: QuotaSnapshot,
}

impl StatusSnapshot {
    /// True when nothing is active or queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Renders the snapshot as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; only non-finite floats can trigger it.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Fan-out of snapshots to any number of subscribers.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self { tx }
    }

    /// Replaces the current snapshot. Works with zero subscribers.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.tx.send_replace(snapshot);
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn latest(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }
}
