//! Queue manager: the job state machine and its single-slot scheduler.
//!
//! # Overview
//!
//! The queue system consists of:
//! - [`QueueManager`] - Enqueue, cancel, and serve jobs one at a time
//! - [`DownloadJob`] - Per-item state machine with mirror bookkeeping
//! - [`History`] - Bounded record of finished jobs
//! - [`QueueRepository`] - Optional persistence seam ([`JsonFileStore`])
//! - [`QueueError`] - Operation error types
//!
//! Only the queue manager applies state transitions. Backend drivers report
//! progress and outcomes; the failover policy decides what happens next.
//!
//! # Example
//!
//! ```no_run
//! use stacks_core::config::EngineConfig;
//! use stacks_core::queue::QueueManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = QueueManager::from_config(&EngineConfig::default())?;
//! queue.enqueue("d6e1dc51a50726f00ec438af21952a45", None).await?;
//! let stats = queue.run_until_idle().await?;
//! println!("completed: {}, failed: {}", stats.completed, stats.failed);
//! # Ok(())
//! # }
//! ```

mod error;
mod history;
mod item;
mod store;
mod worker;

pub use error::{PersistenceErrorKind, QueueError};
pub use history::{History, HistoryRecord};
pub use item::{DownloadJob, Item, ItemId, JobMirror, JobState, JobSummary};
pub use store::{JsonFileStore, PersistedQueue, QueueRepository};
pub use worker::RunStats;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    BackendDriver, BackendKind, BackendSet, ExternalDriver, StreamingDriver, TransferHandle,
};
use crate::clock::{Sleeper, TokioSleeper};
use crate::config::EngineConfig;
use crate::download::{FailoverPolicy, HttpClient};
use crate::failure::JobError;
use crate::fastlane::{FastLaneClient, QuotaSnapshot};
use crate::resolver::{MirrorResolver, ResolutionError, ResolvedItem};
use crate::status::{StatusPublisher, StatusSnapshot};

/// Settings the worker reads on every job.
#[derive(Debug, Clone)]
struct Runtime {
    backend: BackendKind,
    poll_interval: Duration,
    inter_item_delay: Duration,
    prefetch: bool,
    output_dir: PathBuf,
    incomplete_dir: PathBuf,
}

impl Runtime {
    fn from_config(config: &EngineConfig) -> Self {
        Self {
            backend: config.downloads.backend,
            poll_interval: config.downloads.poll_interval(),
            inter_item_delay: config.downloads.inter_item_delay(),
            prefetch: config.downloads.prefetch,
            output_dir: config.output_dir.clone(),
            incomplete_dir: config.incomplete_dir(),
        }
    }
}

/// The job occupying the single active slot.
struct ActiveSlot {
    job: DownloadJob,
    cancel: CancellationToken,
    transfer: Option<(Arc<dyn BackendDriver>, TransferHandle)>,
}

struct QueueState {
    pending: VecDeque<DownloadJob>,
    active: Option<ActiveSlot>,
    history: History,
}

impl QueueState {
    fn contains(&self, id: &ItemId) -> bool {
        self.active.as_ref().is_some_and(|slot| slot.job.id() == id)
            || self.pending.iter().any(|job| job.id() == id)
    }
}

/// Background resolution of the next queued item.
struct Prefetch {
    id: ItemId,
    handle: JoinHandle<Result<ResolvedItem, ResolutionError>>,
}

/// Owns the queue, the active job, and the history.
pub struct QueueManager {
    resolver: Arc<MirrorResolver>,
    fast_lane: Option<Arc<FastLaneClient>>,
    backends: BackendSet,
    policy: FailoverPolicy,
    runtime: Runtime,
    sleeper: Arc<dyn Sleeper>,
    store: Option<Arc<dyn QueueRepository>>,
    publisher: StatusPublisher,
    state: Mutex<QueueState>,
    prefetch: Mutex<Option<Prefetch>>,
    /// Orders snapshot-then-save so a stale snapshot never lands last.
    save_order: tokio::sync::Mutex<()>,
    wakeup: Notify,
    running: AtomicBool,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("resolver", &self.resolver)
            .field("fast_lane", &self.fast_lane.is_some())
            .field("backends", &self.backends)
            .field("policy", &self.policy)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates a queue over already-built components.
    #[must_use]
    pub fn new(config: &EngineConfig, resolver: MirrorResolver, backends: BackendSet) -> Self {
        Self {
            resolver: Arc::new(resolver),
            fast_lane: None,
            backends,
            policy: FailoverPolicy::from_settings(&config.downloads),
            runtime: Runtime::from_config(config),
            sleeper: Arc::new(TokioSleeper),
            store: None,
            publisher: StatusPublisher::new(),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: None,
                history: History::new(config.queue.max_history),
            }),
            prefetch: Mutex::new(None),
            save_order: tokio::sync::Mutex::new(()),
            wakeup: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Builds every component described by `config`.
    ///
    /// Call [`restore`](Self::restore) afterwards to load a saved queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Setup`] when a component cannot be built.
    pub fn from_config(config: &EngineConfig) -> Result<Self, QueueError> {
        let resolver =
            MirrorResolver::from_config(config).map_err(|e| QueueError::setup("resolver", e))?;
        let client = HttpClient::new_with_timeouts(
            config.downloads.connect_timeout_secs,
            config.downloads.read_timeout_secs,
        )
        .map_err(|e| QueueError::setup("HTTP client", e))?;
        let streaming: Arc<dyn BackendDriver> = Arc::new(StreamingDriver::new(client));
        let external = if config.downloads.backend == BackendKind::External {
            let driver = ExternalDriver::new(&config.external)
                .map_err(|e| QueueError::setup("external backend", e))?;
            Some(Arc::new(driver) as Arc<dyn BackendDriver>)
        } else {
            None
        };

        let mut manager = Self::new(config, resolver, BackendSet { streaming, external });
        if let Some(fast_lane) = FastLaneClient::from_settings(&config.fast_download)
            .map_err(|e| QueueError::setup("fast lane", e))?
        {
            manager = manager.with_fast_lane(fast_lane);
        }
        if let Some(path) = &config.queue.state_file {
            manager = manager.with_store(Arc::new(JsonFileStore::new(path)));
        }
        Ok(manager)
    }

    #[must_use]
    pub fn with_fast_lane(mut self, fast_lane: FastLaneClient) -> Self {
        self.fast_lane = Some(Arc::new(fast_lane));
        self
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn QueueRepository>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn fast_lane(&self) -> Option<&FastLaneClient> {
        self.fast_lane.as_deref()
    }

    #[must_use]
    pub fn resolver(&self) -> &MirrorResolver {
        &self.resolver
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the saved queue and history, if a store is configured.
    ///
    /// Returns the number of restored queued items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Persistence`] when the store cannot be read.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize, QueueError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let saved = store.load().await?;
        let restored = {
            let mut state = self.lock();
            let capacity = state.history.capacity();
            let mut restored = 0;
            for item in saved.queued {
                if state.contains(&item.id) {
                    continue;
                }
                state
                    .pending
                    .push_back(DownloadJob::new(item, self.runtime.backend));
                restored += 1;
            }
            state.history = History::from_records(saved.history, capacity);
            restored
        };
        if restored > 0 {
            info!(restored, "queue restored");
            self.wakeup.notify_one();
        }
        self.publish();
        Ok(restored)
    }

    /// Validates and appends an item. Returns immediately.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidIdentifier`] for malformed input
    /// - [`QueueError::DuplicateItem`] when the item is queued or active
    #[instrument(skip(self))]
    pub async fn enqueue(
        &self,
        input: &str,
        title: Option<String>,
    ) -> Result<JobSummary, QueueError> {
        let id = ItemId::parse(input)?;
        let summary = {
            let mut state = self.lock();
            if state.contains(&id) {
                return Err(QueueError::DuplicateItem { id: id.to_string() });
            }
            let job = DownloadJob::new(Item::new(id, title), self.runtime.backend);
            let summary = job.summary();
            state.pending.push_back(job);
            summary
        };
        debug!(id = %summary.id, "item queued");
        self.wakeup.notify_one();
        self.publish();
        self.persist().await;
        Ok(summary)
    }

    /// Cancels a queued or active job.
    ///
    /// A queued job goes straight to history as cancelled. The active job's
    /// token is triggered and its transfer cancelled; the worker records the
    /// terminal state at its next tick.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidIdentifier`] for malformed input
    /// - [`QueueError::ItemNotFound`] when nothing queued or active matches
    #[instrument(skip(self))]
    pub async fn cancel(&self, input: &str) -> Result<(), QueueError> {
        let id = ItemId::parse(input)?;
        let transfer = {
            let mut state = self.lock();
            if let Some(pos) = state.pending.iter().position(|job| job.id() == &id) {
                if let Some(mut job) = state.pending.remove(pos) {
                    job.fail(JobError::cancelled())?;
                    state.history.push(HistoryRecord::from_job(&job));
                }
                None
            } else if let Some(slot) = state.active.as_ref().filter(|s| s.job.id() == &id) {
                slot.cancel.cancel();
                slot.transfer.clone()
            } else {
                return Err(QueueError::ItemNotFound { id: id.to_string() });
            }
        };

        if let Some((driver, handle)) = transfer {
            if let Err(e) = driver.cancel(&handle).await {
                warn!(error = %e, "backend cancel failed");
            }
        }
        info!(id = %id, "job cancelled");
        self.publish();
        self.persist().await;
        Ok(())
    }

    /// Current status.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let quota = self
            .fast_lane
            .as_ref()
            .map(|fast| QuotaSnapshot {
                enabled: fast.is_available(),
                state: fast.quota(),
            })
            .unwrap_or_default();
        let state = self.lock();
        StatusSnapshot {
            current: state.active.as_ref().map(|slot| slot.job.summary()),
            queue: state.pending.iter().map(DownloadJob::summary).collect(),
            history: state.history.to_vec(),
            quota,
        }
    }

    /// Snapshots published after every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.publisher.subscribe()
    }

    #[must_use]
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.lock().history.to_vec()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Serves the queue until `shutdown` fires.
    ///
    /// An interrupted active job is re-queued at the head.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AlreadyRunning`] when another worker is serving.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunStats, QueueError> {
        self.serve(&shutdown, false).await
    }

    /// Serves until the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AlreadyRunning`] when another worker is serving.
    pub async fn run_until_idle(&self) -> Result<RunStats, QueueError> {
        self.serve(&CancellationToken::new(), true).await
    }

    /// Serves until the queue is empty or `shutdown` fires, whichever is first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AlreadyRunning`] when another worker is serving.
    pub async fn drain(&self, shutdown: CancellationToken) -> Result<RunStats, QueueError> {
        self.serve(&shutdown, true).await
    }

    fn publish(&self) {
        self.publisher.publish(self.snapshot());
    }

    fn persisted(&self) -> PersistedQueue {
        let state = self.lock();
        let active = state
            .active
            .as_ref()
            .filter(|slot| !slot.job.state().is_terminal())
            .map(|slot| slot.job.item.clone());
        PersistedQueue {
            version: 0,
            queued: active
                .into_iter()
                .chain(state.pending.iter().map(|job| job.item.clone()))
                .collect(),
            history: state.history.to_vec(),
        }
    }

    /// Best-effort save; a failing store never stops the queue.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _ordered = self.save_order.lock().await;
        if let Err(e) = store.save(&self.persisted()).await {
            warn!(error = %e, "failed to save queue state");
        }
    }
}
