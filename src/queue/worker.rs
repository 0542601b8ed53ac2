//! The queue worker: drives one job at a time through the state machine.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{ActiveSlot, HistoryRecord, JobState, Prefetch, QueueManager};
use crate::backend::{BackendDriver, TransferHandle, TransferRequest, TransferState};
use crate::download::{AttemptFailure, FailoverDecision, VerifiedArtifact};
use crate::failure::JobError;
use crate::fastlane::QuotaError;
use crate::resolver::{Mirror, ResolutionError, ResolvedItem};

use super::item::DownloadJob;

/// Totals for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub completed: usize,
    pub failed: usize,
    /// Jobs put back at the head of the queue by a shutdown.
    pub requeued: usize,
}

impl RunStats {
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.failed == 0 && self.requeued == 0
    }
}

/// Why the active job stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Shutdown,
}

enum Stop {
    Interrupted(Interrupt),
    Failed(JobError),
}

impl From<Interrupt> for Stop {
    fn from(interrupt: Interrupt) -> Self {
        Self::Interrupted(interrupt)
    }
}

/// The two tokens every suspension point honors.
struct Tokens<'a> {
    cancel: &'a CancellationToken,
    shutdown: &'a CancellationToken,
}

impl Tokens<'_> {
    fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else if self.shutdown.is_cancelled() {
            Err(Interrupt::Shutdown)
        } else {
            Ok(())
        }
    }

    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            () = self.shutdown.cancelled() => Err(Interrupt::Shutdown),
            out = fut => Ok(out),
        }
    }
}

/// Clears the running flag when the worker exits, however it exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Moves a job, logging transitions the state machine refuses.
fn advance(job: &mut DownloadJob, next: JobState) {
    if let Err(e) = job.transition(next) {
        warn!(id = %job.id(), error = %e, "transition refused");
    }
}

type AttemptResult = Result<VerifiedArtifact, AttemptFailure>;

impl QueueManager {
    pub(super) async fn serve(
        &self,
        shutdown: &CancellationToken,
        until_idle: bool,
    ) -> Result<RunStats, super::QueueError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(super::QueueError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);
        let mut stats = RunStats::default();
        let mut served_any = false;

        info!(until_idle, "queue worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if served_any && !self.runtime.inter_item_delay.is_zero() && self.pending_len() > 0 {
                debug!(
                    delay_secs = self.runtime.inter_item_delay.as_secs(),
                    "pausing between items"
                );
                tokio::select! {
                    () = self.sleeper.sleep(self.runtime.inter_item_delay) => {}
                    () = shutdown.cancelled() => break,
                }
            }

            let Some((id, cancel)) = self.activate_next() else {
                if until_idle {
                    break;
                }
                tokio::select! {
                    () = self.wakeup.notified() => continue,
                    () = shutdown.cancelled() => break,
                }
            };
            self.publish();
            self.persist().await;

            let span = info_span!("job", id = %id);
            let outcome = self
                .drive(&Tokens {
                    cancel: &cancel,
                    shutdown,
                })
                .instrument(span)
                .await;
            match self.finish(outcome) {
                Some(JobState::Completed) => stats.completed += 1,
                Some(_) => stats.failed += 1,
                None => stats.requeued += 1,
            }
            served_any = true;
            self.publish();
            self.persist().await;
        }

        self.abort_prefetch();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            requeued = stats.requeued,
            "queue worker stopped"
        );
        Ok(stats)
    }

    /// Moves the head of the queue into the active slot.
    fn activate_next(&self) -> Option<(super::ItemId, CancellationToken)> {
        let mut state = self.lock();
        if state.active.is_some() {
            return None;
        }
        let mut job = state.pending.pop_front()?;
        advance(&mut job, JobState::Resolving);
        let id = job.id().clone();
        let cancel = CancellationToken::new();
        state.active = Some(ActiveSlot {
            job,
            cancel: cancel.clone(),
            transfer: None,
        });
        Some((id, cancel))
    }

    /// Applies the terminal transition, or re-queues on shutdown.
    ///
    /// Returns the terminal state, or `None` when the job was re-queued.
    fn finish(&self, outcome: Result<VerifiedArtifact, Stop>) -> Option<JobState> {
        let mut state = self.lock();
        let mut slot = state.active.take()?;
        let job = &mut slot.job;
        match outcome {
            Ok(artifact) => {
                job.saved_path = Some(artifact.path.clone());
                job.total_bytes = Some(artifact.size);
                job.bytes_transferred = artifact.size;
                job.mark_mirror_working();
                advance(job, JobState::Completed);
                info!(path = %artifact.path.display(), size = artifact.size, "download completed");
            }
            Err(Stop::Failed(error)) => {
                warn!(error = %error, "download failed");
                if let Err(e) = job.fail(error) {
                    warn!(error = %e, "transition refused");
                }
            }
            Err(Stop::Interrupted(Interrupt::Cancelled)) => {
                info!("download cancelled");
                if let Err(e) = job.fail(JobError::cancelled()) {
                    warn!(error = %e, "transition refused");
                }
            }
            Err(Stop::Interrupted(Interrupt::Shutdown)) => {
                info!("shutdown requested, re-queuing active job");
                job.requeue();
                state.pending.push_front(slot.job);
                return None;
            }
        }
        let terminal = slot.job.state();
        state.history.push(HistoryRecord::from_job(&slot.job));
        Some(terminal)
    }

    /// Runs a closure against the active job.
    fn with_active<R>(&self, f: impl FnOnce(&mut DownloadJob) -> R) -> Result<R, Stop> {
        let mut state = self.lock();
        let slot = state
            .active
            .as_mut()
            .ok_or(Stop::Interrupted(Interrupt::Cancelled))?;
        Ok(f(&mut slot.job))
    }

    fn set_transfer(&self, transfer: Option<(Arc<dyn BackendDriver>, TransferHandle)>) {
        if let Some(slot) = self.lock().active.as_mut() {
            slot.transfer = transfer;
        }
    }

    async fn drive(&self, tokens: &Tokens<'_>) -> Result<VerifiedArtifact, Stop> {
        let (id, title) = self.with_active(|job| (job.id().clone(), job.item.title.clone()))?;

        let mut mirrors: Vec<Mirror> = Vec::new();
        if let Some(fast) = self.fast_lane.as_ref().filter(|f| f.has_quota()) {
            match tokens.guard(fast.request_priority_link(&id)).await? {
                Ok(mirror) => {
                    mirrors.push(mirror);
                    self.with_active(|job| job.used_fast_lane = true)?;
                }
                Err(e @ QuotaError::InvalidKey { .. }) => {
                    self.with_active(|job| job.note(format!("fast lane disabled: {e}")))?;
                }
                Err(e) => {
                    self.with_active(|job| job.note(format!("fast lane skipped: {e}")))?;
                }
            }
        }

        let scraped = match self.take_prefetched(&id, tokens).await? {
            Some(Ok(resolved)) => Ok(resolved),
            _ => tokens.guard(self.resolver.resolve(&id)).await?,
        };
        match scraped {
            Ok(resolved) => {
                if title.is_none() && resolved.title.is_some() {
                    self.with_active(|job| job.item.title.clone_from(&resolved.title))?;
                }
                mirrors.extend(resolved.mirrors);
            }
            Err(e) if !mirrors.is_empty() => {
                warn!(error = %e, "scraping failed, continuing with fast lane mirror");
                self.with_active(|job| job.note(format!("mirror scraping failed: {e}")))?;
            }
            Err(e) => return Err(Stop::Failed(e.to_job_error())),
        }
        tokens.check()?;

        let (mut driver, note) = tokens
            .guard(self.backends.choose(self.runtime.backend))
            .await?;
        let kind = driver.kind();
        self.with_active(|job| {
            job.set_mirrors(mirrors);
            job.backend = kind;
            if let Some(note) = note {
                job.note(note);
            }
            advance(job, JobState::Downloading);
        })?;
        self.publish();
        self.persist().await;

        loop {
            tokens.check()?;
            let (mirror, title) = self.with_active(|job| {
                job.record_attempt();
                (job.current_mirror().cloned(), job.item.title.clone())
            })?;
            let Some(mirror) = mirror else {
                return Err(Stop::Failed(JobError::new(
                    crate::failure::ErrorKind::NoMirrorsFound,
                    "no mirror left to try",
                )));
            };
            debug!(mirror = %mirror, backend = %driver.kind(), "attempting transfer");

            let failure = match self.attempt(&driver, &mirror, title, tokens).await? {
                Ok(artifact) => return Ok(artifact),
                Err(failure) => failure,
            };

            let decision = self.with_active(|job| {
                job.last_error = Some(failure.to_job_error());
                self.policy.decide(job, &failure)
            })?;
            debug!(?decision, error = %failure.to_job_error(), "attempt failed");

            match decision {
                FailoverDecision::RetrySameMirror { delay } => {
                    self.with_active(|job| {
                        job.record_backoff(delay);
                        advance(job, JobState::Downloading);
                    })?;
                    self.publish();
                    tokens.guard(self.sleeper.sleep(delay)).await?;
                }
                FailoverDecision::AdvanceMirror => {
                    self.with_active(|job| {
                        job.advance_mirror();
                        advance(job, JobState::Downloading);
                    })?;
                    self.publish();
                }
                FailoverDecision::SwitchBackend => {
                    driver = Arc::clone(&self.backends.streaming);
                    self.with_active(|job| {
                        job.switch_to_streaming();
                        job.note("external backend unavailable; switched to streaming");
                        advance(job, JobState::Downloading);
                    })?;
                    self.publish();
                }
                FailoverDecision::GiveUp => {
                    self.with_active(DownloadJob::advance_mirror)?;
                    return Err(Stop::Failed(failure.to_job_error()));
                }
            }
        }
    }

    /// One transfer attempt: direct link, start, poll to completion, verify.
    async fn attempt(
        &self,
        driver: &Arc<dyn BackendDriver>,
        mirror: &Mirror,
        title: Option<String>,
        tokens: &Tokens<'_>,
    ) -> Result<AttemptResult, Stop> {
        let url = match tokens.guard(self.resolver.resolve_direct_link(mirror)).await? {
            Ok(url) => url,
            Err(e) => return Ok(Err(AttemptFailure::Transfer(e))),
        };
        let item = self.with_active(|job| job.id().clone())?;
        let request = TransferRequest {
            item,
            url,
            title,
            incomplete_dir: self.runtime.incomplete_dir.clone(),
            output_dir: self.runtime.output_dir.clone(),
        };
        let handle = match tokens.guard(driver.start(request)).await? {
            Ok(handle) => handle,
            Err(e) => return Ok(Err(AttemptFailure::Transfer(e))),
        };
        self.set_transfer(Some((Arc::clone(driver), handle.clone())));
        self.start_prefetch();

        let result = self.watch(driver, &handle, tokens).await;
        self.set_transfer(None);
        if let Err(Stop::Interrupted(_)) = &result {
            if let Err(e) = driver.cancel(&handle).await {
                warn!(error = %e, "backend cancel failed");
            }
        }
        result
    }

    async fn watch(
        &self,
        driver: &Arc<dyn BackendDriver>,
        handle: &TransferHandle,
        tokens: &Tokens<'_>,
    ) -> Result<AttemptResult, Stop> {
        loop {
            tokens.check()?;
            let status = match tokens.guard(driver.poll(handle)).await? {
                Ok(status) => status,
                Err(e) => return Ok(Err(AttemptFailure::Transfer(e))),
            };
            self.with_active(|job| job.record_progress(status.bytes_transferred, status.total_bytes))?;
            self.publish();
            match status.state {
                TransferState::Active => {
                    tokens
                        .guard(self.sleeper.sleep(self.runtime.poll_interval))
                        .await?;
                }
                TransferState::Failed(e) => return Ok(Err(AttemptFailure::Transfer(e))),
                TransferState::Completed => break,
            }
        }

        self.with_active(|job| advance(job, JobState::Verifying))?;
        self.publish();
        match tokens.guard(driver.verify(handle)).await? {
            Ok(artifact) => Ok(Ok(artifact)),
            Err(e) => Ok(Err(AttemptFailure::Verification(e))),
        }
    }

    /// Resolves the next queued item in the background.
    ///
    /// The fast lane is never prefetched; it spends quota.
    fn start_prefetch(&self) {
        if !self.runtime.prefetch {
            return;
        }
        let Some(next) = self.lock().pending.front().map(|job| job.id().clone()) else {
            return;
        };
        let mut slot = self
            .prefetch
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.as_ref().is_some_and(|p| p.id == next) {
            return;
        }
        if let Some(stale) = slot.take() {
            stale.handle.abort();
        }
        debug!(next = %next, "prefetching next item");
        let resolver = Arc::clone(&self.resolver);
        let id = next.clone();
        let handle = tokio::spawn(
            async move { resolver.resolve(&id).await }
                .instrument(info_span!("prefetch", id = %next)),
        );
        *slot = Some(Prefetch { id: next, handle });
    }

    /// The prefetched resolution for `id`, if one was started.
    async fn take_prefetched(
        &self,
        id: &super::ItemId,
        tokens: &Tokens<'_>,
    ) -> Result<Option<Result<ResolvedItem, ResolutionError>>, Interrupt> {
        let prefetch = self
            .prefetch
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(prefetch) = prefetch else {
            return Ok(None);
        };
        if &prefetch.id != id {
            prefetch.handle.abort();
            return Ok(None);
        }
        match tokens.guard(prefetch.handle).await? {
            Ok(result) => {
                debug!(ok = result.is_ok(), "using prefetched resolution");
                Ok(Some(result))
            }
            Err(e) => {
                warn!(error = %e, "prefetch task failed");
                Ok(None)
            }
        }
    }

    fn abort_prefetch(&self) {
        if let Some(prefetch) = self
            .prefetch
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            prefetch.handle.abort();
        }
    }
}
