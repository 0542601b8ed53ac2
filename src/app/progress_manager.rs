//! Progress UI (bar) for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use stacks_core::{JobSummary, StatusSnapshot};
use tokio::sync::watch;

const TICK: Duration = Duration::from_millis(120);

/// Spawns the progress UI when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_bar` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_bar: bool,
    status: watch::Receiver<StatusSnapshot>,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_bar {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bar_inner(status, total, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_bar_inner(
    status: watch::Receiver<StatusSnapshot>,
    total: usize,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let snapshot = status.borrow().clone();
            if let Some(job) = &snapshot.current {
                bar.set_length(job.total_bytes.unwrap_or(0));
                bar.set_position(job.bytes_transferred);
            }
            bar.set_message(progress_message(&snapshot, total));
            tokio::time::sleep(TICK).await;
        }

        bar.finish_and_clear();
    })
}

/// One-line description of where the run stands.
pub(crate) fn progress_message(snapshot: &StatusSnapshot, total: usize) -> String {
    let done = total.saturating_sub(snapshot.queue.len() + usize::from(snapshot.current.is_some()));
    match &snapshot.current {
        Some(job) => format!(
            "[{}/{}] {} {}",
            (done + 1).min(total.max(1)),
            total,
            job.state,
            describe_job(job)
        ),
        None => format!("[{done}/{total}] waiting"),
    }
}

fn describe_job(job: &JobSummary) -> String {
    let title = job.title.clone().unwrap_or_else(|| job.id.to_string());
    let host = job
        .mirror
        .as_deref()
        .and_then(|m| url::Url::parse(m).ok())
        .and_then(|u| u.host_str().map(str::to_string));
    match host {
        Some(host) => format!(
            "{title} via {host} (mirror {}/{})",
            job.mirror_index + 1,
            job.mirror_count
        ),
        None => title,
    }
}
