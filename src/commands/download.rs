//! Download command handler: queue items and serve them until idle.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use stacks_core::clock::unix_millis;
use stacks_core::{EngineConfig, HistoryRecord, ItemId, QueueError, QueueManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::exit_handler::{ProcessExit, determine_exit_outcome};
use crate::app::progress_manager::spawn_progress_ui;

pub(crate) async fn run_download_command(
    config: &EngineConfig,
    inputs: &[String],
    title: Option<&str>,
    show_progress: bool,
) -> Result<ProcessExit> {
    // Reject malformed input before anything is queued or persisted.
    let ids = inputs
        .iter()
        .map(|raw| {
            ItemId::parse(raw).with_context(|| format!("invalid item identifier '{raw}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    if title.is_some() && ids.len() > 1 {
        bail!("--title names a single item; got {} identifiers", ids.len());
    }

    let manager =
        QueueManager::from_config(config).context("failed to set up the download queue")?;
    manager
        .restore()
        .await
        .context("failed to restore the saved queue")?;

    for id in &ids {
        match manager.enqueue(id.as_str(), title.map(str::to_string)).await {
            Ok(summary) => info!(id = %summary.id, "queued"),
            Err(QueueError::DuplicateItem { id }) => warn!(%id, "already queued, skipping"),
            Err(e) => return Err(e).context("failed to queue item"),
        }
    }

    let total = manager.pending_len();
    let shutdown = CancellationToken::new();
    let signal = spawn_interrupt_listener(shutdown.clone());
    let (progress, stop) = spawn_progress_ui(show_progress, manager.subscribe(), total);

    let started_ms = unix_millis();
    let result = manager.drain(shutdown).await;

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress {
        let _ = handle.await;
    }
    signal.abort();
    let stats = result.context("download queue stopped")?;

    let requested: HashSet<&ItemId> = ids.iter().collect();
    for record in manager
        .history()
        .iter()
        .filter(|r| r.finished_at_ms >= started_ms && requested.contains(&r.id))
    {
        print_outcome(record);
    }
    if stats.requeued > 0 {
        warn!(
            requeued = stats.requeued,
            "interrupted; unfinished items stay queued"
        );
    }
    info!(
        completed = stats.completed,
        failed = stats.failed,
        requeued = stats.requeued,
        "download run finished"
    );

    Ok(determine_exit_outcome(&stats))
}

fn spawn_interrupt_listener(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            shutdown.cancel();
        }
    })
}

fn print_outcome(record: &HistoryRecord) {
    let name = record
        .title
        .clone()
        .unwrap_or_else(|| record.id.to_string());
    if record.succeeded() {
        let path = record
            .saved_path
            .as_ref()
            .map_or_else(String::new, |p| format!(" -> {}", p.display()));
        println!("done    {name}{path}");
        return;
    }
    match &record.error {
        Some(error) => {
            let hint = error.describe();
            println!("failed  {name}: {error}");
            println!("        {} [{}]: {}", hint.what, hint.category.label(), hint.fix);
        }
        None => println!("failed  {name}"),
    }
}
