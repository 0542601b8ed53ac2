//! Status command handler: print the saved queue and history.

use anyhow::{Context, Result};
use stacks_core::queue::QueueRepository;
use stacks_core::{DownloadJob, EngineConfig, JsonFileStore, QuotaSnapshot, StatusSnapshot};
use tracing::debug;

pub(crate) async fn run_status_command(config: &EngineConfig) -> Result<()> {
    let snapshot = match &config.queue.state_file {
        Some(path) => {
            let saved = JsonFileStore::new(path)
                .load()
                .await
                .with_context(|| format!("failed to read queue state from {}", path.display()))?;
            StatusSnapshot {
                current: None,
                queue: saved
                    .queued
                    .into_iter()
                    .map(|item| DownloadJob::new(item, config.downloads.backend).summary())
                    .collect(),
                history: saved.history,
                quota: QuotaSnapshot::default(),
            }
        }
        None => {
            debug!("no [queue] state_file configured; nothing is persisted");
            StatusSnapshot::default()
        }
    };

    let json = snapshot
        .to_json_pretty()
        .context("failed to render status")?;
    println!("{json}");
    Ok(())
}
