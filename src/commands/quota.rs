//! Quota command handler: refresh and print the fast-download quota.

use anyhow::{Context, Result, bail};
use stacks_core::{EngineConfig, FastLaneClient, QuotaError, QuotaSnapshot};
use tracing::warn;

pub(crate) async fn run_quota_command(config: &EngineConfig, force: bool) -> Result<()> {
    let Some(client) = FastLaneClient::from_settings(&config.fast_download)
        .context("failed to set up the fast download client")?
    else {
        warn!("fast lane disabled; set [fast_download] enabled = true and a key");
        print_snapshot(&QuotaSnapshot::default())?;
        return Ok(());
    };

    match client.refresh(force).await {
        Ok(_) | Err(QuotaError::Exhausted) => {}
        Err(e) => {
            if let Some(job_error) = e.to_job_error() {
                bail!("{e}\n  {}", job_error.describe().fix);
            }
            return Err(e).context("quota refresh failed");
        }
    }

    print_snapshot(&QuotaSnapshot {
        enabled: client.is_available(),
        state: client.quota(),
    })
}

fn print_snapshot(snapshot: &QuotaSnapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("failed to render quota")?;
    println!("{json}");
    Ok(())
}
