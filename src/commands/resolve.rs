//! Resolve command handler: print an item's mirrors without downloading.

use anyhow::{Context, Result};
use stacks_core::{EngineConfig, ItemId, MirrorResolver};
use tracing::info;

pub(crate) async fn run_resolve_command(config: &EngineConfig, input: &str) -> Result<()> {
    let id = ItemId::parse(input).with_context(|| format!("invalid item identifier '{input}'"))?;
    let resolver =
        MirrorResolver::from_config(config).context("failed to set up the mirror resolver")?;

    let resolved = match resolver.resolve(&id).await {
        Ok(resolved) => resolved,
        Err(e) => {
            let hint = e.to_job_error().describe();
            return Err(e).with_context(|| format!("{}. {}", hint.what, hint.fix));
        }
    };
    info!(id = %id, mirrors = resolved.mirrors.len(), "item resolved");

    println!("page: {}", resolved.page_url);
    if let Some(title) = &resolved.title {
        println!("title: {title}");
    }
    for (index, mirror) in resolved.mirrors.iter().enumerate() {
        println!("{:>3}. {} ({})", index + 1, mirror.url, mirror.origin.as_str());
    }
    Ok(())
}
