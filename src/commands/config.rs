//! Config command handler: show effective configuration.

use anyhow::{Context, Result};

use crate::app::config_runtime::LoadedConfig;

pub(crate) fn run_config_show_command(loaded: &LoadedConfig) -> Result<()> {
    let resolved_path = loaded.path.as_ref().map_or_else(
        || "<unresolved>".to_string(),
        |path| path.display().to_string(),
    );
    println!("# config_path = {resolved_path}");
    println!(
        "# config_file = {}",
        if loaded.loaded_from_file {
            "loaded"
        } else {
            "not found (using defaults)"
        }
    );
    let rendered = loaded
        .config
        .to_masked_toml()
        .context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
