//! Effective configuration: file values with CLI overrides applied.

use std::path::PathBuf;

use anyhow::{Context, Result};
use stacks_core::{EngineConfig, resolve_default_config_path};

use crate::cli::Args;

/// Configuration plus where it came from.
#[derive(Debug, Clone)]
pub(crate) struct LoadedConfig {
    pub(crate) config: EngineConfig,
    pub(crate) path: Option<PathBuf>,
    pub(crate) loaded_from_file: bool,
}

/// Loads the config file named by `--config`, else the default path, then
/// applies `--output-dir` and `--backend`.
///
/// An explicit `--config` must exist; a missing default file means defaults.
pub(crate) fn load_effective_config(args: &Args) -> Result<LoadedConfig> {
    let (mut config, path, loaded_from_file) = match &args.config {
        Some(path) => {
            let config = EngineConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            (config, Some(path.clone()), true)
        }
        None => match resolve_default_config_path() {
            Some(path) => {
                let exists = path.is_file();
                let config = EngineConfig::load_or_default(&path)
                    .with_context(|| format!("failed to load config from {}", path.display()))?;
                (config, Some(path), exists)
            }
            None => (EngineConfig::default(), None, false),
        },
    };

    apply_overrides(&mut config, args);
    config
        .validate()
        .context("invalid configuration after applying command-line overrides")?;

    Ok(LoadedConfig {
        config,
        path,
        loaded_from_file,
    })
}

fn apply_overrides(config: &mut EngineConfig, args: &Args) {
    if let Some(dir) = &args.output_dir {
        config.output_dir.clone_from(dir);
    }
    if let Some(backend) = args.backend {
        config.downloads.backend = backend;
    }
}
