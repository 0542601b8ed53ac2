//! Binary runtime: configuration, logging, and command dispatch.

pub(crate) mod config_runtime;
pub(crate) mod exit_handler;
pub(crate) mod progress_manager;

use std::io::IsTerminal;

use anyhow::Result;
use stacks_core::logging;
use tracing::debug;

use crate::cli::{Args, Command};
use crate::commands;
use exit_handler::ProcessExit;

/// Runs the parsed command line to completion.
pub(crate) async fn run(args: Args) -> Result<ProcessExit> {
    let loaded = config_runtime::load_effective_config(&args)?;

    let level = logging::effective_level(args.cli_level(), loaded.config.logging.normalized_level());
    // Held until exit so the file appender flushes.
    let _log_guard = logging::init_tracing(level, loaded.config.logging.directory.as_deref());

    debug!(?args, "CLI arguments parsed");
    debug!(
        path = ?loaded.path,
        from_file = loaded.loaded_from_file,
        "configuration loaded"
    );

    match &args.command {
        Command::Download { ids, title } => {
            let show_progress = !args.quiet && std::io::stderr().is_terminal();
            commands::run_download_command(&loaded.config, ids, title.as_deref(), show_progress)
                .await
        }
        Command::Resolve { id } => {
            commands::run_resolve_command(&loaded.config, id).await?;
            Ok(ProcessExit::Success)
        }
        Command::Quota { force } => {
            commands::run_quota_command(&loaded.config, *force).await?;
            Ok(ProcessExit::Success)
        }
        Command::Status => {
            commands::run_status_command(&loaded.config).await?;
            Ok(ProcessExit::Success)
        }
        Command::Config => {
            commands::run_config_show_command(&loaded)?;
            Ok(ProcessExit::Success)
        }
    }
}
