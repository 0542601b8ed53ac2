//! Tracing subscriber setup.
//!
//! Precedence for the filter: `RUST_LOG`, then the CLI verbosity flags, then
//! `logging.level` from the config file. Events always go to stderr; when a
//! log directory is configured they are also appended to a daily rolling file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// File name prefix of rolling log files.
pub const LOG_FILE_PREFIX: &str = "stacks.log";

/// Picks the filter directive when `RUST_LOG` is absent.
///
/// An explicit CLI level wins; otherwise the configured level is used, and
/// `info` when that one is unrecognized.
#[must_use]
pub fn effective_level<'a>(cli_level: Option<&'a str>, config_level: Option<&'a str>) -> &'a str {
    cli_level.or(config_level).unwrap_or("info")
}

/// Installs the global subscriber.
///
/// Returns the appender guard when file logging is active; drop it only at
/// process exit or buffered lines are lost. A second call is a no-op.
pub fn init_tracing(default_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(dir) {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init();
        tracing::warn!(dir = %dir.display(), error = %e, "log directory unavailable, logging to stderr only");
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Some(guard)
}
