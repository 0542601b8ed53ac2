//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use stacks_core::BackendKind;

/// Resolve, queue, and download catalog items through mirrors.
///
/// Items are identified by their 32-hex-digit MD5 or a URL containing
/// `/md5/<hex>`.
#[derive(Parser, Debug)]
#[command(name = "stacks")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (defaults to $XDG_CONFIG_HOME/stacks/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for verified downloads
    #[arg(short = 'o', long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Transfer backend: streaming or external
    #[arg(long, global = true, value_parser = parse_backend)]
    pub backend: Option<BackendKind>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Queue items and download them one at a time
    Download {
        /// Item identifiers
        #[arg(required = true)]
        ids: Vec<String>,

        /// Title used to name the file (only with a single id)
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Print the mirrors an item resolves to, without downloading
    Resolve {
        /// Item identifier
        id: String,
    },
    /// Show the fast-download quota
    Quota {
        /// Query the API even if the cached value is fresh
        #[arg(long)]
        force: bool,
    },
    /// Print the saved queue and history as JSON
    Status,
    /// Print the effective configuration with secrets masked
    Config,
}

fn parse_backend(raw: &str) -> Result<BackendKind, String> {
    raw.parse()
}

impl Args {
    /// Level implied by `-q`/`-v`, or `None` when neither was given.
    #[must_use]
    pub fn cli_level(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }
}
