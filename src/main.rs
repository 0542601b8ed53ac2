//! CLI entry point for stacks.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

mod app;
mod cli;
mod commands;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let exit = app::run(args).await?;
    Ok(exit.into())
}
