//! CLI command handlers.

mod config;
mod download;
mod quota;
mod resolve;
mod status;

pub(crate) use config::run_config_show_command;
pub(crate) use download::run_download_command;
pub(crate) use quota::run_quota_command;
pub(crate) use resolve::run_resolve_command;
pub(crate) use status::run_status_command;
