//! Shared HTTP client construction for page fetches (catalog, mirror pages, relay).

use std::time::Duration;

use reqwest::Client;

use crate::user_agent;

/// Connect timeout for page fetches.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Read timeout for page fetches.
pub const READ_TIMEOUT_SECS: u64 = 30;

/// Builds the client used for catalog and mirror pages.
///
/// Uses a browser User-Agent and keeps cookies between requests so that a
/// mirror page and its follow-up file link share a session.
///
/// # Errors
///
/// Returns the reqwest builder error when TLS or proxy setup fails.
pub fn build_page_client() -> Result<Client, reqwest::Error> {
    build_page_client_with_timeouts(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        Duration::from_secs(READ_TIMEOUT_SECS),
    )
}

/// Builds a page client with explicit timeouts.
///
/// # Errors
///
/// Returns the reqwest builder error when TLS or proxy setup fails.
pub fn build_page_client_with_timeouts(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(read_timeout)
        .gzip(true)
        .cookie_store(true)
        .user_agent(user_agent::default_page_user_agent())
        .build()
}
