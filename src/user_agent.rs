//! Shared User-Agent strings for transfer and page-fetch HTTP clients.

/// Browser-like User-Agent for fetching catalog and mirror pages.
///
/// Mirror pages commonly reject non-browser agents outright.
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Default User-Agent for file transfers (identifies the tool).
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("stacks/{version} (download-manager)")
}

/// User-Agent for page fetches.
#[must_use]
pub(crate) fn default_page_user_agent() -> String {
    BROWSER_USER_AGENT.to_string()
}
