//! Mirror resolution: item identifier to ordered candidate download URLs.
//!
//! # Architecture
//!
//! - [`PageFetcher`] - Async trait for page fetches, implemented by
//!   [`HttpPageFetcher`] and the [`ChallengeRelay`]
//! - [`MirrorResolver`] - Fetches the item's source page (through the relay
//!   when a challenge is served), extracts and absolutizes mirror links
//! - [`Mirror`] - A candidate URL with its origin and per-job liveness
//!
//! # Example
//!
//! ```no_run
//! use stacks_core::config::EngineConfig;
//! use stacks_core::queue::ItemId;
//! use stacks_core::resolver::MirrorResolver;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = MirrorResolver::from_config(&EngineConfig::default())?;
//! let id = ItemId::parse("d6e1dc51a50726f00ec438af21952a45")?;
//! let resolved = resolver.resolve(&id).await?;
//! for mirror in &resolved.mirrors {
//!     println!("{}", mirror.url);
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod fetch;
mod http_client;
mod relay;
mod utils;

pub use error::{FetchError, ResolutionError};
pub use fetch::{FetchedPage, HttpPageFetcher, PageFetcher};
pub use http_client::{build_page_client, build_page_client_with_timeouts};
pub use relay::ChallengeRelay;
pub use utils::{
    absolutize_url, extract_mirror_links, extract_title, find_direct_link, is_challenge_body,
    is_challenge_page, prioritize_preferred, usable_title,
};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::clock::{Sleeper, TokioSleeper};
use crate::config::EngineConfig;
use crate::download::{
    Backoff, TransferError, classify_fetch_error, classify_http_status, is_transient_status,
    parse_retry_after,
};
use crate::queue::ItemId;

/// Where a mirror came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorOrigin {
    Scraped,
    FastLane,
    Fallback,
}

impl MirrorOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scraped => "scraped",
            Self::FastLane => "fast_lane",
            Self::Fallback => "fallback",
        }
    }
}

/// What this job has learned about a mirror. Never shared across jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Unknown,
    ConfirmedWorking,
    ConfirmedDead,
}

/// A candidate download URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    /// Absolute URL.
    pub url: String,
    pub origin: MirrorOrigin,
    #[serde(default)]
    pub liveness: Liveness,
}

impl Mirror {
    #[must_use]
    pub fn new(url: &Url, origin: MirrorOrigin) -> Self {
        Self {
            url: url.to_string(),
            origin,
            liveness: Liveness::Unknown,
        }
    }

    #[must_use]
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
    }
}

impl fmt::Display for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.origin.as_str())
    }
}

/// Resolution output: ordered mirrors plus what the page told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub page_url: String,
    pub title: Option<String>,
    pub mirrors: Vec<Mirror>,
}

/// One source-page fetch attempt that did not produce a usable page.
enum AttemptOutcome {
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
    Fatal(ResolutionError),
}

/// Resolves item identifiers into mirrors.
pub struct MirrorResolver {
    direct: Arc<dyn PageFetcher>,
    relay: Option<Arc<dyn PageFetcher>>,
    source_base: Url,
    patterns: Vec<String>,
    prefer_mirror: Option<String>,
    attempts: u32,
    backoff: Backoff,
    follow_mirror_pages: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for MirrorResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorResolver")
            .field("direct", &self.direct.name())
            .field("relay", &self.relay.as_ref().map(|r| r.name()))
            .field("source_base", &self.source_base.as_str())
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl MirrorResolver {
    /// Creates a resolver with default patterns and retry settings.
    #[must_use]
    pub fn new(direct: Arc<dyn PageFetcher>, source_base: Url) -> Self {
        let defaults = EngineConfig::default();
        Self {
            direct,
            relay: None,
            source_base: with_trailing_slash(source_base),
            patterns: defaults.source.mirror_patterns,
            prefer_mirror: None,
            attempts: defaults.downloads.resolve_attempts,
            backoff: Backoff::new(
                Duration::from_millis(defaults.downloads.backoff_base_ms),
                Duration::from_millis(defaults.downloads.backoff_max_ms),
            ),
            follow_mirror_pages: true,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Builds the resolver described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the source or relay URL is malformed or
    /// an HTTP client cannot be built.
    pub fn from_config(config: &EngineConfig) -> Result<Self, FetchError> {
        let source_base =
            Url::parse(&config.source.base_url).map_err(|_| FetchError::InvalidUrl {
                url: config.source.base_url.clone(),
            })?;
        let direct = HttpPageFetcher::new()
            .map_err(|e| FetchError::network(config.source.base_url.as_str(), e))?;

        let downloads = &config.downloads;
        let mut resolver = Self::new(Arc::new(direct), source_base)
            .with_patterns(config.source.mirror_patterns.clone())
            .with_prefer_mirror(downloads.prefer_mirror.clone())
            .with_retry(
                downloads.resolve_attempts,
                Backoff::new(
                    Duration::from_millis(downloads.backoff_base_ms),
                    Duration::from_millis(downloads.backoff_max_ms),
                ),
            )
            .with_follow_mirror_pages(downloads.follow_mirror_pages);

        if config.flaresolverr.enabled {
            let relay = ChallengeRelay::new(&config.flaresolverr)?;
            resolver = resolver.with_relay(Arc::new(relay));
        }
        Ok(resolver)
    }

    #[must_use]
    pub fn with_relay(mut self, relay: Arc<dyn PageFetcher>) -> Self {
        self.relay = Some(relay);
        self
    }

    #[must_use]
    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    #[must_use]
    pub fn with_prefer_mirror(mut self, prefer_mirror: Option<String>) -> Self {
        self.prefer_mirror = prefer_mirror;
        self
    }

    /// Sets the source-page attempt budget; zero is raised to one.
    #[must_use]
    pub fn with_retry(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_follow_mirror_pages(mut self, follow: bool) -> Self {
        self.follow_mirror_pages = follow;
        self
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn has_relay(&self) -> bool {
        self.relay.is_some()
    }

    /// Source page URL for `id`: `{base}/md5/{id}`.
    #[must_use]
    pub fn source_page_url(&self, id: &ItemId) -> Url {
        self.source_base
            .join(&format!("md5/{}", id.as_str()))
            .unwrap_or_else(|_| self.source_base.clone())
    }

    /// Resolves `id` into an ordered, deduplicated list of absolute mirrors.
    ///
    /// # Errors
    ///
    /// - [`ResolutionError::ChallengeRequired`] when a challenge is served and no relay is configured
    /// - [`ResolutionError::SourceUnreachable`] when the page cannot be fetched within the retry budget
    /// - [`ResolutionError::NoMirrorsFound`] when the page carries no mirror links
    #[instrument(skip(self), fields(id = %id))]
    pub async fn resolve(&self, id: &ItemId) -> Result<ResolvedItem, ResolutionError> {
        let page_url = self.source_page_url(id);
        let page = self.fetch_with_retry(&page_url).await?;

        let links = extract_mirror_links(&page.body, &page.url, &self.patterns);
        let links = prioritize_preferred(links, self.prefer_mirror.as_deref());
        if links.is_empty() {
            warn!(url = %page.url, "source page carried no mirror links");
            return Err(ResolutionError::NoMirrorsFound {
                url: page_url.to_string(),
            });
        }

        let title = extract_title(&page.body);
        let mirrors: Vec<Mirror> = links
            .iter()
            .map(|url| Mirror::new(url, MirrorOrigin::Scraped))
            .collect();
        info!(
            mirrors = mirrors.len(),
            title = title.as_deref().unwrap_or(""),
            "item resolved"
        );
        Ok(ResolvedItem {
            page_url: page_url.to_string(),
            title,
            mirrors,
        })
    }

    async fn fetch_with_retry(&self, url: &Url) -> Result<FetchedPage, ResolutionError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.attempts {
            match self.fetch_source(url, attempt).await {
                Ok(page) => return Ok(page),
                Err(AttemptOutcome::Fatal(error)) => return Err(error),
                Err(AttemptOutcome::Retry {
                    reason,
                    retry_after,
                }) => {
                    warn!(attempt, max = self.attempts, %reason, "source page fetch failed");
                    last_reason = reason;
                    if attempt < self.attempts {
                        let mut delay = self.backoff.delay(attempt);
                        if let Some(requested) = retry_after {
                            delay = delay.max(requested).min(self.backoff.max());
                        }
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
        }
        Err(ResolutionError::SourceUnreachable {
            url: url.to_string(),
            attempts: self.attempts,
            reason: last_reason,
        })
    }

    async fn fetch_source(&self, url: &Url, attempt: u32) -> Result<FetchedPage, AttemptOutcome> {
        let page = match self.direct.fetch(url).await {
            Ok(page) => page,
            Err(FetchError::InvalidUrl { url }) => {
                return Err(AttemptOutcome::Fatal(ResolutionError::SourceUnreachable {
                    url: url.clone(),
                    attempts: attempt,
                    reason: format!("invalid URL: {url}"),
                }));
            }
            Err(error) => {
                return Err(AttemptOutcome::Retry {
                    reason: error.to_string(),
                    retry_after: None,
                });
            }
        };

        let page = if page.is_challenge() {
            let Some(relay) = &self.relay else {
                warn!(url = %url, "challenge served and no relay configured");
                return Err(AttemptOutcome::Fatal(ResolutionError::ChallengeRequired {
                    url: url.to_string(),
                }));
            };
            debug!(url = %url, "challenge detected, retrying through relay");
            let relayed = relay.fetch(url).await.map_err(|e| AttemptOutcome::Retry {
                reason: e.to_string(),
                retry_after: None,
            })?;
            if relayed.is_challenge() {
                return Err(AttemptOutcome::Retry {
                    reason: "relay returned a challenge page".to_string(),
                    retry_after: None,
                });
            }
            relayed
        } else {
            page
        };

        if page.is_success() {
            return Ok(page);
        }
        let reason = format!("HTTP {}", page.status);
        if is_transient_status(page.status) {
            Err(AttemptOutcome::Retry {
                reason,
                retry_after: page.retry_after.as_deref().and_then(parse_retry_after),
            })
        } else {
            Err(AttemptOutcome::Fatal(ResolutionError::SourceUnreachable {
                url: url.to_string(),
                attempts: attempt,
                reason,
            }))
        }
    }

    /// Turns a mirror into the URL a backend should download.
    ///
    /// Scraped mirrors usually point at an intermediate page; that page is
    /// fetched and its direct file link returned. Non-HTML responses mean
    /// the mirror already is the file.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] classified like a transfer failure: fetch
    /// problems are transient or permanent per their cause, and a page
    /// without a direct link is permanent.
    #[instrument(skip(self), fields(mirror = %mirror.url))]
    pub async fn resolve_direct_link(&self, mirror: &Mirror) -> Result<Url, TransferError> {
        let url = Url::parse(&mirror.url)
            .map_err(|_| TransferError::permanent(format!("invalid mirror URL: {}", mirror.url)))?;
        if !self.follow_mirror_pages || mirror.origin != MirrorOrigin::Scraped {
            return Ok(url);
        }

        let mut page = self
            .direct
            .fetch(&url)
            .await
            .map_err(|e| classify_fetch_error(&e))?;

        if page.is_challenge() {
            let Some(relay) = &self.relay else {
                return Err(TransferError::permanent(format!(
                    "anti-bot challenge on mirror page {url}"
                )));
            };
            page = relay.fetch(&url).await.map_err(|e| classify_fetch_error(&e))?;
        }

        if !page.is_success() {
            return Err(classify_http_status(
                page.status,
                page.retry_after.as_deref(),
                format!("HTTP {} from mirror page {url}", page.status),
            ));
        }
        if !page.is_html() {
            debug!(final_url = %page.url, "mirror is a direct link");
            return Ok(page.url);
        }

        find_direct_link(&page.body, &page.url).map_or_else(
            || {
                Err(TransferError::permanent(format!(
                    "no download link on mirror page {url}"
                )))
            },
            |direct| {
                debug!(direct = %direct, "direct link found on mirror page");
                Ok(direct)
            },
        )
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
