//! Fast-lane client: member fast-download links backed by a daily quota.
//!
//! One authenticated `GET` per item returns a prioritized direct link. The
//! client owns the [`QuotaState`]; every mutation goes through its mutex and
//! the lock is never held across an `.await`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::clock::unix_millis;
use crate::config::FastLaneSettings;
use crate::failure::{ErrorKind, JobError};
use crate::queue::ItemId;
use crate::resolver::{Mirror, MirrorOrigin, build_page_client};

/// Identifier used to read quota without spending it on a real item.
pub const QUOTA_PROBE_ID: &str = "d6e1dc51a50726f00ec438af21952a45";

/// Minimum time between unforced quota refreshes.
pub const REFRESH_COOLDOWN: Duration = Duration::from_secs(3600);

/// Errors returned by [`FastLaneClient::request_priority_link`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    /// No fast downloads left today.
    #[error("fast download quota exhausted")]
    Exhausted,

    /// The key was rejected. Only a settings change clears this.
    #[error("fast download key rejected: {message}\n  Suggestion: check [fast_download].key")]
    InvalidKey { message: String },

    /// The API could not be used this time; scraped mirrors still work.
    #[error("fast download unavailable: {reason}")]
    Unavailable { reason: String },
}

impl QuotaError {
    /// `None` for [`QuotaError::Unavailable`], which never ends a job.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Exhausted => Some(ErrorKind::QuotaExhausted),
            Self::InvalidKey { .. } => Some(ErrorKind::InvalidKey),
            Self::Unavailable { .. } => None,
        }
    }

    #[must_use]
    pub fn to_job_error(&self) -> Option<JobError> {
        self.kind().map(|kind| JobError::new(kind, self.to_string()))
    }

    fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Quota as last reported by the API and adjusted locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    /// Fast downloads left; `None` until the first API answer.
    pub remaining: Option<u32>,
    pub downloads_per_day: Option<u32>,
    #[serde(default)]
    pub recently_downloaded: Vec<String>,
    /// Unix millis of the last API answer carrying account info.
    pub last_refreshed_ms: Option<u64>,
    /// Cleared after an invalid-key answer.
    pub available: bool,
}

impl QuotaState {
    fn apply_account_info(&mut self, info: &AccountInfo) {
        if let Some(left) = info.downloads_left {
            self.remaining = Some(u32::try_from(left.max(0)).unwrap_or(u32::MAX));
        }
        if let Some(per_day) = info.downloads_per_day {
            self.downloads_per_day = Some(u32::try_from(per_day.max(0)).unwrap_or(u32::MAX));
        }
        if let Some(recent) = &info.recently_downloaded_md5s {
            self.recently_downloaded.clone_from(recent);
        }
        self.last_refreshed_ms = Some(unix_millis());
    }

    fn decrement(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }
}

/// Read-only view for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub enabled: bool,
    #[serde(flatten)]
    pub state: QuotaState,
}

#[derive(Debug, Deserialize)]
struct FastDownloadResponse {
    download_url: Option<String>,
    error: Option<String>,
    account_fast_download_info: Option<AccountInfo>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    downloads_left: Option<i64>,
    downloads_per_day: Option<i64>,
    recently_downloaded_md5s: Option<Vec<String>>,
}

#[derive(Debug)]
struct Inner {
    state: QuotaState,
    last_refresh_at: Option<Instant>,
}

/// Authenticated fast-download API client.
#[derive(Debug)]
pub struct FastLaneClient {
    client: Client,
    api_url: Url,
    key: String,
    path_index: u32,
    domain_index: u32,
    inner: Mutex<Inner>,
}

impl FastLaneClient {
    /// Builds a client when the fast lane is enabled with a key.
    ///
    /// Returns `Ok(None)` when the fast lane is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Unavailable`] when the API URL is malformed or
    /// the HTTP client cannot be built.
    pub fn from_settings(settings: &FastLaneSettings) -> Result<Option<Self>, QuotaError> {
        let Some(key) = settings.active_key() else {
            return Ok(None);
        };
        let api_url = Url::parse(&settings.api_url)
            .map_err(|e| QuotaError::unavailable(format!("invalid API URL: {e}")))?;
        let client = build_page_client()
            .map_err(|e| QuotaError::unavailable(format!("HTTP client: {e}")))?;
        Ok(Some(
            Self::with_client(client, api_url, key)
                .with_indices(settings.path_index, settings.domain_index),
        ))
    }

    #[must_use]
    pub fn with_client(client: Client, api_url: Url, key: impl Into<String>) -> Self {
        Self {
            client,
            api_url,
            key: key.into(),
            path_index: 0,
            domain_index: 0,
            inner: Mutex::new(Inner {
                state: QuotaState {
                    available: true,
                    ..QuotaState::default()
                },
                last_refresh_at: None,
            }),
        }
    }

    #[must_use]
    pub fn with_indices(mut self, path_index: u32, domain_index: u32) -> Self {
        self.path_index = path_index;
        self.domain_index = domain_index;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn quota(&self) -> QuotaState {
        self.lock().state.clone()
    }

    /// True unless the key was rejected earlier in this session.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.lock().state.available
    }

    /// Whether a request for a new item is worth sending.
    #[must_use]
    pub fn has_quota(&self) -> bool {
        let inner = self.lock();
        inner.state.available && inner.state.remaining != Some(0)
    }

    /// Requests a prioritized direct link for `id`.
    ///
    /// On success the quota drops by exactly one.
    ///
    /// # Errors
    ///
    /// - [`QuotaError::Exhausted`] when no quota is left (no request is sent when already known)
    /// - [`QuotaError::InvalidKey`] on 401/403, after which the client stays disabled
    /// - [`QuotaError::Unavailable`] for anything else
    #[instrument(skip(self), fields(id = %id))]
    pub async fn request_priority_link(&self, id: &ItemId) -> Result<Mirror, QuotaError> {
        {
            let inner = self.lock();
            if !inner.state.available {
                return Err(QuotaError::InvalidKey {
                    message: "disabled after an earlier rejection".to_string(),
                });
            }
            if inner.state.remaining == Some(0) {
                debug!("quota known to be zero, not calling API");
                return Err(QuotaError::Exhausted);
            }
        }

        let (status, body) = self.call(id.as_str()).await?;
        let parsed = self.interpret(status, body)?;

        let Some(download_url) = parsed.download_url.as_deref().filter(|u| !u.is_empty()) else {
            let reason = parsed
                .error
                .unwrap_or_else(|| "response carried no download_url".to_string());
            return Err(QuotaError::unavailable(reason));
        };
        let url = self
            .api_url
            .join(download_url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| QuotaError::unavailable(format!("unusable URL {download_url}")))?;

        let remaining = {
            let mut inner = self.lock();
            // downloads_left counts the account before this request
            if let Some(info) = &parsed.account_fast_download_info {
                inner.state.apply_account_info(info);
                inner.last_refresh_at = Some(Instant::now());
            }
            inner.state.decrement();
            inner.state.remaining
        };
        info!(remaining = ?remaining, "fast download link granted");
        Ok(Mirror::new(&url, MirrorOrigin::FastLane))
    }

    /// Refreshes quota information without downloading anything.
    ///
    /// Skipped inside the cooldown window unless `force` is set. Returns the
    /// current state either way.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`request_priority_link`](Self::request_priority_link).
    #[instrument(skip(self))]
    pub async fn refresh(&self, force: bool) -> Result<QuotaState, QuotaError> {
        {
            let inner = self.lock();
            if !inner.state.available {
                return Err(QuotaError::InvalidKey {
                    message: "disabled after an earlier rejection".to_string(),
                });
            }
            if !force
                && inner
                    .last_refresh_at
                    .is_some_and(|at| at.elapsed() < REFRESH_COOLDOWN)
            {
                debug!("quota refresh skipped, cooldown active");
                return Ok(inner.state.clone());
            }
        }

        let (status, body) = self.call(QUOTA_PROBE_ID).await?;
        let parsed = self.interpret(status, body)?;
        let mut inner = self.lock();
        inner.last_refresh_at = Some(Instant::now());
        if let Some(info) = &parsed.account_fast_download_info {
            inner.state.apply_account_info(info);
        }
        Ok(inner.state.clone())
    }

    async fn call(&self, md5: &str) -> Result<(StatusCode, String), QuotaError> {
        let mut url = self.api_url.clone();
        url.query_pairs_mut()
            .append_pair("md5", md5)
            .append_pair("key", &self.key)
            .append_pair("path_index", &self.path_index.to_string())
            .append_pair("domain_index", &self.domain_index.to_string());

        let response = self.client.get(url).send().await.map_err(|e| {
            warn!(error = %e, "fast download API unreachable");
            QuotaError::unavailable(format!("request failed: {e}"))
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QuotaError::unavailable(format!("reading body: {e}")))?;
        Ok((status, body))
    }

    /// Maps status codes to quota errors and applies their side effects.
    fn interpret(
        &self,
        status: StatusCode,
        body: String,
    ) -> Result<FastDownloadResponse, QuotaError> {
        let parsed = serde_json::from_str::<FastDownloadResponse>(&body).ok();
        let api_error = parsed.as_ref().and_then(|p| p.error.clone());

        match status.as_u16() {
            200 => parsed.ok_or_else(|| QuotaError::unavailable("undecodable response body")),
            401 | 403 => {
                let message = api_error.unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
                warn!(%message, "fast download key rejected, disabling fast lane");
                self.lock().state.available = false;
                Err(QuotaError::InvalidKey { message })
            }
            429 => {
                let mut inner = self.lock();
                inner.state.remaining = Some(0);
                inner.state.last_refreshed_ms = Some(unix_millis());
                drop(inner);
                warn!("fast download quota exhausted");
                Err(QuotaError::Exhausted)
            }
            other => Err(QuotaError::unavailable(
                api_error.unwrap_or_else(|| format!("HTTP {other}")),
            )),
        }
    }
}
