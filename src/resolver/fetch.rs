//! Page fetching contract shared by the direct HTTP fetcher and the challenge relay.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderName, RETRY_AFTER};
use tracing::{debug, instrument};
use url::Url;

use super::error::FetchError;
use super::http_client::build_page_client;
use super::utils::{is_challenge_page, is_html_content_type, is_textual_content_type};

/// A fetched page. Any HTTP status is represented; only transport failures are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// Final URL after redirects; the base for relative links.
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub retry_after: Option<String>,
    /// Body text. Left empty for non-textual responses (e.g. a direct file).
    pub body: String,
}

impl FetchedPage {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type.as_deref().is_some_and(is_html_content_type)
    }

    /// Whether this is an anti-bot interstitial; see [`is_challenge_page`].
    #[must_use]
    pub fn is_challenge(&self) -> bool {
        is_challenge_page(self.status, &self.body)
    }
}

/// Fetches a page by URL.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Fetches `url`, following redirects.
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError>;
}

/// Plain HTTP page fetcher.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    /// Creates a fetcher with the shared page client policy.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when client construction fails.
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_page_client()?,
        })
    }

    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    fn name(&self) -> &'static str {
        "direct"
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::network(url.as_str(), e))?;

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let content_type = header_string(&response, CONTENT_TYPE);
        let retry_after = header_string(&response, RETRY_AFTER);

        let body = if content_type.as_deref().is_some_and(is_textual_content_type) {
            response
                .text()
                .await
                .map_err(|e| FetchError::network(url.as_str(), e))?
        } else {
            // Dropping the response aborts the body; this is a file, not a page.
            String::new()
        };

        debug!(
            status,
            final_url = %final_url,
            content_type = content_type.as_deref().unwrap_or(""),
            bytes = body.len(),
            "page fetched"
        );

        Ok(FetchedPage {
            url: final_url,
            status,
            content_type,
            retry_after,
            body,
        })
    }
}

fn header_string(response: &reqwest::Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}
