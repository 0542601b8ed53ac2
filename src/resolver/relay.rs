//! Challenge relay: fetches pages through an external challenge-solving proxy.
//!
//! The relay speaks the FlareSolverr API: `POST {endpoint}/v1` with a
//! `request.get` command, answered by a rendered page in `solution.response`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use super::error::FetchError;
use super::fetch::{FetchedPage, PageFetcher};
use crate::config::RelaySettings;

/// Extra client time on top of the solver timeout so the relay can answer.
const CLIENT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    solution: Option<RelaySolution>,
}

#[derive(Debug, Deserialize)]
struct RelaySolution {
    url: String,
    status: u16,
    #[serde(default)]
    response: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Page fetcher that routes requests through the challenge relay.
#[derive(Debug, Clone)]
pub struct ChallengeRelay {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl ChallengeRelay {
    /// Creates a relay client from settings.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] for a malformed endpoint, or
    /// [`FetchError::Network`] when the HTTP client cannot be built.
    pub fn new(settings: &RelaySettings) -> Result<Self, FetchError> {
        let endpoint = Url::parse(&settings.url).map_err(|_| FetchError::InvalidUrl {
            url: settings.url.clone(),
        })?;
        let timeout = settings.timeout();
        let client = Client::builder()
            .timeout(timeout + CLIENT_GRACE)
            .build()
            .map_err(|e| FetchError::network(settings.url.as_str(), e))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    fn command_url(&self) -> Result<Url, FetchError> {
        self.endpoint
            .join("v1")
            .map_err(|_| FetchError::InvalidUrl {
                url: self.endpoint.to_string(),
            })
    }

    /// Checks that the relay answers on its base endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the relay is unreachable or not healthy.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn health_check(&self) -> Result<(), FetchError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| FetchError::network(self.endpoint.as_str(), e))?;
        if response.status().is_success() {
            debug!("challenge relay healthy");
            Ok(())
        } else {
            Err(FetchError::relay(
                self.endpoint.as_str(),
                format!("health check returned HTTP {}", response.status().as_u16()),
            ))
        }
    }
}

#[async_trait]
impl PageFetcher for ChallengeRelay {
    fn name(&self) -> &'static str {
        "relay"
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let command_url = self.command_url()?;
        let request = RelayRequest {
            cmd: "request.get",
            url: url.as_str(),
            max_timeout: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        };

        let response = self
            .client
            .post(command_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::relay(url.as_str(), e.to_string()))?;

        let relay_status = response.status().as_u16();
        let decoded: RelayResponse = response
            .json()
            .await
            .map_err(|e| FetchError::relay(url.as_str(), format!("undecodable reply: {e}")))?;

        if decoded.status != "ok" {
            let message = decoded
                .message
                .unwrap_or_else(|| format!("relay status '{}'", decoded.status));
            warn!(relay_status, %message, "challenge relay did not solve page");
            return Err(FetchError::relay(url.as_str(), message));
        }
        let solution = decoded
            .solution
            .ok_or_else(|| FetchError::relay(url.as_str(), "reply carried no solution"))?;

        let final_url = Url::parse(&solution.url).unwrap_or_else(|_| url.clone());
        let content_type = solution
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .or_else(|| Some("text/html".to_string()));

        debug!(status = solution.status, final_url = %final_url, "page fetched via relay");

        Ok(FetchedPage {
            url: final_url,
            status: solution.status,
            content_type,
            retry_after: None,
            body: solution.response,
        })
    }
}
