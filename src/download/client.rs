//! HTTP client wrapper for streaming transfers into `.part` files.
//!
//! A transfer is two steps: [`HttpClient::probe`] issues a HEAD request to
//! learn size, range support, and content type; [`HttpClient::stream_to_part`]
//! then streams the body into the incomplete directory, resuming with a
//! `Range` request when a partial file exists and the mirror supports it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap,
    RANGE, RETRY_AFTER,
};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::verify::{ContentSniff, sniff};
use crate::user_agent;

/// Live byte counters shared between a transfer task and its pollers.
///
/// A total of zero means "unknown".
#[derive(Debug, Default)]
pub struct TransferProgress {
    bytes: AtomicU64,
    total: AtomicU64,
}

impl TransferProgress {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            0 => None,
            total => Some(total),
        }
    }

    fn reset(&self, bytes: u64, total: Option<u64>) {
        self.bytes.store(bytes, Ordering::Relaxed);
        self.total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    fn add(&self, delta: u64) {
        self.bytes.fetch_add(delta, Ordering::Relaxed);
    }
}

/// What a HEAD request revealed about a mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    pub content_length: Option<u64>,
    pub supports_ranges: bool,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    /// URL after redirects.
    pub final_url: Option<Url>,
}

/// Result of a finished stream into a `.part` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub part_path: PathBuf,
    /// File size after the transfer.
    pub bytes: u64,
    /// Expected full size, when the server told us.
    pub content_length: Option<u64>,
    pub resumed: bool,
    pub content_type: Option<String>,
}

/// HTTP client for streaming downloads.
///
/// Created once and reused, taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default timeouts (30s connect, 5min read).
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the client cannot be built.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeouts.
    ///
    /// The read timeout applies per read, so large files are not cut off.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the client cannot be built.
    pub fn new_with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(user_agent::default_download_user_agent())
            .build()?;
        Ok(Self { client })
    }

    /// Probes `url` with a HEAD request.
    ///
    /// Servers that refuse HEAD yield an empty probe; the GET that follows
    /// gives the real answer.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::UnexpectedContent`] when the mirror answers
    /// with an HTML page.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &Url) -> Result<ProbeInfo, DownloadError> {
        let response = match self.client.head(url.clone()).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = response.status().as_u16(), "HEAD refused, skipping probe");
                return Ok(ProbeInfo::default());
            }
            Err(error) => {
                debug!(error = %error, "HEAD failed, skipping probe");
                return Ok(ProbeInfo::default());
            }
        };

        let headers = response.headers();
        let probe = ProbeInfo {
            content_length: header_u64(headers, CONTENT_LENGTH),
            supports_ranges: header_str(headers, ACCEPT_RANGES)
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes")),
            content_type: header_str(headers, CONTENT_TYPE).map(ToString::to_string),
            content_disposition: header_str(headers, CONTENT_DISPOSITION)
                .map(ToString::to_string),
            final_url: Some(response.url().clone()),
        };

        if probe
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        {
            return Err(DownloadError::unexpected_content(url.as_str(), "text/html"));
        }

        debug!(
            content_length = ?probe.content_length,
            supports_ranges = probe.supports_ranges,
            content_type = probe.content_type.as_deref().unwrap_or(""),
            "probe complete"
        );
        Ok(probe)
    }

    /// Streams `url` into `part_path`, resuming when possible.
    ///
    /// On error or cancellation the partial file is kept only when
    /// `probe.supports_ranges` says it can be resumed later.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for HTTP errors, network failures, I/O
    /// failures, HTML served in place of a file, or cancellation.
    #[instrument(skip(self, probe, progress, cancel), fields(url = %url, part = %part_path.display()))]
    pub async fn stream_to_part(
        &self,
        url: &Url,
        part_path: &Path,
        probe: &ProbeInfo,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DownloadError> {
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let existing = if probe.supports_ranges {
            tokio::fs::metadata(part_path)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0)
        } else {
            0
        };

        let result = self
            .stream_inner(url, part_path, probe, existing, progress, cancel)
            .await;

        if let Err(error) = &result {
            let keep = probe.supports_ranges && !matches!(error, DownloadError::UnexpectedContent { .. });
            if !keep {
                debug!(path = %part_path.display(), "removing partial file after error");
                let _ = tokio::fs::remove_file(part_path).await;
            }
        }
        result
    }

    async fn stream_inner(
        &self,
        url: &Url,
        part_path: &Path,
        probe: &ProbeInfo,
        existing: u64,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DownloadError> {
        let range = (existing > 0).then(|| format!("bytes={existing}-"));
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::cancelled(url.as_str())),
            response = self.send_get(url, range.as_deref()) => response?,
        };

        let resumed = existing > 0 && response.status().as_u16() == 206;
        if existing > 0 && !resumed {
            debug!(
                status = response.status().as_u16(),
                "server ignored range request, restarting from zero"
            );
        }
        let start = if resumed { existing } else { 0 };

        let content_type = header_str(response.headers(), CONTENT_TYPE).map(ToString::to_string);
        if !resumed
            && content_type
                .as_deref()
                .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
        {
            return Err(DownloadError::unexpected_content(url.as_str(), "text/html"));
        }

        let content_length =
            derive_total_content_length(response.headers(), resumed, existing).or(probe.content_length);
        progress.reset(start, content_length);

        let file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(part_path)
                .await
                .map_err(|e| DownloadError::io(part_path, e))?
        } else {
            File::create(part_path)
                .await
                .map_err(|e| DownloadError::io(part_path, e))?
        };

        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut sniffed = resumed;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = writer.flush().await;
                    return Err(DownloadError::cancelled(url.as_str()));
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| DownloadError::network(url.as_str(), e))?;

            if !sniffed {
                sniffed = true;
                if sniff(&chunk) == ContentSniff::Markup("html") {
                    return Err(DownloadError::unexpected_content(url.as_str(), "an HTML page"));
                }
            }

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(part_path, e))?;
            let len = chunk.len() as u64;
            written += len;
            progress.add(len);
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(part_path, e))?;

        let bytes = start.saturating_add(written);
        info!(bytes, resumed, "transfer stream complete");
        Ok(StreamOutcome {
            part_path: part_path.to_path_buf(),
            bytes,
            content_length,
            resumed,
            content_type,
        })
    }

    async fn send_get(&self, url: &Url, range: Option<&str>) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url.as_str(), e))?;

        if !response.status().is_success() {
            let retry_after = header_str(response.headers(), RETRY_AFTER).map(ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url.as_str(),
                response.status().as_u16(),
                retry_after,
            ));
        }
        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

/// Full size of the resource: the `Content-Range` total on a 206, else `Content-Length`.
fn derive_total_content_length(headers: &HeaderMap, resumed: bool, existing: u64) -> Option<u64> {
    let current = header_u64(headers, CONTENT_LENGTH);
    if !resumed {
        return current;
    }
    header_str(headers, CONTENT_RANGE)
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.trim().parse::<u64>().ok())
        .or_else(|| current.map(|remaining| existing.saturating_add(remaining)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new().unwrap()
    }

    fn mock_url(server: &wiremock::MockServer, route: &str) -> Url {
        Url::parse(&format!("{}{route}", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_probe_collects_headers() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .and(path("/book.epub"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/epub+zip")
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("content-length", "4096"),
            )
            .mount(&mock_server)
            .await;

        let probe = client()
            .probe(&mock_url(&mock_server, "/book.epub"))
            .await
            .unwrap();

        assert!(probe.supports_ranges);
        assert_eq!(probe.content_type.as_deref(), Some("application/epub+zip"));
    }

    #[tokio::test]
    async fn test_probe_html_is_unexpected_content() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("content-type", "text/html; charset=utf-8"),
            )
            .mount(&mock_server)
            .await;

        let result = client().probe(&mock_url(&mock_server, "/get.php")).await;

        assert!(matches!(result, Err(DownloadError::UnexpectedContent { .. })));
    }

    #[tokio::test]
    async fn test_probe_refused_head_is_empty() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&mock_server)
            .await;

        let probe = client().probe(&mock_url(&mock_server, "/x")).await.unwrap();

        assert_eq!(probe, ProbeInfo::default());
    }

    #[tokio::test]
    async fn test_stream_writes_part_and_tracks_progress() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .and(path("/book.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7 content".to_vec()))
            .mount(&mock_server)
            .await;

        let part = temp_dir.path().join("incomplete/book.pdf.part");
        let progress = TransferProgress::default();
        let outcome = client()
            .stream_to_part(
                &mock_url(&mock_server, "/book.pdf"),
                &part,
                &ProbeInfo::default(),
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 16);
        assert_eq!(progress.bytes(), 16);
        assert_eq!(std::fs::read(&part).unwrap(), b"%PDF-1.7 content");
    }

    #[tokio::test]
    async fn test_stream_resumes_with_range() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let part = temp_dir.path().join("book.epub.part");
        std::fs::write(&part, b"PK\x03\x04").unwrap();

        Mock::given(method("GET"))
            .and(path("/book.epub"))
            .and(header("range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 4-9/10")
                    .set_body_bytes(b"abcdef".to_vec()),
            )
            .mount(&mock_server)
            .await;

        let probe = ProbeInfo {
            supports_ranges: true,
            ..ProbeInfo::default()
        };
        let outcome = client()
            .stream_to_part(
                &mock_url(&mock_server, "/book.epub"),
                &part,
                &probe,
                &TransferProgress::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.resumed);
        assert_eq!(outcome.bytes, 10);
        assert_eq!(outcome.content_length, Some(10));
        assert_eq!(std::fs::read(&part).unwrap(), b"PK\x03\x04abcdef");
    }

    #[tokio::test]
    async fn test_stream_restarts_when_range_ignored() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let part = temp_dir.path().join("book.epub.part");
        std::fs::write(&part, b"stale").unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04full".to_vec()))
            .mount(&mock_server)
            .await;

        let probe = ProbeInfo {
            supports_ranges: true,
            ..ProbeInfo::default()
        };
        let outcome = client()
            .stream_to_part(
                &mock_url(&mock_server, "/book.epub"),
                &part,
                &probe,
                &TransferProgress::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.resumed);
        assert_eq!(std::fs::read(&part).unwrap(), b"PK\x03\x04full");
    }

    #[tokio::test]
    async fn test_stream_html_body_is_rejected_and_removed() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(b"<!DOCTYPE html><html>slow down</html>".to_vec()),
            )
            .mount(&mock_server)
            .await;

        let part = temp_dir.path().join("x.part");
        let result = client()
            .stream_to_part(
                &mock_url(&mock_server, "/x"),
                &part,
                &ProbeInfo::default(),
                &TransferProgress::default(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(DownloadError::UnexpectedContent { .. })));
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_stream_http_error_carries_retry_after() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&mock_server)
            .await;

        let part = temp_dir.path().join("x.part");
        let result = client()
            .stream_to_part(
                &mock_url(&mock_server, "/x"),
                &part,
                &ProbeInfo::default(),
                &TransferProgress::default(),
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(DownloadError::HttpStatus {
                status,
                retry_after,
                ..
            }) => {
                assert_eq!(status, 429);
                assert_eq!(retry_after.as_deref(), Some("30"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_stream_cancelled_keeps_resumable_part() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let part = temp_dir.path().join("slow.part");
        std::fs::write(&part, b"%PDF").unwrap();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(b"more".to_vec())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let probe = ProbeInfo {
            supports_ranges: true,
            ..ProbeInfo::default()
        };
        let result = client()
            .stream_to_part(
                &mock_url(&mock_server, "/slow"),
                &part,
                &probe,
                &TransferProgress::default(),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(DownloadError::Cancelled { .. })));
        assert!(part.exists());
    }

    #[test]
    fn test_derive_total_content_length_prefers_content_range() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "6".parse().unwrap());
        headers.insert(CONTENT_RANGE, "bytes 4-9/10".parse().unwrap());
        assert_eq!(derive_total_content_length(&headers, true, 4), Some(10));
        assert_eq!(derive_total_content_length(&headers, false, 0), Some(6));

        headers.remove(CONTENT_RANGE);
        assert_eq!(derive_total_content_length(&headers, true, 4), Some(10));
    }

    #[test]
    fn test_progress_unknown_total_is_none() {
        let progress = TransferProgress::default();
        progress.reset(3, None);
        progress.add(2);
        assert_eq!(progress.bytes(), 5);
        assert_eq!(progress.total(), None);
    }
}
