//! End-to-end download tests.
//!
//! A mock catalog serves the source page, the mirror pages, and the files;
//! the real resolver and streaming driver carry each item through the queue.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stacks_core::config::EngineConfig;
use stacks_core::download::Backoff;
use stacks_core::resolver::HttpPageFetcher;
use stacks_core::{
    BackendSet, ErrorKind, HttpClient, JobState, MirrorResolver, QueueManager, StreamingDriver,
};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::socket_guard::start_mock_server_or_skip;

const ID: &str = "9f86d081884c7d659a2feaa0c55ad015";

fn config(output: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.output_dir = output.to_path_buf();
    config.downloads.retry_count = 1;
    config.downloads.poll_interval_ms = 10;
    config.downloads.prefetch = false;
    config
}

fn manager(server: &MockServer, config: &EngineConfig) -> QueueManager {
    let resolver = MirrorResolver::new(
        Arc::new(HttpPageFetcher::new().unwrap()),
        Url::parse(&server.uri()).unwrap(),
    )
    .with_retry(1, Backoff::new(Duration::ZERO, Duration::ZERO));
    let driver = StreamingDriver::new(HttpClient::new().unwrap());
    QueueManager::new(config, resolver, BackendSet::streaming_only(Arc::new(driver)))
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body)
}

fn pdf_bytes() -> Vec<u8> {
    let mut bytes = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n".to_vec();
    bytes.resize(4096, b'0');
    bytes
}

/// Source page listing one slow-download mirror per key, each of which links
/// to `/get.php?key=<key>`.
async fn mount_catalog(server: &MockServer, title: &str, keys: &[&str]) {
    let links: String = keys
        .iter()
        .enumerate()
        .map(|(i, _)| format!("<li><a href=\"/slow_download/{ID}/0/{i}\">Slow #{i}</a></li>"))
        .collect();
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(html(format!(
            "<html><body><div class=\"text-3xl font-bold\">{title}</div><ul>{links}</ul></body></html>"
        )))
        .mount(server)
        .await;
    for (i, key) in keys.iter().enumerate() {
        Mock::given(method("GET"))
            .and(path(format!("/slow_download/{ID}/0/{i}")))
            .respond_with(html(format!(
                "<html><body><p>Please wait</p><a href=\"/get.php?key={key}\">Download now</a></body></html>"
            )))
            .mount(server)
            .await;
    }
}

async fn mount_file(server: &MockServer, key: &str, response: ResponseTemplate, head_type: &str) {
    Mock::given(method("HEAD"))
        .and(path("/get.php"))
        .and(query_param("key", key))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", head_type))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/get.php"))
        .and(query_param("key", key))
        .respond_with(response)
        .mount(server)
        .await;
}

// ==================== Happy Path ====================

#[tokio::test]
async fn test_item_is_resolved_streamed_and_verified() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_catalog(&server, "Snow Crash", &["good"]).await;
    mount_file(
        &server,
        "good",
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/pdf")
            .set_body_bytes(pdf_bytes()),
        "application/pdf",
    )
    .await;
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let manager = manager(&server, &config);

    manager.enqueue(ID, None).await.unwrap();
    let stats = manager.run_until_idle().await.unwrap();

    assert_eq!(stats.completed, 1);
    let history = manager.history();
    let record = &history[0];
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.title.as_deref(), Some("Snow Crash"));
    assert_eq!(
        record.mirror.as_deref(),
        Some(format!("{}/slow_download/{ID}/0/0", server.uri()).as_str())
    );
    let saved = record.saved_path.clone().unwrap();
    assert_eq!(saved.parent(), Some(dir.path()));
    assert_eq!(std::fs::read(&saved).unwrap(), pdf_bytes());
    let leftovers: Vec<_> = std::fs::read_dir(config.incomplete_dir())
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "part files left behind: {leftovers:?}");
}

// ==================== Failover ====================

#[tokio::test]
async fn test_html_served_as_file_advances_to_next_mirror() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_catalog(&server, "Neuromancer", &["blocked", "good"]).await;
    mount_file(
        &server,
        "blocked",
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/octet-stream")
            .set_body_string("<!DOCTYPE html><html><title>Limit reached</title></html>"),
        "application/octet-stream",
    )
    .await;
    mount_file(
        &server,
        "good",
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/pdf")
            .set_body_bytes(pdf_bytes()),
        "application/pdf",
    )
    .await;
    let dir = TempDir::new().unwrap();
    let manager = manager(&server, &config(dir.path()));

    manager.enqueue(ID, None).await.unwrap();
    let stats = manager.run_until_idle().await.unwrap();

    assert_eq!(stats.completed, 1);
    let history = manager.history();
    let record = &history[0];
    assert_eq!(
        record.mirror.as_deref(),
        Some(format!("{}/slow_download/{ID}/0/1", server.uri()).as_str())
    );
    let saved = record.saved_path.clone().unwrap();
    assert_eq!(std::fs::read(saved).unwrap(), pdf_bytes());
}

#[tokio::test]
async fn test_all_mirrors_missing_fails_item() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_catalog(&server, "Gone", &["a", "b"]).await;
    for key in ["a", "b"] {
        Mock::given(method("GET"))
            .and(path("/get.php"))
            .and(query_param("key", key))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
    }
    let dir = TempDir::new().unwrap();
    let manager = manager(&server, &config(dir.path()));

    manager.enqueue(ID, None).await.unwrap();
    let stats = manager.run_until_idle().await.unwrap();

    assert_eq!(stats.failed, 1);
    assert!(!stats.all_completed());
    let history = manager.history();
    let record = &history[0];
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::TransferPermanent);
    assert!(record.saved_path.is_none());
}
