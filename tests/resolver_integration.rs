//! Integration tests for the mirror resolver.
//!
//! These run the resolver over real HTTP against mock catalog, mirror, and
//! relay servers.

mod support;

use std::sync::Arc;
use std::time::Duration;

use stacks_core::config::RelaySettings;
use stacks_core::download::{Backoff, TransferError};
use stacks_core::resolver::{ChallengeRelay, HttpPageFetcher, MirrorOrigin, PageFetcher};
use stacks_core::{ItemId, Mirror, MirrorResolver, ResolutionError};
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::fakes::RecordingSleeper;
use support::socket_guard::start_mock_server_or_skip;

const ID: &str = "d6e1dc51a50726f00ec438af21952a45";

const SOURCE_PAGE: &str = r#"<html><body>
<div class="text-3xl font-bold">The Left Hand of Darkness</div>
<ul>
  <li><a href="/slow_download/d6e1dc51a50726f00ec438af21952a45/0/0">Slow Partner Server #1</a></li>
  <li><a href="https://libgen.li/ads.php?md5=d6e1dc51a50726f00ec438af21952a45">Libgen.li</a></li>
  <li><a href="/slow_download/d6e1dc51a50726f00ec438af21952a45/0/0">duplicate</a></li>
  <li><a href="/account">Log in</a></li>
</ul>
</body></html>"#;

const CHALLENGE_PAGE: &str =
    "<html><head><title>Just a moment...</title></head><body><div id=\"cf-challenge\"></div></body></html>";

fn item() -> ItemId {
    ItemId::parse(ID).unwrap()
}

fn fetcher() -> Arc<dyn PageFetcher> {
    Arc::new(HttpPageFetcher::new().unwrap())
}

fn resolver_for(server: &MockServer) -> (MirrorResolver, Arc<RecordingSleeper>) {
    let sleeper = RecordingSleeper::new();
    let resolver = MirrorResolver::new(fetcher(), Url::parse(&server.uri()).unwrap())
        .with_retry(
            3,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(2)),
        )
        .with_sleeper(sleeper.clone());
    (resolver, sleeper)
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body)
}

// ==================== Source Page ====================

#[tokio::test]
async fn test_resolve_extracts_absolute_deduplicated_mirrors_and_title() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(html(SOURCE_PAGE))
        .mount(&server)
        .await;
    let (resolver, _) = resolver_for(&server);

    let resolved = resolver.resolve(&item()).await.unwrap();

    assert_eq!(
        resolved.title.as_deref(),
        Some("The Left Hand of Darkness")
    );
    let urls: Vec<&str> = resolved.mirrors.iter().map(|m| m.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            format!("{}/slow_download/{ID}/0/0", server.uri()).as_str(),
            "https://libgen.li/ads.php?md5=d6e1dc51a50726f00ec438af21952a45",
        ]
    );
    for mirror in &resolved.mirrors {
        assert!(Url::parse(&mirror.url).is_ok(), "not absolute: {}", mirror.url);
        assert_eq!(mirror.origin, MirrorOrigin::Scraped);
    }
}

#[tokio::test]
async fn test_resolve_retries_transient_status_with_backoff() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(html(SOURCE_PAGE))
        .mount(&server)
        .await;
    let (resolver, sleeper) = resolver_for(&server);

    let resolved = resolver.resolve(&item()).await.unwrap();

    assert_eq!(resolved.mirrors.len(), 2);
    let delays = sleeper.delays();
    assert_eq!(delays.len(), 2);
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
}

#[tokio::test]
async fn test_resolve_gives_up_after_attempt_budget() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;
    let (resolver, _) = resolver_for(&server);

    let err = resolver.resolve(&item()).await.unwrap_err();

    assert!(
        matches!(err, ResolutionError::SourceUnreachable { attempts: 3, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_resolve_not_found_is_not_retried() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let (resolver, sleeper) = resolver_for(&server);

    let err = resolver.resolve(&item()).await.unwrap_err();

    assert!(matches!(err, ResolutionError::SourceUnreachable { .. }));
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_resolve_page_without_links_is_no_mirrors_found() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(html("<html><body><h1>Record</h1><a href=\"/about\">About</a></body></html>"))
        .mount(&server)
        .await;
    let (resolver, _) = resolver_for(&server);

    let err = resolver.resolve(&item()).await.unwrap_err();
    assert!(matches!(err, ResolutionError::NoMirrorsFound { .. }));
}

// ==================== Challenge Relay ====================

#[tokio::test]
async fn test_challenge_without_relay_is_challenge_required() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("content-type", "text/html")
                .set_body_string(CHALLENGE_PAGE),
        )
        .mount(&server)
        .await;
    let (resolver, _) = resolver_for(&server);

    let err = resolver.resolve(&item()).await.unwrap_err();
    assert!(matches!(err, ResolutionError::ChallengeRequired { .. }));
}

#[tokio::test]
async fn test_challenge_is_solved_through_relay() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let page_url = format!("{}/md5/{ID}", server.uri());
    Mock::given(method("GET"))
        .and(path(format!("/md5/{ID}")))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("content-type", "text/html")
                .set_body_string(CHALLENGE_PAGE),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1"))
        .and(body_partial_json(serde_json::json!({
            "cmd": "request.get",
            "url": page_url,
            "maxTimeout": 10_000
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "ok",
            "message": "Challenge solved!",
            "solution": {
                "url": page_url,
                "status": 200,
                "headers": { "Content-Type": "text/html" },
                "response": SOURCE_PAGE
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let relay = ChallengeRelay::new(&RelaySettings {
        enabled: true,
        url: server.uri(),
        timeout_secs: 10,
    })
    .unwrap();
    let (resolver, _) = resolver_for(&server);
    let resolver = resolver.with_relay(Arc::new(relay));

    let resolved = resolver.resolve(&item()).await.unwrap();
    assert_eq!(resolved.mirrors.len(), 2);
}

#[tokio::test]
async fn test_relay_error_status_is_fetch_failure() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("POST"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "status": "error",
            "message": "Error solving the challenge. Timeout after 60.0 seconds."
        })))
        .mount(&server)
        .await;
    let relay = ChallengeRelay::new(&RelaySettings {
        enabled: true,
        url: server.uri(),
        timeout_secs: 60,
    })
    .unwrap();

    let err = relay
        .fetch(&Url::parse("https://catalog.test/md5/x").unwrap())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Timeout after 60.0 seconds"), "{err}");
}

#[tokio::test]
async fn test_relay_health_check() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("FlareSolverr is ready!"))
        .mount(&server)
        .await;
    let relay = ChallengeRelay::new(&RelaySettings {
        enabled: true,
        url: server.uri(),
        timeout_secs: 30,
    })
    .unwrap();

    relay.health_check().await.unwrap();
}

// ==================== Mirror Pages ====================

#[tokio::test]
async fn test_direct_link_found_on_mirror_page() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/ads.php"))
        .respond_with(html(
            "<html><body><a href=\"/about\">About</a><a href=\"get.php?md5=abc&key=XYZ\">GET</a></body></html>",
        ))
        .mount(&server)
        .await;
    let (resolver, _) = resolver_for(&server);
    let mirror = Mirror::new(
        &Url::parse(&format!("{}/ads.php?md5=abc", server.uri())).unwrap(),
        MirrorOrigin::Scraped,
    );

    let direct = resolver.resolve_direct_link(&mirror).await.unwrap();
    assert_eq!(
        direct.as_str(),
        format!("{}/get.php?md5=abc&key=XYZ", server.uri())
    );
}

#[tokio::test]
async fn test_mirror_serving_file_is_direct_link() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/file.epub"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/epub+zip")
                .set_body_bytes(b"PK\x03\x04epub".to_vec()),
        )
        .mount(&server)
        .await;
    let (resolver, _) = resolver_for(&server);
    let url = Url::parse(&format!("{}/file.epub", server.uri())).unwrap();

    let direct = resolver
        .resolve_direct_link(&Mirror::new(&url, MirrorOrigin::Scraped))
        .await
        .unwrap();
    assert_eq!(direct, url);
}

#[tokio::test]
async fn test_mirror_page_errors_are_classified() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "7"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(html("<html><body>Nothing to see</body></html>"))
        .mount(&server)
        .await;
    let (resolver, _) = resolver_for(&server);
    let mirror = |p: &str| {
        Mirror::new(
            &Url::parse(&format!("{}{p}", server.uri())).unwrap(),
            MirrorOrigin::Scraped,
        )
    };

    assert!(matches!(
        resolver.resolve_direct_link(&mirror("/gone")).await.unwrap_err(),
        TransferError::Permanent { .. }
    ));
    assert!(matches!(
        resolver.resolve_direct_link(&mirror("/busy")).await.unwrap_err(),
        TransferError::Transient {
            retry_after: Some(d),
            ..
        } if d == Duration::from_secs(7)
    ));
    assert!(matches!(
        resolver.resolve_direct_link(&mirror("/empty")).await.unwrap_err(),
        TransferError::Permanent { .. }
    ));
}

#[tokio::test]
async fn test_fast_lane_mirrors_are_not_followed() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let (resolver, _) = resolver_for(&server);
    let url = Url::parse("https://fast.test/d/abc.pdf").unwrap();

    let direct = resolver
        .resolve_direct_link(&Mirror::new(&url, MirrorOrigin::FastLane))
        .await
        .unwrap();
    assert_eq!(direct, url);
}
