//! End-to-end resolution against a local mock server.
//!
//! These tests go through the real reqwest transport with proxies disabled:
//! - Built-in strategies resolving a meta refresh interstitial
//! - Cache hits served from memory and from a redb file
//! - The table-driven shortener flows (form post and redirect chain)
//! - Session cookies kept within one flow and never shared between lookups
//! - Aggregated failure when nothing matches

use std::sync::Arc;
use std::time::Duration;

use linkbypass_rs::{
    CloudflareStrategy, CssHiddenStrategy, HtmlFormsStrategy, PageFetcher, ReqwestPageFetcher,
    ResolutionManager, ResolutionRequest, ResolutionStatus, ShortenerStrategy, SiteRule,
};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DESTINATION: &str = "https://real-destination.test/file";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fetcher() -> Arc<dyn PageFetcher> {
    Arc::new(
        ReqwestPageFetcher::new(Some("linkbypass-test/1.0"), Duration::from_secs(5))
            .expect("Failed to build fetcher"),
    )
}

async fn interstitial_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<html><head><meta http-equiv="refresh" content="0; url={}"></head></html>"#,
            DESTINATION
        )))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn default_pipeline_resolves_meta_refresh_and_caches_it() {
    init_logging();
    let server = interstitial_server().await;
    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_fetcher(fetcher())
        .build()
        .expect("Failed to build manager");

    let short = format!("{}/abc123", server.uri());
    let first = manager.resolve_url(&short).await.expect("valid url");
    assert!(first.is_success(), "unexpected failure: {:?}", first.error_message());
    assert_eq!(first.resolved_url().unwrap().as_str(), DESTINATION);
    assert_eq!(first.strategy_name(), "html_forms");
    assert_eq!(first.attempts().len(), 1);

    let second = manager.resolve_url(&short).await.expect("valid url");
    assert_eq!(second.strategy_name(), "cache");
    assert_eq!(second.resolved_url().unwrap().as_str(), DESTINATION);

    let stats = manager.stats();
    assert_eq!(stats.successful_resolutions, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(manager.cache_stats().entries, 1);
    assert!(manager.proxy_status().is_none());
}

#[tokio::test]
async fn redb_cache_survives_restart() {
    init_logging();
    let server = interstitial_server().await;
    let dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = dir.path().join("resolutions.redb");
    let short = format!("{}/abc123", server.uri());

    {
        let manager = ResolutionManager::builder()
            .disable_proxies()
            .with_fetcher(fetcher())
            .with_cache_path(&db_path)
            .build()
            .expect("Failed to build manager");
        let result = manager.resolve_url(&short).await.expect("valid url");
        assert!(result.is_success());
    }

    server.reset().await;
    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_fetcher(fetcher())
        .with_cache_path(&db_path)
        .build()
        .expect("Failed to reopen manager");
    let cached = manager.resolve_url(&short).await.expect("valid url");
    assert_eq!(cached.strategy_name(), "cache");
    assert_eq!(cached.resolved_url().unwrap().as_str(), DESTINATION);
}

#[tokio::test]
async fn links_go_shortener_posts_the_form_with_session_cookies() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/AbC12"))
        .and(header("referer", "https://blog.test/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "csrfToken=t0k; Path=/")
                .set_body_string(
                    r#"<form id="go-link"><input type="hidden" name="_csrfToken" value="t0k"><input type="hidden" name="alias" value="AbC12"></form>"#,
                ),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/links/go"))
        .and(header("x-requested-with", "XMLHttpRequest"))
        .and(header("cookie", "csrfToken=t0k"))
        .and(body_string_contains("_csrfToken=t0k"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"{{"status":"success","url":"{}"}}"#,
            DESTINATION
        )))
        .expect(1)
        .mount(&server)
        .await;

    let table = vec![SiteRule::links_go(
        "127.0.0.1",
        &server.uri(),
        "https://blog.test/",
        0.01,
    )];
    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_strategy(ShortenerStrategy::with_table(fetcher(), table))
        .build()
        .expect("Failed to build manager");

    let result = manager
        .resolve_url(&format!("{}/AbC12", server.uri()))
        .await
        .expect("valid url");
    assert!(result.is_success(), "unexpected failure: {:?}", result.error_message());
    assert_eq!(result.resolved_url().unwrap().as_str(), DESTINATION);
    assert_eq!(result.strategy_name(), "shortener");
}

#[tokio::test]
async fn warmed_session_reuses_homepage_cookies() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/f/42"))
        .and(header("cookie", "cf_clearance=ok"))
        .and(header_exists("origin"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<a class="download" href="https://mega.nz/file/x">Download</a>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/f/42"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("server", "cloudflare")
                .set_body_string("<div id=\"cf-browser-verification\"></div>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("set-cookie", "cf_clearance=ok; Path=/"),
        )
        .mount(&server)
        .await;

    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_strategy(CloudflareStrategy::new(fetcher()))
        .build()
        .expect("Failed to build manager");

    let result = manager
        .resolve_url(&format!("{}/f/42", server.uri()))
        .await
        .expect("valid url");
    assert!(result.is_success(), "unexpected failure: {:?}", result.error_message());
    assert_eq!(result.resolved_url().unwrap().as_str(), "https://mega.nz/file/x");
    assert_eq!(result.metadata()["technique"], "warmed_session");
}

#[tokio::test]
async fn separate_resolutions_do_not_share_cookies() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header_exists("cookie"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "visitor=1; Path=/")
                .set_body_string(format!(
                    r#"<meta http-equiv="refresh" content="0; url={}">"#,
                    DESTINATION
                )),
        )
        .mount(&server)
        .await;

    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_strategy(HtmlFormsStrategy::new(fetcher()))
        .build()
        .expect("Failed to build manager");

    for code in ["one", "two"] {
        let result = manager
            .resolve_url(&format!("{}/{}", server.uri(), code))
            .await
            .expect("valid url");
        assert!(result.is_success(), "{} failed: {:?}", code, result.error_message());
    }
}

#[tokio::test]
async fn redirect_chain_stops_once_the_host_changes() {
    init_logging();
    let server = MockServer::start().await;
    let port = server.address().port();
    Mock::given(method("GET"))
        .and(path("/q"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/q2"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/q2"))
        .respond_with(
            ResponseTemplate::new(301)
                .insert_header("location", format!("http://localhost:{}/final", port)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/final"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>landed</p>"))
        .mount(&server)
        .await;

    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_strategy(ShortenerStrategy::with_table(
            fetcher(),
            vec![SiteRule::redirect_chain("127.0.0.1")],
        ))
        .build()
        .expect("Failed to build manager");

    let request = ResolutionRequest::parse(&format!("http://127.0.0.1:{}/q", port))
        .expect("valid url")
        .with_skip_cache(true);
    let result = manager.resolve(request).await;
    assert_eq!(
        result.resolved_url().map(|url| url.as_str().to_string()),
        Some(format!("http://localhost:{}/final", port))
    );
    assert_eq!(result.metadata()["hops"], 2);
}

#[tokio::test]
async fn plain_page_fails_every_strategy() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>nothing to see here</p>"))
        .mount(&server)
        .await;

    let shared = fetcher();
    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_strategy(HtmlFormsStrategy::new(shared.clone()))
        .with_strategy(CssHiddenStrategy::new(shared))
        .build()
        .expect("Failed to build manager");

    let result = manager
        .resolve_url(&format!("{}/plain", server.uri()))
        .await
        .expect("valid url");
    assert!(!result.is_success());
    assert_eq!(result.status(), ResolutionStatus::Failed);
    assert_eq!(result.attempts().len(), manager.registry().len());

    let message = result.error_message().unwrap();
    assert!(message.starts_with("All resolution strategies failed:"));
    assert!(message.contains("• html_forms:"));
    assert!(message.contains("• css_hidden:"));
    assert_eq!(manager.stats().failed_resolutions, 1);
}

#[tokio::test]
async fn strategy_info_is_priority_ordered() {
    let manager = ResolutionManager::builder()
        .disable_proxies()
        .with_fetcher(fetcher())
        .build()
        .expect("Failed to build manager");

    let names: Vec<String> = manager
        .strategy_info()
        .into_iter()
        .map(|descriptor| descriptor.name)
        .collect();
    assert_eq!(
        names,
        [
            "html_forms",
            "css_hidden",
            "javascript",
            "cloudflare",
            "browser_auto",
            "shortener"
        ]
    );
}
