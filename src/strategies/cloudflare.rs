//! Anti-bot interstitial handling.
//!
//! The page is requested the way a browser would: first directly, then
//! through a warmed session (homepage visit for cookies, search-engine
//! referer, matching `Origin`), and finally once more after the delay the
//! server asked for. Any attempt that comes back without a challenge marker
//! is mined for the destination.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::Strategy;
use super::core::analysis::{build_regex, build_selector};
use super::core::{
    FetchError, FetchedPage, PageFetcher, PageRequest, ResolutionResult, StrategyDescriptor,
    origin_from_url, resolve_candidate, same_host,
};

const NAME: &str = "cloudflare";
const PRIORITY: u32 = 4;
const TIMEOUT: Duration = Duration::from_secs(45);
const HOMEPAGE_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_REFERER: &str = "https://www.google.com/";
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(15);

const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf-im-under-attack",
    "cf-challenge",
    "challenge-platform",
    "cf-turnstile",
    "cf_chl_jschl_tk",
    "cf_chl_captcha_tk",
    "cf_chl_prog",
    "checking your browser",
    "ddos protection",
    "cf-spinner-please-wait",
    "cf-captcha-bookmark",
];

static CHALLENGE_TITLE: Lazy<Regex> =
    Lazy::new(|| build_regex(r"<title>\s*(?:just a moment|attention required)"));

static DOWNLOAD_LINKS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"a[href*="download"]"#,
        "a.download",
        "a.btn-download",
        "a#download",
        r#"a[href*="drive.google.com"]"#,
        r#"a[href*="mega.nz"]"#,
        r#"a[href*="mediafire.com"]"#,
        r#"a[href*=".mp4"]"#,
        r#"a[href*=".mkv"]"#,
        r#"a[href*=".zip"]"#,
    ]
    .iter()
    .map(|css| build_selector(css))
    .collect()
});
static ANCHORS: Lazy<Selector> = Lazy::new(|| build_selector("a[href]"));

/// Whether a response is an anti-bot interstitial rather than content.
pub fn is_challenge(page: &FetchedPage) -> bool {
    let served_by_cloudflare = page
        .header("server")
        .is_some_and(|server| server.to_ascii_lowercase().starts_with("cloudflare"));
    if served_by_cloudflare && matches!(page.status, 403 | 503) {
        return true;
    }

    let lowered = page.body.to_ascii_lowercase();
    CHALLENGE_TITLE.is_match(&page.body)
        || CHALLENGE_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
}

fn retry_after(page: &FetchedPage) -> Option<Duration> {
    page.header("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn page_link(body: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(body);
    let hrefs = |selector: &Selector| -> Vec<String> {
        document
            .select(selector)
            .filter_map(|anchor| anchor.value().attr("href"))
            .map(str::to_string)
            .collect()
    };

    let download = DOWNLOAD_LINKS
        .iter()
        .flat_map(|selector| hrefs(selector))
        .find_map(|href| resolve_candidate(base, &href));
    if download.is_some() {
        return download;
    }

    hrefs(&ANCHORS)
        .iter()
        .filter(|href| href.starts_with("http"))
        .filter_map(|href| resolve_candidate(base, href))
        .find(|link| !same_host(link, base))
}

/// Destination carried by a cleared page: an off-host redirect, else a link.
fn destination(page: &FetchedPage, requested: &Url) -> Option<Url> {
    if !same_host(&page.url, requested) {
        return Some(page.url.clone());
    }
    page_link(&page.body, &page.url)
}

enum Outcome {
    Resolved(Url),
    Challenged,
    RateLimited(Option<Duration>),
    Nothing,
}

/// Browser-shaped retries against challenge-protected hosts.
pub struct CloudflareStrategy {
    descriptor: StrategyDescriptor,
    fetcher: Arc<dyn PageFetcher>,
    retry_delay: Duration,
}

impl CloudflareStrategy {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            descriptor: StrategyDescriptor::new(NAME, PRIORITY, TIMEOUT),
            fetcher,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_descriptor(mut self, descriptor: StrategyDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Delay before the last retry when the server gives no `Retry-After`.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn inspect(&self, technique: &str, page: FetchedPage, requested: &Url) -> Outcome {
        if page.status == 429 {
            log::debug!("[{}] {} rate limited", NAME, technique);
            return Outcome::RateLimited(retry_after(&page));
        }
        if is_challenge(&page) {
            log::debug!("[{}] {} hit a challenge (HTTP {})", NAME, technique, page.status);
            return Outcome::Challenged;
        }
        if !page.is_success() {
            return Outcome::Nothing;
        }
        destination(&page, requested).map_or(Outcome::Nothing, Outcome::Resolved)
    }

    async fn attempt(
        &self,
        session: &dyn PageFetcher,
        technique: &str,
        request: PageRequest,
        requested: &Url,
    ) -> Result<Outcome, FetchError> {
        let page = session.fetch(request).await?;
        Ok(self.inspect(technique, page, requested))
    }

    async fn warm_session(
        &self,
        session: &dyn PageFetcher,
        url: &Url,
    ) -> Result<Outcome, FetchError> {
        let origin = origin_from_url(url);
        if let Ok(homepage) = Url::parse(&origin) {
            let visit = PageRequest::get(homepage).with_timeout(HOMEPAGE_TIMEOUT);
            if let Err(err) = session.fetch(visit).await {
                log::debug!("[{}] homepage visit failed: {}", NAME, err);
            }
        }

        let request = PageRequest::get(url.clone())
            .with_referer(SEARCH_REFERER)
            .with_header("Origin", origin)
            .with_timeout(self.descriptor.timeout);
        self.attempt(session, "warmed_session", request, url).await
    }
}

#[async_trait]
impl Strategy for CloudflareStrategy {
    fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }

    async fn execute(&self, url: &Url) -> ResolutionResult {
        log::info!("[{}] attempting {}", NAME, url);
        let direct = PageRequest::get(url.clone()).with_timeout(self.descriptor.timeout);
        let session = match self.fetcher.session().await {
            Ok(session) => session,
            Err(err) => return err.into_result(NAME),
        };
        let session = session.as_ref();

        let mut rate_limited = false;
        let mut wait = self.retry_delay;
        let mut last_error = None;

        for technique in ["direct", "warmed_session", "delayed_retry"] {
            let outcome = match technique {
                "direct" => self.attempt(session, technique, direct.clone(), url).await,
                "warmed_session" => self.warm_session(session, url).await,
                _ => {
                    tokio::time::sleep(wait.min(MAX_RETRY_DELAY)).await;
                    self.attempt(session, technique, direct.clone(), url).await
                }
            };

            match outcome {
                Ok(Outcome::Resolved(target)) => {
                    log::info!("[{}] {} cleared: {}", NAME, technique, target);
                    return ResolutionResult::success(NAME, target)
                        .with_metadata("technique", technique);
                }
                Ok(Outcome::RateLimited(requested_wait)) => {
                    rate_limited = true;
                    if let Some(requested_wait) = requested_wait {
                        wait = requested_wait;
                    }
                }
                Ok(Outcome::Challenged) | Ok(Outcome::Nothing) => {}
                Err(FetchError::Timeout) => {
                    return ResolutionResult::timeout(NAME, format!("{} timed out", technique));
                }
                Err(err) => {
                    log::debug!("[{}] {} failed: {}", NAME, technique, err);
                    last_error = Some(err);
                }
            }
        }

        if rate_limited {
            return ResolutionResult::rate_limited(NAME, "Rate limited on every attempt");
        }
        match last_error {
            Some(err) => ResolutionResult::error(NAME, err.to_string()),
            None => ResolutionResult::failure(NAME, "Challenge could not be cleared"),
        }
    }
}
