//! Plain HTML techniques: meta refresh, form replay, link scraping.
//!
//! Handles shorteners whose interstitial page works without scripts. The
//! page is fetched once; techniques run against it in a fixed order and the
//! first valid absolute URL wins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::core::analysis::{build_regex, build_selector};
use super::core::{
    FetchedPage, PageFetcher, PageRequest, ResolutionResult, StrategyDescriptor,
    decode_base64_link, resolve_candidate, same_host,
};
use super::Strategy;

const NAME: &str = "html_forms";
const PRIORITY: u32 = 1;
const TIMEOUT: Duration = Duration::from_secs(15);

static META_REFRESH: Lazy<Selector> = Lazy::new(|| build_selector(r#"meta[http-equiv]"#));
static OG_URL: Lazy<Selector> = Lazy::new(|| build_selector(r#"meta[property="og:url"]"#));
static FORMS: Lazy<Selector> = Lazy::new(|| build_selector("form"));
static FORM_FIELDS: Lazy<Selector> =
    Lazy::new(|| build_selector("input[name], textarea[name], select[name]"));
static ANCHORS: Lazy<Selector> = Lazy::new(|| build_selector("a[href]"));

static DIRECT_LINKS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"a[href*="download"]"#,
        r#"a[href*="direct"]"#,
        "a.btn-download",
        "a.download-button",
        "a#download",
        ".download-link a",
        r#"a[href*=".mp4"]"#,
        r#"a[href*=".mkv"]"#,
        r#"a[href*=".zip"]"#,
        r#"a[href*=".rar"]"#,
        r#"a[href*=".pdf"]"#,
        r#"a[href*="drive.google.com"]"#,
        r#"a[href*="mega.nz"]"#,
        r#"a[href*="mediafire.com"]"#,
    ]
    .into_iter()
    .map(build_selector)
    .collect()
});

static REFRESH_URL: Lazy<Regex> = Lazy::new(|| build_regex(r#"url\s*=\s*["']?([^"';]+)"#));

static BASE64_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"atob\(["']([A-Za-z0-9+/=]+)["']\)"#,
        r#"base64["']?\s*[:=]\s*["']?([A-Za-z0-9+/=]+)"#,
        r#"["']([A-Za-z0-9+/=]{20,})["']"#,
        r#"var\s+\w+\s*=\s*["']([A-Za-z0-9+/=]+)["']"#,
    ]
    .into_iter()
    .map(build_regex)
    .collect()
});

static JS_REDIRECTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"window\.location\s*=\s*["']([^"']+)["']"#,
        r#"window\.location\.href\s*=\s*["']([^"']+)["']"#,
        r#"location\.replace\(\s*["']([^"']+)["']\s*\)"#,
        r#"location\.assign\(\s*["']([^"']+)["']\s*\)"#,
        r#"top\.location\s*=\s*["']([^"']+)["']"#,
        r#"window\.open\(\s*["']([^"']+)["']"#,
    ]
    .into_iter()
    .map(build_regex)
    .collect()
});

#[derive(Debug, Clone, PartialEq)]
struct FormSpec {
    action: Url,
    post: bool,
    fields: Vec<(String, String)>,
}

impl FormSpec {
    fn into_request(self, timeout: Duration) -> PageRequest {
        let request = if self.post {
            PageRequest::post_form(self.action, self.fields)
        } else {
            let mut target = self.action;
            if !self.fields.is_empty() {
                target
                    .query_pairs_mut()
                    .extend_pairs(self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }
            PageRequest::get(target)
        };
        request.with_timeout(timeout)
    }
}

/// Everything the techniques need from one parsed document.
#[derive(Debug, Default)]
struct PageFindings {
    meta_refresh: Option<Url>,
    forms: Vec<FormSpec>,
    direct_link: Option<Url>,
    external_link: Option<Url>,
}

fn analyse(body: &str, base: &Url) -> PageFindings {
    let document = Html::parse_document(body);
    PageFindings {
        meta_refresh: meta_refresh(&document, base),
        forms: forms(&document, base),
        direct_link: direct_link(&document, base),
        external_link: external_link(&document, base),
    }
}

fn meta_refresh(document: &Html, base: &Url) -> Option<Url> {
    let refresh = document
        .select(&META_REFRESH)
        .filter(|meta| {
            meta.value()
                .attr("http-equiv")
                .is_some_and(|value| value.eq_ignore_ascii_case("refresh"))
        })
        .filter_map(|meta| meta.value().attr("content"))
        .filter_map(|content| REFRESH_URL.captures(content))
        .find_map(|caps| caps.get(1).and_then(|m| resolve_candidate(base, m.as_str())));
    if refresh.is_some() {
        return refresh;
    }

    // og:url usually echoes the page itself; only an off-site value is a target
    document
        .select(&OG_URL)
        .filter_map(|meta| meta.value().attr("content"))
        .filter_map(|content| resolve_candidate(base, content))
        .find(|url| !same_host(url, base))
}

fn forms(document: &Html, base: &Url) -> Vec<FormSpec> {
    document
        .select(&FORMS)
        .filter_map(|form| {
            let action = match form.value().attr("action").map(str::trim) {
                Some(action) if !action.is_empty() => base.join(action).ok()?,
                _ => base.clone(),
            };
            let post = form
                .value()
                .attr("method")
                .is_some_and(|method| method.eq_ignore_ascii_case("post"));
            let fields = form
                .select(&FORM_FIELDS)
                .filter_map(|field| {
                    let name = field.value().attr("name")?;
                    Some((name.to_string(), field_value(&field)))
                })
                .collect();
            Some(FormSpec {
                action,
                post,
                fields,
            })
        })
        .collect()
}

fn field_value(field: &ElementRef<'_>) -> String {
    match field.value().name() {
        "textarea" => field.text().collect(),
        _ => field.value().attr("value").unwrap_or_default().to_string(),
    }
}

fn direct_link(document: &Html, base: &Url) -> Option<Url> {
    DIRECT_LINKS.iter().find_map(|selector| {
        document
            .select(selector)
            .filter_map(|link| link.value().attr("href"))
            .find_map(|href| resolve_candidate(base, href))
    })
}

fn external_link(document: &Html, base: &Url) -> Option<Url> {
    document
        .select(&ANCHORS)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| resolve_candidate(base, href))
        .find(|url| !same_host(url, base))
}

fn base64_link(body: &str) -> Option<Url> {
    BASE64_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures_iter(body)
            .filter_map(|caps| caps.get(1))
            .find_map(|m| decode_base64_link(m.as_str()))
    })
}

fn js_redirect(body: &str, base: &Url) -> Option<Url> {
    JS_REDIRECTS.iter().find_map(|pattern| {
        pattern
            .captures(body)
            .and_then(|caps| caps.get(1))
            .and_then(|m| resolve_candidate(base, m.as_str()))
    })
}

/// Meta refresh, form replay, and link scraping over a single page fetch.
pub struct HtmlFormsStrategy {
    descriptor: StrategyDescriptor,
    fetcher: Arc<dyn PageFetcher>,
}

impl HtmlFormsStrategy {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            descriptor: StrategyDescriptor::new(NAME, PRIORITY, TIMEOUT),
            fetcher,
        }
    }

    pub fn with_descriptor(mut self, descriptor: StrategyDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    fn found(&self, url: Url, technique: &str) -> ResolutionResult {
        log::info!("[{}] {} found: {}", NAME, technique, url);
        ResolutionResult::success(NAME, url).with_metadata("technique", technique)
    }

    /// Replay each form; a redirect away from the page or a link in the
    /// response counts as the destination.
    async fn submit_forms(
        &self,
        session: &dyn PageFetcher,
        forms: Vec<FormSpec>,
        page: &FetchedPage,
    ) -> Option<Url> {
        for form in forms {
            let request = form.into_request(self.descriptor.timeout);
            let requested = request.url.clone();
            let response = match session.fetch(request).await {
                Ok(response) => response,
                Err(err) => {
                    log::debug!("[{}] form submission to {} failed: {}", NAME, requested, err);
                    continue;
                }
            };

            if response.is_success()
                && response.url != requested
                && !same_host(&response.url, &page.url)
            {
                return Some(response.url);
            }

            let findings = analyse(&response.body, &response.url);
            if let Some(url) = findings.direct_link.or(findings.external_link) {
                return Some(url);
            }
        }
        None
    }
}

#[async_trait]
impl Strategy for HtmlFormsStrategy {
    fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }

    async fn execute(&self, url: &Url) -> ResolutionResult {
        log::info!("[{}] attempting {}", NAME, url);
        let session = match self.fetcher.session().await {
            Ok(session) => session,
            Err(err) => return err.into_result(NAME),
        };
        let request = PageRequest::get(url.clone()).with_timeout(self.descriptor.timeout);
        let page = match session.fetch(request).await {
            Ok(page) => page,
            Err(err) => return err.into_result(NAME),
        };

        if page.status == 429 {
            return ResolutionResult::rate_limited(NAME, "HTTP 429 from shortener");
        }
        if !page.is_success() {
            return ResolutionResult::error(NAME, format!("HTTP {} for {}", page.status, page.url));
        }

        let findings = analyse(&page.body, &page.url);

        if let Some(target) = findings.meta_refresh {
            return self.found(target, "meta_refresh");
        }
        if let Some(target) = self.submit_forms(session.as_ref(), findings.forms, &page).await {
            return self.found(target, "form_submission");
        }
        if let Some(target) = findings.direct_link {
            return self.found(target, "direct_link");
        }
        if let Some(target) = findings.external_link {
            return self.found(target, "external_link");
        }
        if let Some(target) = base64_link(&page.body) {
            return self.found(target, "base64_decode");
        }
        if let Some(target) = js_redirect(&page.body, &page.url) {
            return self.found(target, "js_redirect");
        }

        ResolutionResult::failure(NAME, "No bypass technique matched")
    }
}
