//! Script-driven interstitials.
//!
//! Techniques, in order:
//! 1. literal redirect assignments in inline scripts, then sandboxed
//!    execution of the scripts with a stub `window`/`location`
//! 2. deobfuscation of string tricks (concatenation, `fromCharCode`, `atob`,
//!    `decodeURIComponent`, `\x`/`\u` escapes)
//! 3. timer and countdown redirects
//! 4. URL-bearing variables and JSON object literals
//! 5. AJAX endpoints referenced by the page, fetched and inspected

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
    FetchedPage, PageFetcher, PageRequest, ResolutionResult, StrategyDescriptor, decode_base64,
    extract_links, is_valid_candidate, json_link, percent_decode, resolve_candidate, same_host,
};
use crate::external_deps::JavascriptInterpreter;

const NAME: &str = "javascript";
const PRIORITY: u32 = 3;
const TIMEOUT: Duration = Duration::from_secs(20);
const AJAX_TIMEOUT: Duration = Duration::from_secs(10);

const LINK_KEYS: &[&str] = &["url", "link", "redirect", "href", "target"];
const AJAX_KEYS: &[&str] = &["url", "link", "redirect", "href", "target", "download"];

static INLINE_SCRIPTS: Lazy<Selector> = Lazy::new(|| build_selector("script:not([src])"));

fn regex_list(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|pattern| build_regex(pattern)).collect()
}

static REDIRECTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regex_list(&[
        r#"window\.location\s*=\s*["']([^"']+)["']"#,
        r#"window\.location\.href\s*=\s*["']([^"']+)["']"#,
        r#"location\.replace\(\s*["']([^"']+)["']\s*\)"#,
        r#"location\.assign\(\s*["']([^"']+)["']\s*\)"#,
        r#"top\.location\s*=\s*["']([^"']+)["']"#,
    ])
});

static CONCAT_CHAIN: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"(?:["'][^"'\n]*["']\s*\+\s*)+["'][^"'\n]*["']"#));
static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| build_regex(r#"["']([^"'\n]*)["']"#));
static FROM_CHAR_CODE: Lazy<Regex> =
    Lazy::new(|| build_regex(r"String\.fromCharCode\(([^)]+)\)"));
static ATOB: Lazy<Regex> = Lazy::new(|| build_regex(r#"atob\(\s*["']([A-Za-z0-9+/=_-]+)["']\s*\)"#));
static DECODE_URI: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"decodeURIComponent\(\s*["']([^"']+)["']\s*\)"#));
static HEX_ESCAPES: Lazy<Regex> = Lazy::new(|| build_regex(r#"["']((?:\\x[0-9a-f]{2})+)["']"#));
static UNICODE_ESCAPES: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"["']((?:\\u[0-9a-f]{4})+)["']"#));

static TIMERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regex_list(&[
        r"setTimeout\s*\(\s*function\s*\(\s*\)\s*\{[^}]*location[^}]*\}\s*,\s*\d+\s*\)",
        r#"setTimeout\s*\(\s*["']([^"']+)["']\s*,\s*\d+\s*\)"#,
        r"setInterval\s*\([^)]*location[^)]*\)",
    ])
});
static QUOTED_LINK: Lazy<Regex> = Lazy::new(|| build_regex(r#"["'](https?://[^"']+)["']"#));
static COUNTDOWN: Lazy<Regex> = Lazy::new(|| build_regex(r"var\s+\w+\s*=\s*\d+\s*;"));
static REVEALED_LINK: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r#"document\.getElementById\s*\(\s*["'][^"']+["']\s*\)\.\w+\s*=\s*["']([^"']+)["']"#,
    )
});

static VARIABLES: Lazy<Vec<Regex>> = Lazy::new(|| {
    regex_list(&[
        r#"\b(?:var|let|const)\s+(?:url|link|redirect|target)\s*=\s*["']([^"']+)["']"#,
    ])
});
static OBJECT_LITERAL: Lazy<Regex> = Lazy::new(|| build_regex(r"var\s+\w+\s*=\s*(\{[^;]+\})\s*;"));

static AJAX_CALLS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regex_list(&[
        r#"fetch\s*\(\s*["']([^"']+)["']"#,
        r#"\.ajax\s*\(\s*\{[^}]*url\s*:\s*["']([^"']+)["']"#,
        r#"XMLHttpRequest.*?\.open\s*\(\s*["']\w+["']\s*,\s*["']([^"']+)["']"#,
    ])
});

fn inline_scripts(body: &str) -> Vec<String> {
    let document = Html::parse_document(body);
    document
        .select(&INLINE_SCRIPTS)
        .map(|script| script.text().collect::<String>())
        .filter(|code| !code.trim().is_empty())
        .collect()
}

fn absolute(raw: &str) -> Option<Url> {
    Url::parse(raw.trim()).ok().filter(is_valid_candidate)
}

fn literal_redirect(scripts: &[String], base: &Url) -> Option<Url> {
    scripts.iter().find_map(|code| {
        REDIRECTS.iter().find_map(|pattern| {
            pattern
                .captures_iter(code)
                .filter_map(|caps| caps.get(1))
                .map(|m| m.as_str())
                .filter(|value| !value.starts_with('$') && !value.starts_with('{'))
                .find_map(|value| resolve_candidate(base, value))
        })
    })
}

fn decode_char_codes(list: &str) -> Option<String> {
    list.split(',')
        .map(|code| {
            let code = code.trim();
            match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => code.parse::<u32>().ok(),
            }
        })
        .map(|code| code.and_then(char::from_u32))
        .collect()
}

fn decode_hex_escapes(raw: &str) -> Option<String> {
    let bytes = raw
        .split("\\x")
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| u8::from_str_radix(chunk, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

fn decode_unicode_escapes(raw: &str) -> Option<String> {
    raw.split("\\u")
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| u32::from_str_radix(chunk, 16).ok().and_then(char::from_u32))
        .collect()
}

fn deobfuscate(body: &str) -> Option<Url> {
    let concatenated = CONCAT_CHAIN.find_iter(body).find_map(|chain| {
        let joined: String = STRING_LITERAL
            .captures_iter(chain.as_str())
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .collect();
        absolute(&joined)
    });
    if concatenated.is_some() {
        return concatenated;
    }

    let decoders: [(&Lazy<Regex>, fn(&str) -> Option<String>); 5] = [
        (&FROM_CHAR_CODE, decode_char_codes),
        (&ATOB, decode_base64),
        (&DECODE_URI, |raw| Some(percent_decode(raw))),
        (&HEX_ESCAPES, decode_hex_escapes),
        (&UNICODE_ESCAPES, decode_unicode_escapes),
    ];
    decoders.iter().find_map(|(pattern, decode)| {
        pattern
            .captures_iter(body)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| decode(m.as_str()))
            .find_map(|decoded| absolute(&decoded))
    })
}

fn timer_redirect(body: &str, base: &Url) -> Option<Url> {
    let timed = TIMERS.iter().find_map(|pattern| {
        let block = pattern.find(body)?;
        QUOTED_LINK
            .captures(block.as_str())
            .and_then(|caps| caps.get(1))
            .and_then(|m| absolute(m.as_str()))
    });
    if timed.is_some() {
        return timed;
    }

    if !COUNTDOWN.is_match(body) {
        return None;
    }
    REVEALED_LINK
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| resolve_candidate(base, m.as_str()))
}

fn variable_link(body: &str, base: &Url) -> Option<Url> {
    let assigned = VARIABLES.iter().find_map(|pattern| {
        pattern
            .captures_iter(body)
            .filter_map(|caps| caps.get(1))
            .find_map(|m| resolve_candidate(base, m.as_str()))
    });
    if assigned.is_some() {
        return assigned;
    }

    OBJECT_LITERAL
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| serde_json::from_str::<serde_json::Value>(m.as_str()).ok())
        .find_map(|value| json_link(&value, LINK_KEYS))
}

fn ajax_endpoints(body: &str, base: &Url) -> Vec<Url> {
    let mut endpoints: Vec<Url> = Vec::new();
    for pattern in AJAX_CALLS.iter() {
        for caps in pattern.captures_iter(body) {
            if let Some(url) = caps.get(1).and_then(|m| resolve_candidate(base, m.as_str()))
                && !endpoints.contains(&url)
            {
                endpoints.push(url);
            }
        }
    }
    endpoints
}

/// Inline-script analysis backed by a sandboxed interpreter.
pub struct JavascriptStrategy {
    descriptor: StrategyDescriptor,
    fetcher: Arc<dyn PageFetcher>,
    interpreter: Arc<dyn JavascriptInterpreter>,
}

impl JavascriptStrategy {
    pub fn new(fetcher: Arc<dyn PageFetcher>, interpreter: Arc<dyn JavascriptInterpreter>) -> Self {
        Self {
            descriptor: StrategyDescriptor::new(NAME, PRIORITY, TIMEOUT),
            fetcher,
            interpreter,
        }
    }

    pub fn with_descriptor(mut self, descriptor: StrategyDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Interpreter runs on the blocking pool; its errors only cost this technique.
    async fn execute_scripts(&self, scripts: Vec<String>, base: &Url) -> Option<Url> {
        if scripts.is_empty() {
            return None;
        }
        let interpreter = Arc::clone(&self.interpreter);
        let page_url = base.clone();
        let outcome =
            tokio::task::spawn_blocking(move || interpreter.capture_redirect(&scripts, &page_url))
                .await;

        match outcome {
            Ok(Ok(Some(target))) => resolve_candidate(base, &target),
            Ok(Ok(None)) => None,
            Ok(Err(err)) => {
                log::debug!("[{}] interpreter failed: {}", NAME, err);
                None
            }
            Err(err) => {
                log::warn!("[{}] interpreter task aborted: {}", NAME, err);
                None
            }
        }
    }

    async fn follow_ajax(
        &self,
        session: &dyn PageFetcher,
        page: &FetchedPage,
    ) -> Option<Url> {
        for endpoint in ajax_endpoints(&page.body, &page.url) {
            let request = PageRequest::get(endpoint.clone())
                .with_header("X-Requested-With", "XMLHttpRequest")
                .with_referer(page.url.as_str())
                .with_timeout(AJAX_TIMEOUT);
            let response = match session.fetch(request).await {
                Ok(response) if response.is_success() => response,
                Ok(response) => {
                    log::debug!("[{}] ajax {} -> HTTP {}", NAME, endpoint, response.status);
                    continue;
                }
                Err(err) => {
                    log::debug!("[{}] ajax {} failed: {}", NAME, endpoint, err);
                    continue;
                }
            };

            let found = match response.json() {
                Ok(value) => json_link(&value, AJAX_KEYS),
                Err(_) => extract_links(&response.body)
                    .iter()
                    .filter_map(|link| absolute(link))
                    .find(|link| !same_host(link, &page.url)),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

#[async_trait]
impl Strategy for JavascriptStrategy {
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

        let scripts = inline_scripts(&page.body);
        let found = match literal_redirect(&scripts, &page.url) {
            Some(target) => Some((target, "inline_script")),
            None => self
                .execute_scripts(scripts, &page.url)
                .await
                .map(|target| (target, "script_execution")),
        };
        let found = found
            .or_else(|| deobfuscate(&page.body).map(|target| (target, "deobfuscation")))
            .or_else(|| timer_redirect(&page.body, &page.url).map(|target| (target, "timer_bypass")))
            .or_else(|| {
                variable_link(&page.body, &page.url).map(|target| (target, "variable_extraction"))
            });
        let found = match found {
            Some(found) => Some(found),
            None => self
                .follow_ajax(session.as_ref(), &page)
                .await
                .map(|target| (target, "ajax_bypass")),
        };

        match found {
            Some((target, technique)) => {
                log::info!("[{}] {} found: {}", NAME, technique, target);
                ResolutionResult::success(NAME, target).with_metadata("technique", technique)
            }
            None => ResolutionResult::failure(NAME, "No JavaScript technique matched"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::BoaJavascriptInterpreter;
    use crate::strategies::ResolutionStatus;
    use crate::strategies::core::http::testing::{StubFetcher, page};

    const SHORT: &str = "https://short.test/abc";

    async fn run(fetcher: StubFetcher) -> (ResolutionResult, Arc<StubFetcher>) {
        let fetcher = Arc::new(fetcher);
        let strategy =
            JavascriptStrategy::new(fetcher.clone(), Arc::new(BoaJavascriptInterpreter::new()));
        let result = strategy.execute(&Url::parse(SHORT).unwrap()).await;
        (result, fetcher)
    }

    async fn resolve_body(body: &str) -> ResolutionResult {
        run(StubFetcher::pages(vec![page(200, SHORT, body)])).await.0
    }

    fn technique(result: &ResolutionResult) -> &str {
        result.metadata()["technique"].as_str().unwrap()
    }

    #[tokio::test]
    async fn literal_assignment() {
        let result =
            resolve_body(r#"<script>location.replace('https://dest.test/lit');</script>"#).await;
        assert_eq!(result.resolved_url().unwrap().as_str(), "https://dest.test/lit");
        assert_eq!(technique(&result), "inline_script");
    }

    #[tokio::test]
    async fn computed_redirect_runs_in_sandbox() {
        let body = r#"<script>
            var host = ["dest", "test"].join(".");
            setTimeout(function() { window.location.href = "https://" + host + "/run"; }, 3000);
        </script>"#;
        let result = resolve_body(body).await;
        assert_eq!(result.resolved_url().unwrap().as_str(), "https://dest.test/run");
        assert_eq!(technique(&result), "script_execution");
    }

    #[test]
    fn deobfuscation_variants() {
        let cases = [
            r#"var u = "https://" + "dest.test" + "/concat";"#,
            "var u = String.fromCharCode(104,116,116,112,115,58,47,47,100,46,116,47,99);",
            r#"var u = atob("aHR0cHM6Ly9kZXN0LnRlc3Qvb2s=");"#,
            r#"var u = decodeURIComponent("https%3A%2F%2Fdest.test%2Furi");"#,
            r#"var u = "\x68\x74\x74\x70\x73\x3a\x2f\x2f\x64\x2e\x74";"#,
            r#"var u = "\u0068\u0074\u0074\u0070\u003a\u002f\u002f\u0064\u002e\u0074";"#,
        ];
        let hosts: Vec<String> = cases
            .iter()
            .map(|case| deobfuscate(case).unwrap().host_str().unwrap().to_string())
            .collect();
        assert_eq!(
            hosts,
            ["dest.test", "d.t", "dest.test", "dest.test", "d.t", "d.t"]
        );
    }

    #[test]
    fn countdown_reveals_link() {
        let base = Url::parse(SHORT).unwrap();
        let body = r#"var seconds = 10;
            document.getElementById('btn').href = '/final/link';"#;
        assert_eq!(
            timer_redirect(body, &base).unwrap().as_str(),
            "https://short.test/final/link"
        );
    }

    #[test]
    fn json_object_literal() {
        let base = Url::parse(SHORT).unwrap();
        let body = r#"var cfg = {"id": 3, "link": "https://dest.test/json"};"#;
        assert_eq!(
            variable_link(body, &base).unwrap().as_str(),
            "https://dest.test/json"
        );
    }

    #[tokio::test]
    async fn ajax_endpoint_is_followed() {
        let body = r#"<div id="x"></div><p>fetch('/api/link?id=3')</p>"#;
        let fetcher = StubFetcher::pages(vec![
            page(200, SHORT, body),
            page(
                200,
                "https://short.test/api/link?id=3",
                r#"{"download": "https://dest.test/ajax"}"#,
            ),
        ]);
        let (result, fetcher) = run(fetcher).await;
        assert_eq!(result.resolved_url().unwrap().as_str(), "https://dest.test/ajax");
        assert_eq!(technique(&result), "ajax_bypass");

        let ajax = &fetcher.recorded()[1];
        assert!(
            ajax.headers
                .iter()
                .any(|(name, value)| name == "X-Requested-With" && value == "XMLHttpRequest")
        );
    }

    #[tokio::test]
    async fn static_page_fails() {
        let result = resolve_body("<p>nothing to see</p>").await;
        assert_eq!(result.status(), ResolutionStatus::Failed);
    }
}
