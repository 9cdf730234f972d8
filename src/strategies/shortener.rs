//! Table-driven handling for known link shorteners.
//!
//! Each [`SiteRule`] pairs a host fragment with a [`SiteHandler`]. Rules are
//! checked in table order, so more specific fragments go first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use url::Url;

use super::Strategy;
use super::core::analysis::build_selector;
use super::core::{
    FetchError, PageFetcher, PageRequest, ResolutionResult, StrategyDescriptor, json_link,
    resolve_candidate, same_host,
};

const NAME: &str = "shortener";
const PRIORITY: u32 = 10;
const TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_HOPS: usize = 10;

static NAMED_INPUTS: Lazy<Selector> = Lazy::new(|| build_selector("input[name]"));

/// How a matched shortener is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum SiteHandler {
    /// Scrape the interstitial form, wait out its timer and post it to
    /// `{endpoint}/links/go`, which answers with JSON carrying `url`.
    LinksGo {
        endpoint: String,
        referer: String,
        delay: Duration,
    },
    /// Follow `Location` headers by hand until the chain leaves the host.
    RedirectChain { max_hops: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteRule {
    /// Lowercased host fragment.
    pub pattern: String,
    pub handler: SiteHandler,
}

impl SiteRule {
    pub fn new(pattern: impl Into<String>, handler: SiteHandler) -> Self {
        Self {
            pattern: pattern.into().to_ascii_lowercase(),
            handler,
        }
    }

    pub fn links_go(pattern: &str, endpoint: &str, referer: &str, delay_secs: f64) -> Self {
        Self::new(
            pattern,
            SiteHandler::LinksGo {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                referer: referer.to_string(),
                delay: Duration::from_secs_f64(delay_secs),
            },
        )
    }

    pub fn redirect_chain(pattern: &str) -> Self {
        Self::new(
            pattern,
            SiteHandler::RedirectChain {
                max_hops: DEFAULT_MAX_HOPS,
            },
        )
    }

    fn matches(&self, host: &str) -> bool {
        host.contains(self.pattern.as_str())
    }
}

/// Built-in shortener table.
pub fn default_table() -> Vec<SiteRule> {
    vec![
        SiteRule::redirect_chain("bit.ly"),
        SiteRule::redirect_chain("tinyurl.com"),
        SiteRule::links_go("shrinkforearn", "https://shrinkforearn.in/", "https://wp.uploadfiles.in/", 10.0),
        SiteRule::links_go("gplinks", "https://gplinks.co/", "https://gplinks.co/", 5.0),
        SiteRule::links_go("link1s.com", "https://link1s.com/", "https://anhdep24.com/", 8.0),
        SiteRule::links_go("rocklinks", "https://insurance.techymedies.com/", "https://highkeyfinance.com/", 5.0),
        SiteRule::links_go("droplink", "https://droplink.co/", "https://droplink.co/", 3.0),
        SiteRule::links_go("linkfly", "https://go.linkfly.in", "https://techyblogs.in/", 4.0),
        SiteRule::links_go("narzolinks", "https://go.narzolinks.click/", "https://hydtech.in/", 5.0),
        SiteRule::links_go("adsfly", "https://go.adsfly.in/", "https://loans.quick91.com/", 5.0),
        SiteRule::links_go("link4earn", "https://link4earn.com", "https://studyis.xyz/", 5.0),
        SiteRule::links_go("sklinks", "https://sklinks.in", "https://sklinks.in/", 4.5),
        SiteRule::links_go("dalink", "https://get.tamilhit.tech/X/LOG-E/", "https://www.tamilhit.tech/", 8.0),
        SiteRule::links_go("sxslink", "https://getlink.sxslink.com/", "https://cinemapettai.in/", 5.0),
        SiteRule::links_go("seturl.in", "https://set.seturl.in/", "https://earn.petrainer.in/", 5.0),
        SiteRule::links_go("v2.kpslink.in", "https://v2download.kpslink.in/", "https://infotamizhan.xyz/", 5.0),
        SiteRule::links_go("kpslink.in", "https://get.infotamizhan.xyz/", "https://infotamizhan.xyz/", 5.0),
        SiteRule::links_go("linksly", "https://go.linksly.co", "https://en.themezon.net/", 10.0),
        SiteRule::links_go("linkbnao", "https://vip.linkbnao.com", "https://ffworld.xyz/", 2.0),
        SiteRule::links_go("vipurl", "https://count.vipurl.in/", "https://awuyro.com/", 8.0),
        SiteRule::links_go("tglink", "https://tglink.in/", "https://www.proappapk.com/", 5.0),
        SiteRule::links_go("mdiskpro", "https://mdisk.pro", "https://www.meclipstudy.in", 8.0),
        SiteRule::links_go("omegalinks", "https://tera-box.com", "https://m.meclipstudy.in", 8.0),
        SiteRule::links_go("ezlinks", "https://ez4short.com/", "https://ez4mods.com/", 5.0),
        SiteRule::links_go("shortingly", "https://go.blogytube.com/", "https://blogytube.com/", 1.0),
        SiteRule::links_go("gyanilinks", "https://go.hipsonyc.com", "https://earn.hostadviser.net", 5.0),
        SiteRule::links_go("flashlinks.in", "https://flashlinks.in", "https://flashlinks.online/", 13.0),
        SiteRule::links_go("moonlinks", "https://go.moonlinks.in/", "https://www.akcartoons.in/", 7.0),
        SiteRule::links_go("krownlinks", "https://go.hostadviser.net/", "https://blog.hostadviser.net/", 8.0),
        SiteRule::links_go("indianshortner", "https://indianshortner.com/", "https://moddingzone.in", 5.0),
        SiteRule::links_go("indshort", "https://indianshortner.com", "https://moddingzone.in", 5.0),
        SiteRule::links_go("shrinke", "https://en.shrinke.me/", "https://themezon.net/", 15.0),
        SiteRule::links_go("earnl", "https://v.earnl.xyz", "https://link.modmakers.xyz", 5.0),
        SiteRule::links_go("v2links", "https://vzu.us", "https://gadgetsreview27.com", 15.0),
        SiteRule::links_go("tnvalue", "https://get.tnvalue.in/", "https://finclub.in", 8.0),
        SiteRule::links_go("urlspay.in", "https://finance.smallinfo.in/", "https://loans.techyinfo.in/", 5.0),
        SiteRule::links_go("linkpays.in", "https://tech.smallinfo.in/Gadget/", "https://loan.insuranceinfos.in/", 5.0),
    ]
}

fn short_code(url: &Url) -> Option<&str> {
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
}

fn form_fields(body: &str) -> Vec<(String, String)> {
    let document = Html::parse_document(body);
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for input in document.select(&NAMED_INPUTS) {
        let element = input.value();
        let Some(name) = element.attr("name") else {
            continue;
        };
        let value = element.attr("value").unwrap_or_default().to_string();
        // Later duplicates win.
        match seen.get(name) {
            Some(&index) => fields[index].1 = value,
            None => {
                seen.insert(name.to_string(), fields.len());
                fields.push((name.to_string(), value));
            }
        }
    }
    fields
}

/// Known-shortener resolution driven by a site table.
pub struct ShortenerStrategy {
    descriptor: StrategyDescriptor,
    fetcher: Arc<dyn PageFetcher>,
    table: Vec<SiteRule>,
}

impl ShortenerStrategy {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self::with_table(fetcher, default_table())
    }

    pub fn with_table(fetcher: Arc<dyn PageFetcher>, table: Vec<SiteRule>) -> Self {
        let descriptor = StrategyDescriptor::new(NAME, PRIORITY, TIMEOUT)
            .with_supported_domains(table.iter().map(|rule| rule.pattern.clone()));
        Self {
            descriptor,
            fetcher,
            table,
        }
    }

    pub fn table(&self) -> &[SiteRule] {
        &self.table
    }

    fn rule_for(&self, url: &Url) -> Option<&SiteRule> {
        let host = url.host_str()?.to_ascii_lowercase();
        self.table.iter().find(|rule| rule.matches(&host))
    }

    async fn links_go(
        &self,
        session: &dyn PageFetcher,
        url: &Url,
        endpoint: &str,
        referer: &str,
        delay: Duration,
    ) -> Result<ResolutionResult, FetchError> {
        let Some(code) = short_code(url) else {
            return Ok(ResolutionResult::failure(NAME, "URL carries no short code"));
        };
        let landing = Url::parse(&format!("{}/{}", endpoint, code))
            .map_err(|err| FetchError::Client(err.to_string()))?;

        let page = session
            .fetch(
                PageRequest::get(landing)
                    .with_referer(referer)
                    .without_redirects(),
            )
            .await?;
        if page.status == 429 {
            return Ok(ResolutionResult::rate_limited(NAME, "HTTP 429 from shortener"));
        }

        let fields = form_fields(&page.body);
        if fields.is_empty() {
            return Ok(ResolutionResult::failure(
                NAME,
                format!("No form fields on {} (HTTP {})", page.url, page.status),
            ));
        }

        log::debug!(
            "[{}] waiting {:?} before posting {} fields",
            NAME,
            delay,
            fields.len()
        );
        tokio::time::sleep(delay).await;

        let go = Url::parse(&format!("{}/links/go", endpoint))
            .map_err(|err| FetchError::Client(err.to_string()))?;
        let reply = session
            .fetch(PageRequest::post_form(go, fields).with_header("X-Requested-With", "XMLHttpRequest"))
            .await?;
        if reply.status == 429 {
            return Ok(ResolutionResult::rate_limited(NAME, "HTTP 429 from shortener"));
        }

        let target = reply
            .json()
            .ok()
            .and_then(|value| json_link(&value, &["url"]));
        Ok(match target {
            Some(target) => ResolutionResult::success(NAME, target),
            None => ResolutionResult::failure(
                NAME,
                format!("links/go reply carried no url (HTTP {})", reply.status),
            ),
        })
    }

    async fn redirect_chain(
        &self,
        session: &dyn PageFetcher,
        url: &Url,
        max_hops: usize,
    ) -> Result<ResolutionResult, FetchError> {
        let mut current = url.clone();
        for hop in 0..max_hops {
            let page = session
                .fetch(PageRequest::get(current.clone()).without_redirects())
                .await?;
            let next = page
                .is_redirect()
                .then(|| page.location())
                .flatten()
                .and_then(|location| resolve_candidate(&current, location));

            match next {
                Some(next) => {
                    log::debug!("[{}] hop {}: {} -> {}", NAME, hop + 1, current, next);
                    current = next;
                }
                None if same_host(&current, url) => {
                    return Ok(ResolutionResult::failure(
                        NAME,
                        format!("Redirect chain ended on the shortener (HTTP {})", page.status),
                    ));
                }
                None => {
                    return Ok(ResolutionResult::success(NAME, current)
                        .with_metadata("hops", hop));
                }
            }
        }
        Ok(ResolutionResult::failure(
            NAME,
            format!("Redirect chain exceeded {} hops", max_hops),
        ))
    }
}

#[async_trait]
impl Strategy for ShortenerStrategy {
    fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }

    async fn execute(&self, url: &Url) -> ResolutionResult {
        let Some(rule) = self.rule_for(url) else {
            return ResolutionResult::unsupported(NAME, "No shortener rule for this host");
        };
        log::info!("[{}] {} matched rule {}", NAME, url, rule.pattern);

        let session = match self.fetcher.session().await {
            Ok(session) => session,
            Err(err) => return err.into_result(NAME),
        };
        let outcome = match &rule.handler {
            SiteHandler::LinksGo {
                endpoint,
                referer,
                delay,
            } => {
                self.links_go(session.as_ref(), url, endpoint, referer, *delay)
                    .await
            }
            SiteHandler::RedirectChain { max_hops } => {
                self.redirect_chain(session.as_ref(), url, *max_hops).await
            }
        };

        match outcome {
            Ok(result) => result.with_metadata("rule", rule.pattern.as_str()),
            Err(err) => err.into_result(NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::ResolutionStatus;
    use crate::strategies::core::http::testing::{StubFetcher, page, redirect};
    use reqwest::Method;

    fn table() -> Vec<SiteRule> {
        vec![
            SiteRule::links_go("go.short.test", "https://go.short.test/", "https://blog.test/", 0.001),
            SiteRule::redirect_chain("tiny.test"),
        ]
    }

    async fn run(url: &str, fetcher: StubFetcher) -> (ResolutionResult, Arc<StubFetcher>) {
        let fetcher = Arc::new(fetcher);
        let strategy = ShortenerStrategy::with_table(fetcher.clone(), table());
        let result = strategy.resolve(&Url::parse(url).unwrap()).await;
        (result, fetcher)
    }

    #[test]
    fn default_table_feeds_allow_list() {
        let strategy = ShortenerStrategy::new(Arc::new(StubFetcher::pages(vec![])));
        let supports = |raw: &str| strategy.descriptor().supports(&Url::parse(raw).unwrap());
        assert!(supports("https://gplinks.co/abc"));
        assert!(supports("https://bit.ly/xyz"));
        assert!(!supports("https://example.com/abc"));

        let host = Url::parse("https://v2.kpslink.in/q").unwrap();
        let rule = strategy.rule_for(&host).unwrap();
        assert_eq!(rule.pattern, "v2.kpslink.in");
    }

    #[test]
    fn duplicate_inputs_keep_last_value() {
        let fields = form_fields(
            r#"<input name="_token" value="a"><input name="alias" value="x"><input name="_token" value="b"><input value="anon">"#,
        );
        assert_eq!(
            fields,
            vec![
                ("_token".to_string(), "b".to_string()),
                ("alias".to_string(), "x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn links_go_posts_form_and_reads_url() {
        let landing = r#"<form><input name="_csrfToken" value="t0k"><input name="ad_form_data" value="blob"></form>"#;
        let fetcher = StubFetcher::pages(vec![
            page(200, "https://go.short.test/AbC12", landing),
            page(
                200,
                "https://go.short.test/links/go",
                r#"{"status":"success","url":"https://dest.test/file"}"#,
            ),
        ]);
        let (result, fetcher) = run("https://go.short.test/AbC12/", fetcher).await;

        assert_eq!(result.resolved_url().unwrap().as_str(), "https://dest.test/file");
        assert_eq!(result.metadata()["rule"], "go.short.test");

        let requests = fetcher.recorded();
        assert_eq!(requests[0].url.as_str(), "https://go.short.test/AbC12");
        assert!(!requests[0].follow_redirects);
        assert!(requests[0]
            .headers
            .contains(&("referer".to_string(), "https://blog.test/".to_string())));

        assert_eq!(requests[1].method, Method::POST);
        assert_eq!(requests[1].url.as_str(), "https://go.short.test/links/go");
        assert_eq!(requests[1].form.as_ref().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn links_go_without_url_fails() {
        let fetcher = StubFetcher::pages(vec![
            page(200, "https://go.short.test/x", r#"<input name="a" value="1">"#),
            page(200, "https://go.short.test/links/go", r#"{"status":"error"}"#),
        ]);
        let (result, _) = run("https://go.short.test/x", fetcher).await;
        assert_eq!(result.status(), ResolutionStatus::Failed);
    }

    #[tokio::test]
    async fn redirect_chain_leaves_shortener() {
        let fetcher = StubFetcher::pages(vec![
            redirect("https://tiny.test/q", "/q2"),
            redirect("https://tiny.test/q2", "https://dest.test/page"),
            page(200, "https://dest.test/page", "<p>hi</p>"),
        ]);
        let (result, fetcher) = run("https://tiny.test/q", fetcher).await;
        assert_eq!(result.resolved_url().unwrap().as_str(), "https://dest.test/page");
        assert_eq!(result.metadata()["hops"], 2);
        assert!(fetcher.recorded().iter().all(|request| !request.follow_redirects));
    }

    #[tokio::test]
    async fn unknown_host_is_unsupported() {
        let (result, fetcher) = run("https://other.test/q", StubFetcher::pages(vec![])).await;
        assert_eq!(result.status(), ResolutionStatus::Unsupported);
        assert!(fetcher.recorded().is_empty());
    }
}
