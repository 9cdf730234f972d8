//! Rendered-page resolution through an optional [`PageRenderer`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::Strategy;
use super::core::analysis::{build_regex, build_selector};
use super::core::{ResolutionResult, StrategyDescriptor, resolve_candidate, same_host};
use crate::external_deps::{PageRenderer, RenderError, RenderedPage};

const NAME: &str = "browser_auto";
const PRIORITY: u32 = 5;
const TIMEOUT: Duration = Duration::from_secs(60);

const DATA_ATTRIBUTES: &[&str] = &["data-url", "data-link", "data-href", "data-download"];
const LINK_TEXTS: &[&str] = &["download", "get link", "continue", "proceed", "click here", "go"];

static DIRECT_LINKS: Lazy<Vec<Selector>> = Lazy::new(|| {
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
        "[data-url]",
        "[data-link]",
        "[data-href]",
    ]
    .iter()
    .map(|css| build_selector(css))
    .collect()
});
static ANCHORS: Lazy<Selector> = Lazy::new(|| build_selector("a[href]"));

static SCRIPT_VARIABLES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"var\s+url\s*=\s*["'](https?://[^"']+)["']"#,
        r#"var\s+link\s*=\s*["'](https?://[^"']+)["']"#,
        r#"["'](https?://[^"']+)["']\s*;\s*//\s*download"#,
    ]
    .iter()
    .map(|pattern| build_regex(pattern))
    .collect()
});

/// Candidate hrefs in document order: known link shapes, then link text.
fn rendered_candidates(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut candidates = Vec::new();

    for selector in DIRECT_LINKS.iter() {
        for element in document.select(selector) {
            let value = element.value();
            if let Some(href) = value.attr("href") {
                candidates.push(href.to_string());
            }
            candidates.extend(
                DATA_ATTRIBUTES
                    .iter()
                    .filter_map(|attr| value.attr(attr))
                    .map(str::to_string),
            );
        }
    }

    for text in LINK_TEXTS {
        for anchor in document.select(&ANCHORS) {
            let label = anchor.text().collect::<String>().trim().to_lowercase();
            if label == *text || label.starts_with(&format!("{} ", text)) {
                candidates.extend(anchor.value().attr("href").map(str::to_string));
            }
        }
    }
    candidates
}

fn find_destination(rendered: &RenderedPage, requested: &Url) -> Option<(Url, &'static str)> {
    let base = &rendered.final_url;
    if let Some(link) = rendered_candidates(&rendered.html)
        .iter()
        .find_map(|raw| resolve_candidate(base, raw))
    {
        return Some((link, "direct_link"));
    }

    let scripted = SCRIPT_VARIABLES.iter().find_map(|pattern| {
        pattern
            .captures_iter(&rendered.html)
            .filter_map(|caps| caps.get(1))
            .find_map(|m| resolve_candidate(base, m.as_str()))
    });
    if let Some(link) = scripted {
        return Some((link, "js_extraction"));
    }

    (!same_host(base, requested)).then(|| (base.clone(), "final_url"))
}

/// Delegates to a headless browser when one is configured.
pub struct BrowserAutoStrategy {
    descriptor: StrategyDescriptor,
    renderer: Option<Arc<dyn PageRenderer>>,
}

impl BrowserAutoStrategy {
    pub fn new(renderer: Option<Arc<dyn PageRenderer>>) -> Self {
        Self {
            descriptor: StrategyDescriptor::new(NAME, PRIORITY, TIMEOUT),
            renderer,
        }
    }

    pub fn with_descriptor(mut self, descriptor: StrategyDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }
}

#[async_trait]
impl Strategy for BrowserAutoStrategy {
    fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }

    async fn execute(&self, url: &Url) -> ResolutionResult {
        let Some(renderer) = &self.renderer else {
            return ResolutionResult::unsupported(NAME, "No page renderer configured");
        };

        log::info!("[{}] rendering {} with {}", NAME, url, renderer.name());
        let rendered = match renderer.render(url, self.descriptor.timeout).await {
            Ok(rendered) => rendered,
            Err(RenderError::Timeout(after)) => {
                return ResolutionResult::timeout(NAME, format!("Render timed out after {:?}", after));
            }
            Err(err @ RenderError::Unavailable(_)) => {
                return ResolutionResult::unsupported(NAME, err.to_string());
            }
            Err(err) => return ResolutionResult::error(NAME, err.to_string()),
        };

        match find_destination(&rendered, url) {
            Some((target, technique)) => {
                log::info!("[{}] {} found: {}", NAME, technique, target);
                ResolutionResult::success(NAME, target)
                    .with_metadata("technique", technique)
                    .with_metadata("renderer", renderer.name())
            }
            None => ResolutionResult::failure(NAME, "Rendered page carried no destination"),
        }
    }
}
