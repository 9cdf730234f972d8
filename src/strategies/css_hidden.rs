//! Links concealed with stylesheets.
//!
//! Some interstitials render the real destination but hide it: an anchor
//! with `display:none`, a URL drawn through `content:` in a pseudo element,
//! text shrunk to zero size, or a link parked in an HTML comment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Node, Selector};
use url::Url;

use super::Strategy;
use super::core::analysis::{build_regex, build_selector};
use super::core::{
    PageFetcher, PageRequest, ResolutionResult, StrategyDescriptor, decode_base64_link,
    extract_links, is_valid_candidate, resolve_candidate,
};

const NAME: &str = "css_hidden";
const PRIORITY: u32 = 2;
const TIMEOUT: Duration = Duration::from_secs(15);
const STYLESHEET_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_STYLESHEETS: usize = 5;

static STYLE_BLOCKS: Lazy<Selector> = Lazy::new(|| build_selector("style"));
static STYLESHEETS: Lazy<Selector> =
    Lazy::new(|| build_selector(r#"link[rel~="stylesheet"][href]"#));
static STYLED: Lazy<Selector> = Lazy::new(|| build_selector("[style]"));
static ANCHORS: Lazy<Selector> = Lazy::new(|| build_selector("a[href]"));

static HIDDEN_STYLE: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r"display\s*:\s*none|visibility\s*:\s*hidden|opacity\s*:\s*0(?:\.0+)?\s*(?:;|!|$)|(?:^|[^-])(?:height|width)\s*:\s*0(?:px)?\s*(?:;|!|$)|z-index\s*:\s*-",
    )
});
static OFFSCREEN_STYLE: Lazy<Regex> = Lazy::new(|| build_regex(r"left\s*:\s*-\d"));
static ABSOLUTE_STYLE: Lazy<Regex> = Lazy::new(|| build_regex(r"position\s*:\s*absolute"));
static TEXT_INDENT: Lazy<Regex> = Lazy::new(|| build_regex(r"text-indent\s*:\s*-?\d+px"));
static ZERO_FONT: Lazy<Regex> = Lazy::new(|| build_regex(r"font-size\s*:\s*0"));
static CONTENT_STRING: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"content\s*:\s*["']([^"']+)["']"#));
static CONTENT_ATTR: Lazy<Regex> = Lazy::new(|| build_regex(r"content\s*:\s*attr\(([^)]+)\)"));
static BASE64_RUN: Lazy<Regex> = Lazy::new(|| build_regex(r"[A-Za-z0-9+/]{20,}={0,2}"));

const HIDING_RULE: &str =
    r"(?:[^\w-][^{}]*)?\{[^}]*(?:display\s*:\s*none|visibility\s*:\s*hidden|opacity\s*:\s*0)";

/// `.name {..display:none..}` or `#name {..}` present in the stylesheet text.
fn rule_hides(prefix: &str, name: &str, css: &str) -> bool {
    let pattern = format!(r"{}{}{}", regex::escape(prefix), regex::escape(name), HIDING_RULE);
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(css))
        .unwrap_or(false)
}

fn style_hides(style: &str) -> bool {
    HIDDEN_STYLE.is_match(style)
        || (ABSOLUTE_STYLE.is_match(style) && OFFSCREEN_STYLE.is_match(style))
}

fn inline_css(document: &Html) -> String {
    let mut parts: Vec<String> = document
        .select(&STYLE_BLOCKS)
        .map(|style| style.text().collect())
        .collect();
    parts.extend(
        document
            .select(&STYLED)
            .filter_map(|element| element.value().attr("style"))
            .map(|style| format!("{{ {style} }}")),
    );
    parts.join("\n")
}

fn stylesheet_urls(document: &Html, base: &Url) -> Vec<Url> {
    document
        .select(&STYLESHEETS)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| resolve_candidate(base, href))
        .take(MAX_STYLESHEETS)
        .collect()
}

fn hidden_link(document: &Html, css: &str, base: &Url) -> Option<Url> {
    document
        .select(&ANCHORS)
        .filter(|link| {
            let element = link.value();
            element.attr("style").is_some_and(style_hides)
                || element.classes().any(|class| rule_hides(".", class, css))
                || element.id().is_some_and(|id| rule_hides("#", id, css))
        })
        .filter_map(|link| link.value().attr("href"))
        .find_map(|href| resolve_candidate(base, href))
}

fn text_nodes(document: &Html) -> impl Iterator<Item = (Option<String>, String)> + '_ {
    document.tree.root().descendants().filter_map(|node| match node.value() {
        Node::Text(text) => {
            let parent = node
                .parent()
                .and_then(|parent| parent.value().as_element().map(|e| e.name().to_string()));
            Some((parent, text.to_string()))
        }
        _ => None,
    })
}

fn absolute(raw: &str) -> Option<Url> {
    Url::parse(raw.trim())
        .ok()
        .filter(is_valid_candidate)
}

/// Text made unreadable by indentation or zero font size, plus `content:` strings.
fn css_content(document: &Html, css: &str) -> Option<Url> {
    if TEXT_INDENT.is_match(css) {
        let found = text_nodes(document)
            .map(|(_, text)| text.trim().to_string())
            .filter(|text| text.starts_with("http"))
            .find_map(|text| absolute(&text));
        if found.is_some() {
            return found;
        }
    }

    if ZERO_FONT.is_match(css) {
        let combined: String = text_nodes(document)
            .filter(|(parent, _)| {
                matches!(parent.as_deref(), Some("span" | "div" | "i" | "b"))
            })
            .map(|(_, text)| text.trim().to_string())
            .collect();
        if let Some(url) = absolute(&combined) {
            return Some(url);
        }
    }

    let pieces: Vec<String> = CONTENT_STRING
        .captures_iter(css)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().replace('\\', ""))
        .collect();
    pieces
        .iter()
        .find_map(|piece| absolute(piece))
        .or_else(|| absolute(&pieces.concat()))
}

/// `content: attr(data-x)` draws an attribute value; look it up on the page.
fn pseudo_element(document: &Html, css: &str, base: &Url) -> Option<Url> {
    CONTENT_ATTR
        .captures_iter(css)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .find_map(|attr| {
            let selector = Selector::parse(&format!("[{attr}]")).ok()?;
            document
                .select(&selector)
                .filter_map(|element| element.value().attr(&attr))
                .find_map(|value| resolve_candidate(base, value))
        })
}

fn html_comment(document: &Html, base: &Url) -> Option<Url> {
    let comments = document
        .tree
        .root()
        .descendants()
        .filter_map(|node| match node.value() {
            Node::Comment(comment) => Some(comment.to_string()),
            _ => None,
        });

    for comment in comments {
        if let Some(url) = extract_links(&comment)
            .iter()
            .find_map(|link| resolve_candidate(base, link))
        {
            return Some(url);
        }
        if let Some(url) = BASE64_RUN
            .find_iter(&comment)
            .find_map(|m| decode_base64_link(m.as_str()))
        {
            return Some(url);
        }
    }
    None
}

/// Stylesheet-aware link recovery.
pub struct CssHiddenStrategy {
    descriptor: StrategyDescriptor,
    fetcher: Arc<dyn PageFetcher>,
}

impl CssHiddenStrategy {
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

    /// External stylesheets; unreachable sheets are skipped.
    async fn fetch_stylesheets(&self, urls: Vec<Url>) -> Vec<String> {
        let mut sheets = Vec::with_capacity(urls.len());
        for url in urls {
            match self.fetcher.get(&url, STYLESHEET_TIMEOUT).await {
                Ok(sheet) if sheet.is_success() => sheets.push(sheet.body),
                Ok(sheet) => log::debug!("[{}] stylesheet {} -> HTTP {}", NAME, url, sheet.status),
                Err(err) => log::debug!("[{}] stylesheet {} failed: {}", NAME, url, err),
            }
        }
        sheets
    }
}

#[async_trait]
impl Strategy for CssHiddenStrategy {
    fn descriptor(&self) -> &StrategyDescriptor {
        &self.descriptor
    }

    async fn execute(&self, url: &Url) -> ResolutionResult {
        log::info!("[{}] attempting {}", NAME, url);
        let request = PageRequest::get(url.clone()).with_timeout(self.descriptor.timeout);
        let page = match self.fetcher.fetch(request).await {
            Ok(page) => page,
            Err(err) => return err.into_result(NAME),
        };
        if page.status == 429 {
            return ResolutionResult::rate_limited(NAME, "HTTP 429 from shortener");
        }
        if !page.is_success() {
            return ResolutionResult::error(NAME, format!("HTTP {} for {}", page.status, page.url));
        }

        let (mut css, sheet_urls) = {
            let document = Html::parse_document(&page.body);
            (inline_css(&document), stylesheet_urls(&document, &page.url))
        };
        for sheet in self.fetch_stylesheets(sheet_urls).await {
            css.push('\n');
            css.push_str(&sheet);
        }

        let document = Html::parse_document(&page.body);
        let (target, technique) = if let Some(target) = hidden_link(&document, &css, &page.url) {
            (target, "hidden_link")
        } else if let Some(target) = css_content(&document, &css) {
            (target, "css_content")
        } else if let Some(target) = pseudo_element(&document, &css, &page.url) {
            (target, "pseudo_element")
        } else if let Some(target) = html_comment(&document, &page.url) {
            (target, "html_comment")
        } else {
            return ResolutionResult::failure(NAME, "No hidden link found");
        };

        log::info!("[{}] {} found: {}", NAME, technique, target);
        ResolutionResult::success(NAME, target).with_metadata("technique", technique)
    }
}
