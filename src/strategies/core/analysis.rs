//! Candidate URL helpers shared by the extraction strategies.
//!
//! Every technique produces raw strings (attribute values, script literals,
//! decoded payloads). These helpers turn them into validated absolute URLs
//! relative to the page they were found on.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::Selector;
use url::Url;

const NON_NAVIGABLE_PREFIXES: &[&str] = &["javascript:", "#", "mailto:", "tel:", "data:", "about:"];

/// Absolute http(s) URL with a non-empty host.
pub fn is_valid_candidate(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some_and(|host| !host.is_empty())
}

/// Resolve a raw candidate against the page's final URL.
///
/// Returns `None` for empty values, fragment/script pseudo links, and
/// anything that does not end up as a valid absolute http(s) URL.
pub fn resolve_candidate(base: &Url, raw: &str) -> Option<Url> {
    let decoded = html_escape::decode_html_entities(raw.trim());
    let candidate = decoded.trim().trim_matches(|c| c == '"' || c == '\'');
    if candidate.is_empty() {
        return None;
    }

    let lowered = candidate.to_ascii_lowercase();
    if NON_NAVIGABLE_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return None;
    }

    let joined = base.join(candidate).ok()?;
    is_valid_candidate(&joined).then_some(joined)
}

/// All absolute http(s) links appearing anywhere in `text`.
pub fn extract_links(text: &str) -> Vec<String> {
    LINK_RE
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(|c| matches!(c, ')' | ']' | ',' | ';' | '.' | '\\'))
                .to_string()
        })
        .collect()
}

/// First link in `text` that parses as a valid candidate.
pub fn first_link(text: &str) -> Option<Url> {
    extract_links(text)
        .into_iter()
        .filter_map(|link| Url::parse(&link).ok())
        .find(is_valid_candidate)
}

/// Decode a base64 payload (standard or URL-safe, padded or not) into UTF-8.
pub fn decode_base64(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(trimmed).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Decode a base64 payload and return the first URL hidden inside it.
pub fn decode_base64_link(raw: &str) -> Option<Url> {
    let decoded = decode_base64(raw)?;
    if let Ok(url) = Url::parse(decoded.trim())
        && is_valid_candidate(&url)
    {
        return Some(url);
    }
    first_link(&decoded)
}

/// First of `keys` in a JSON object whose string value is a valid link.
pub fn json_link(value: &serde_json::Value, keys: &[&str]) -> Option<Url> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(serde_json::Value::as_str))
        .filter_map(|raw| Url::parse(raw.trim()).ok())
        .find(is_valid_candidate)
}

/// `decodeURIComponent`-style percent decoding; invalid UTF-8 is replaced.
pub fn percent_decode(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}

/// Build origin header value from URL (`scheme://host[:port]`).
pub fn origin_from_url(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

/// Case-insensitive host comparison.
pub fn same_host(a: &Url, b: &Url) -> bool {
    match (a.host_str(), b.host_str()) {
        (Some(left), Some(right)) => left.eq_ignore_ascii_case(right),
        _ => false,
    }
}

/// Compile a case-insensitive, dot-matches-newline pattern.
///
/// Only used with literal patterns, so a failure is a programming error.
pub(crate) fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid extraction regex `{}`: {}", pattern, err))
}

/// Parse a literal CSS selector.
pub(crate) fn build_selector(css: &str) -> Selector {
    Selector::parse(css)
        .unwrap_or_else(|err| panic!("invalid extraction selector `{}`: {}", css, err))
}

static LINK_RE: Lazy<Regex> = Lazy::new(|| build_regex(r#"https?://[^\s<>"']+"#));

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://short.test/go/abc").unwrap()
    }

    #[test]
    fn resolves_relative_candidates_against_final_url() {
        let url = resolve_candidate(&base(), "/download?id=7").unwrap();
        assert_eq!(url.as_str(), "https://short.test/download?id=7");
    }

    #[test]
    fn skips_pseudo_links() {
        for raw in ["javascript:void(0)", "#top", "mailto:a@b.c", "tel:123", "  "] {
            assert!(resolve_candidate(&base(), raw).is_none(), "{raw}");
        }
    }

    #[test]
    fn decodes_entities_before_joining() {
        let url = resolve_candidate(&base(), "https://dest.test/f?a=1&amp;b=2").unwrap();
        assert_eq!(url.query(), Some("a=1&b=2"));
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(resolve_candidate(&base(), "ftp://files.test/x").is_none());
    }

    #[test]
    fn extracts_links_from_free_text() {
        let links = extract_links(r#"see <a href="https://a.test/x">here</a> or (https://b.test/y)."#);
        assert_eq!(links, vec!["https://a.test/x", "https://b.test/y"]);
    }

    #[test]
    fn decodes_base64_links() {
        // "https://real-destination.test/file"
        let encoded = "aHR0cHM6Ly9yZWFsLWRlc3RpbmF0aW9uLnRlc3QvZmlsZQ==";
        let url = decode_base64_link(encoded).unwrap();
        assert_eq!(url.as_str(), "https://real-destination.test/file");
        assert!(decode_base64_link("not base64 at all!").is_none());
    }

    #[test]
    fn percent_decodes_components() {
        assert_eq!(percent_decode("https%3A%2F%2Fa.test%2Fx"), "https://a.test/x");
    }
}
