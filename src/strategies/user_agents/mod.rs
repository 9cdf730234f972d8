//! Browser header profiles.
//!
//! Responsibilities:
//! - Provide a small set of realistic desktop browser header sets.
//! - Pick one at random per HTTP client so sessions look consistent.
//! - Allow a custom user agent while keeping the remaining headers plausible.

use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashMap;

const CHROME_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";
const FIREFOX_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

struct ProfileTemplate {
    browser: &'static str,
    user_agent: &'static str,
    accept: &'static str,
    client_hints: Option<(&'static str, &'static str)>,
}

static TEMPLATES: &[ProfileTemplate] = &[
    ProfileTemplate {
        browser: "chrome",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept: CHROME_ACCEPT,
        client_hints: Some((
            r#""Chromium";v="124", "Google Chrome";v="124", "Not-A.Brand";v="99""#,
            r#""Windows""#,
        )),
    },
    ProfileTemplate {
        browser: "chrome",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        accept: CHROME_ACCEPT,
        client_hints: Some((
            r#""Chromium";v="123", "Google Chrome";v="123", "Not-A.Brand";v="99""#,
            r#""Windows""#,
        )),
    },
    ProfileTemplate {
        browser: "chrome",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept: CHROME_ACCEPT,
        client_hints: Some((
            r#""Chromium";v="124", "Google Chrome";v="124", "Not-A.Brand";v="99""#,
            r#""macOS""#,
        )),
    },
    ProfileTemplate {
        browser: "chrome",
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept: CHROME_ACCEPT,
        client_hints: Some((
            r#""Chromium";v="124", "Google Chrome";v="124", "Not-A.Brand";v="99""#,
            r#""Linux""#,
        )),
    },
    ProfileTemplate {
        browser: "firefox",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        accept: FIREFOX_ACCEPT,
        client_hints: None,
    },
];

/// Final selected profile.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub browser: String,
    pub headers: HashMap<String, String>,
}

impl BrowserProfile {
    pub fn user_agent(&self) -> &str {
        self.headers
            .get("User-Agent")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Random built-in profile.
pub fn random_profile() -> BrowserProfile {
    let mut rng = thread_rng();
    TEMPLATES
        .choose(&mut rng)
        .map(from_template)
        .unwrap_or_else(|| custom_profile(DEFAULT_USER_AGENT))
}

/// Profile for a caller-provided user agent.
///
/// When the agent matches one of the built-in browsers the matching header
/// set is reused; otherwise generic headers are attached.
pub fn custom_profile(user_agent: &str) -> BrowserProfile {
    if let Some(template) = TEMPLATES
        .iter()
        .find(|template| template.user_agent == user_agent)
    {
        return from_template(template);
    }

    let mut headers = base_headers(CHROME_ACCEPT);
    headers.insert("User-Agent".into(), user_agent.to_string());
    BrowserProfile {
        browser: "custom".into(),
        headers,
    }
}

fn from_template(template: &ProfileTemplate) -> BrowserProfile {
    let mut headers = base_headers(template.accept);
    headers.insert("User-Agent".into(), template.user_agent.to_string());
    if let Some((brands, platform)) = template.client_hints {
        headers.insert("sec-ch-ua".into(), brands.to_string());
        headers.insert("sec-ch-ua-mobile".into(), "?0".into());
        headers.insert("sec-ch-ua-platform".into(), platform.to_string());
    }
    BrowserProfile {
        browser: template.browser.to_string(),
        headers,
    }
}

fn base_headers(accept: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("Accept".into(), accept.to_string());
    map.insert("Accept-Language".into(), "en-US,en;q=0.9".into());
    map.insert("Accept-Encoding".into(), "gzip, br".into());
    map.insert("Upgrade-Insecure-Requests".into(), "1".into());
    map.insert("Sec-Fetch-Dest".into(), "document".into());
    map.insert("Sec-Fetch-Mode".into(), "navigate".into());
    map.insert("Sec-Fetch-Site".into(), "none".into());
    map.insert("Sec-Fetch-User".into(), "?1".into());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_profile_has_user_agent() {
        let profile = random_profile();
        assert!(profile.user_agent().starts_with("Mozilla/5.0"));
        assert!(profile.headers.contains_key("Accept-Language"));
    }

    #[test]
    fn custom_agent_keeps_generic_headers() {
        let profile = custom_profile("linkbypass-test/1.0");
        assert_eq!(profile.user_agent(), "linkbypass-test/1.0");
        assert_eq!(profile.browser, "custom");
        assert!(profile.headers.contains_key("Accept"));
    }
}
