//! Page fetching contract shared by every strategy.
//!
//! Strategies never talk to `reqwest` directly; they describe what they need
//! as a [`PageRequest`] and receive a [`FetchedPage`]. This keeps the proxy
//! bookkeeping in one place and lets tests substitute a stub transport.

use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use http::header::{HeaderMap, LOCATION};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::types::ResolutionResult;

/// Outgoing request description.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
    pub follow_redirects: bool,
    pub timeout: Option<Duration>,
}

impl PageRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            form: None,
            follow_redirects: true,
            timeout: None,
        }
    }

    pub fn post_form(url: Url, fields: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            form: Some(fields),
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_referer(self, referer: impl Into<String>) -> Self {
        self.with_header("referer", referer)
    }

    pub fn without_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response as seen by strategies. `url` is the final URL after redirects.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: String,
}

impl FetchedPage {
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, FetchError> {
        serde_json::from_str(&self.body).map_err(|err| FetchError::Decode(err.to_string()))
    }
}

/// Transport used by strategies.
///
/// Multi-step flows (fetch a form, then post it) go through [`session`],
/// whose requests share cookies and a network identity like a browser tab.
///
/// [`session`]: PageFetcher::session
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: PageRequest) -> Result<FetchedPage, FetchError>;

    async fn get(&self, url: &Url, timeout: Duration) -> Result<FetchedPage, FetchError> {
        self.fetch(PageRequest::get(url.clone()).with_timeout(timeout))
            .await
    }

    /// Open a handle whose requests share one cookie jar and one exit proxy.
    /// Stateless transports can keep the default, which forwards to `self`.
    async fn session<'a>(&'a self) -> Result<Box<dyn PageFetcher + 'a>, FetchError> {
        Ok(Box::new(Borrowed(self)))
    }
}

struct Borrowed<'a, F: ?Sized>(&'a F);

#[async_trait]
impl<F: PageFetcher + ?Sized> PageFetcher for Borrowed<'_, F> {
    async fn fetch(&self, request: PageRequest) -> Result<FetchedPage, FetchError> {
        self.0.fetch(request).await
    }

    async fn session<'b>(&'b self) -> Result<Box<dyn PageFetcher + 'b>, FetchError> {
        Ok(Box::new(Borrowed(self.0)))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("failed to convert header '{0}'")]
    InvalidHeader(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("http client initialisation failed: {0}")]
    Client(String),
}

impl FetchError {
    /// Turn a transport failure into a strategy result, keeping timeouts distinct.
    pub fn into_result(self, strategy: &str) -> ResolutionResult {
        let message = self.to_string();
        match self {
            FetchError::Timeout => ResolutionResult::timeout(strategy, message),
            _ => ResolutionResult::error(strategy, message),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport shared by strategy unit tests.

    use super::*;
    use std::sync::Mutex;

    pub struct StubFetcher {
        responses: Mutex<Vec<Result<FetchedPage, FetchError>>>,
        pub requests: Mutex<Vec<PageRequest>>,
    }

    impl StubFetcher {
        pub fn new(responses: Vec<Result<FetchedPage, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn pages(pages: Vec<FetchedPage>) -> Self {
            Self::new(pages.into_iter().map(Ok).collect())
        }

        pub fn recorded(&self) -> Vec<PageRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, request: PageRequest) -> Result<FetchedPage, FetchError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(FetchError::Transport("no more stub responses".into())))
        }
    }

    pub fn page(status: u16, url: &str, body: &str) -> FetchedPage {
        FetchedPage {
            status,
            url: Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: body.to_string(),
        }
    }

    pub fn redirect(url: &str, location: &str) -> FetchedPage {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, location.parse().unwrap());
        FetchedPage {
            status: 302,
            url: Url::parse(url).unwrap(),
            headers,
            body: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_timeout_status() {
        let result = FetchError::Timeout.into_result("html_forms");
        assert_eq!(result.status(), crate::strategies::core::types::ResolutionStatus::Timeout);
    }

    #[test]
    fn post_form_keeps_redirect_default() {
        let request = PageRequest::post_form(
            Url::parse("https://example.com/links/go").unwrap(),
            vec![("a".into(), "b".into())],
        );
        assert_eq!(request.method, Method::POST);
        assert!(request.follow_redirects);
        assert_eq!(request.form.as_ref().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn default_session_forwards_to_the_fetcher() {
        let fetcher = testing::StubFetcher::pages(vec![testing::page(200, "https://a.test/", "ok")]);
        let session = fetcher.session().await.unwrap();
        let page = session
            .fetch(PageRequest::get(Url::parse("https://a.test/").unwrap()))
            .await
            .unwrap();
        assert_eq!(page.body, "ok");
        assert_eq!(fetcher.recorded().len(), 1);
    }
}
