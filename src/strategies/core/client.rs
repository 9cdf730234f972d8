//! Reqwest-backed [`PageFetcher`].
//!
//! Every [`ReqwestSession`] owns one cookie jar and one exit proxy, so the
//! steps of a multi-request flow share cookies and appear to come from the
//! same address. Requests sent straight through [`ReqwestPageFetcher`] get a
//! fresh single-use session and never see cookies from unrelated lookups.
//! Proxy health is reported back to the shared [`ProxyPool`] after every
//! request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tokio::sync::Mutex;

use super::http::{FetchError, FetchedPage, PageFetcher, PageRequest};
use crate::modules::proxy::ProxyPool;
use crate::strategies::user_agents::{BrowserProfile, custom_profile, random_profile};

const MAX_REDIRECTS: usize = 10;

/// Clients of one session, keyed by whether they follow redirects. Both
/// clients share the session's jar and proxy.
struct ClientPool {
    base_headers: HeaderMap,
    proxy: Option<String>,
    jar: Arc<Jar>,
    clients: Mutex<HashMap<bool, reqwest::Client>>,
}

impl ClientPool {
    fn new(base_headers: HeaderMap, proxy: Option<String>) -> Self {
        Self {
            base_headers,
            proxy,
            jar: Arc::new(Jar::default()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, follow_redirects: bool) -> Result<reqwest::Client, FetchError> {
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&follow_redirects) {
            return Ok(client.clone());
        }

        let policy = if follow_redirects {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        };
        let mut builder = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&self.jar))
            .redirect(policy)
            .default_headers(self.base_headers.clone());

        if let Some(endpoint) = &self.proxy {
            let proxy = reqwest::Proxy::all(endpoint.as_str())
                .map_err(|err| FetchError::Client(format!("invalid proxy {endpoint}: {err}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        guard.insert(follow_redirects, client.clone());
        Ok(client)
    }
}

/// Production transport: browser-like headers, cookie jar, optional proxies.
pub struct ReqwestPageFetcher {
    base_headers: HeaderMap,
    proxies: Option<Arc<ProxyPool>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for ReqwestPageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestPageFetcher")
            .field("proxied", &self.proxies.is_some())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl ReqwestPageFetcher {
    pub fn new(user_agent: Option<&str>, default_timeout: Duration) -> Result<Self, FetchError> {
        let profile = match user_agent {
            Some(agent) => custom_profile(agent),
            None => random_profile(),
        };
        log::debug!("[fetcher] using {} profile", profile.browser);
        Ok(Self {
            base_headers: profile_headers(&profile)?,
            proxies: None,
            default_timeout,
        })
    }

    /// Route requests through the pool. Without it every request connects directly.
    pub fn with_proxy_pool(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    /// Start a session with an empty cookie jar, pinned to one proxy drawn
    /// from the pool.
    pub async fn open_session(&self) -> ReqwestSession<'_> {
        let proxy = self.select_proxy().await;
        ReqwestSession {
            owner: self,
            pool: ClientPool::new(self.base_headers.clone(), proxy),
        }
    }

    async fn select_proxy(&self) -> Option<String> {
        let pool = self.proxies.as_ref()?;
        pool.get_endpoint().await.map(|endpoint| endpoint.url)
    }

    fn report(&self, proxy: Option<&str>, working: bool) {
        if let (Some(pool), Some(endpoint)) = (&self.proxies, proxy) {
            if working {
                pool.mark_working(endpoint);
            } else {
                pool.mark_failed(endpoint);
            }
        }
    }
}

/// One browsing session: a private cookie jar and a fixed exit proxy.
pub struct ReqwestSession<'a> {
    owner: &'a ReqwestPageFetcher,
    pool: ClientPool,
}

impl std::fmt::Debug for ReqwestSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestSession")
            .field("proxy", &self.pool.proxy)
            .finish()
    }
}

impl ReqwestSession<'_> {
    pub fn proxy(&self) -> Option<&str> {
        self.pool.proxy.as_deref()
    }
}

fn profile_headers(profile: &BrowserProfile) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in &profile.headers {
        map.insert(parse_name(name)?, parse_value(name, value)?);
    }
    Ok(map)
}

fn parse_name(name: &str) -> Result<HeaderName, FetchError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| FetchError::InvalidHeader(name.to_string()))
}

fn parse_value(name: &str, value: &str) -> Result<HeaderValue, FetchError> {
    HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(name.to_string()))
}

fn request_headers(pairs: &[(String, String)]) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(parse_name(name)?, parse_value(name, value)?);
    }
    Ok(map)
}

#[async_trait]
impl PageFetcher for ReqwestSession<'_> {
    async fn fetch(&self, request: PageRequest) -> Result<FetchedPage, FetchError> {
        let headers = request_headers(&request.headers)?;
        let proxy = self.pool.proxy.as_deref();
        let client = match self.pool.client(request.follow_redirects).await {
            Ok(client) => client,
            Err(err) => {
                self.owner.report(proxy, false);
                return Err(err);
            }
        };

        let mut builder = client
            .request(request.method.clone(), request.url.as_str())
            .headers(headers)
            .timeout(request.timeout.unwrap_or(self.owner.default_timeout));
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                self.owner.report(proxy, false);
                if err.is_timeout() {
                    return Err(FetchError::Timeout);
                }
                return Err(FetchError::Transport(err.to_string()));
            }
        };
        self.owner.report(proxy, true);

        let status = response.status().as_u16();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Decode(err.to_string())
            }
        })?;

        log::trace!(
            "[fetcher] {} {} -> {} via {}",
            request.method,
            request.url,
            status,
            proxy.unwrap_or("direct")
        );

        Ok(FetchedPage {
            status,
            url,
            headers,
            body,
        })
    }
}

#[async_trait]
impl PageFetcher for ReqwestPageFetcher {
    async fn fetch(&self, request: PageRequest) -> Result<FetchedPage, FetchError> {
        self.open_session().await.fetch(request).await
    }

    async fn session<'a>(&'a self) -> Result<Box<dyn PageFetcher + 'a>, FetchError> {
        Ok(Box::new(self.open_session().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> ReqwestPageFetcher {
        ReqwestPageFetcher::new(Some("linkbypass-test/1.0"), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn redirects_are_reported_when_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/go"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "https://dest.test/file"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/go", server.uri())).unwrap();
        let page = fetcher()
            .fetch(PageRequest::get(url).without_redirects())
            .await
            .unwrap();
        assert_eq!(page.status, 302);
        assert_eq!(page.location(), Some("https://dest.test/file"));
    }

    #[tokio::test]
    async fn posts_form_with_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/links/go"))
            .and(header("x-requested-with", "XMLHttpRequest"))
            .and(header("user-agent", "linkbypass-test/1.0"))
            .and(body_string_contains("_token=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"url":"https://dest.test"}"#))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/links/go", server.uri())).unwrap();
        let request = PageRequest::post_form(url, vec![("_token".into(), "abc".into())])
            .with_header("X-Requested-With", "XMLHttpRequest");
        let page = fetcher().fetch(request).await.unwrap();
        assert!(page.is_success());
        assert_eq!(page.json().unwrap()["url"], "https://dest.test");
    }

    #[tokio::test]
    async fn slow_response_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher()
            .fetch(PageRequest::get(url).with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[test]
    fn rejects_invalid_header_values() {
        let err = request_headers(&[("referer".into(), "bad\nvalue".into())]).unwrap_err();
        assert!(matches!(err, FetchError::InvalidHeader(name) if name == "referer"));
    }

    #[tokio::test]
    async fn session_carries_cookies_between_redirect_policies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "csrfToken=t0k; Path=/"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/links/go"))
            .and(header("cookie", "csrfToken=t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let session = fetcher.session().await.unwrap();
        let landing = Url::parse(&format!("{}/landing", server.uri())).unwrap();
        session
            .fetch(PageRequest::get(landing).without_redirects())
            .await
            .unwrap();
        let go = Url::parse(&format!("{}/links/go", server.uri())).unwrap();
        let reply = session.fetch(PageRequest::post_form(go, Vec::new())).await.unwrap();
        assert_eq!(reply.status, 200);
    }

    #[tokio::test]
    async fn cookies_do_not_leak_between_sessions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=abc; Path=/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/check"))
            .and(header_exists("cookie"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/check"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let landing = Url::parse(&format!("{}/landing", server.uri())).unwrap();
        let check = Url::parse(&format!("{}/check", server.uri())).unwrap();

        fetcher.fetch(PageRequest::get(landing.clone())).await.unwrap();
        let unrelated = fetcher.fetch(PageRequest::get(check.clone())).await.unwrap();
        assert_eq!(unrelated.status, 200);

        let first = fetcher.session().await.unwrap();
        first.fetch(PageRequest::get(landing)).await.unwrap();
        assert_eq!(first.fetch(PageRequest::get(check.clone())).await.unwrap().status, 403);
        let second = fetcher.session().await.unwrap();
        assert_eq!(second.fetch(PageRequest::get(check)).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn sessions_draw_their_proxy_from_the_pool() {
        let pool = Arc::new(ProxyPool::from_endpoints(
            crate::modules::proxy::ProxyConfig::default(),
            ["http://10.0.0.1:8080", "http://10.0.0.2:8080", "http://10.0.0.3:8080"],
        ));
        let fetcher = fetcher().with_proxy_pool(pool);
        for _ in 0..5 {
            let session = fetcher.open_session().await;
            let pinned = session.proxy().unwrap();
            assert!(pinned.starts_with("http://10.0.0."), "{pinned}");
        }
    }
}
