//! Proxy providers feeding the pool.
//!
//! Each source returns a flat list of connection strings. The pool asks them
//! in precedence order and keeps the first non-empty answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::ProxyConfig;

const WEBSHARE_ENDPOINT: &str = "https://proxy.webshare.io/api/v2/proxy/list/";
const PROXYSCRAPE_ENDPOINT: &str = "https://api.proxyscrape.com/v3/free-proxy-list/get";
const PUBLIC_LIST_ENDPOINT: &str = "https://api.proxyscrape.com/v2/";

#[derive(Debug, Error)]
pub enum ProxySourceError {
    #[error("proxy provider request failed: {0}")]
    Http(String),
    #[error("proxy provider returned status {0}")]
    Status(u16),
    #[error("unexpected proxy provider payload: {0}")]
    Payload(String),
}

impl From<reqwest::Error> for ProxySourceError {
    fn from(err: reqwest::Error) -> Self {
        ProxySourceError::Http(err.to_string())
    }
}

#[async_trait]
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_endpoints(&self) -> Result<Vec<String>, ProxySourceError>;
}

/// Build the source chain described by the configuration.
pub(super) fn from_config(config: &ProxyConfig) -> Vec<Arc<dyn ProxySource>> {
    let mut sources: Vec<Arc<dyn ProxySource>> = Vec::new();

    if !config.static_list.is_empty() {
        sources.push(Arc::new(StaticListSource::new(config.static_list.clone())));
    }
    if let Some(key) = &config.webshare_api_key {
        sources.push(Arc::new(WebshareSource::new(key.clone(), config.source_timeout)));
    }
    if let Some(key) = &config.proxyscrape_api_key {
        sources.push(Arc::new(ProxyScrapeSource::new(key.clone(), config.source_timeout)));
    }
    if config.public_fallback {
        sources.push(Arc::new(PublicListSource::new(config.source_timeout)));
    }

    sources
}

/// Explicit list, typically from `PROXY_LIST`.
#[derive(Debug, Clone)]
pub struct StaticListSource {
    endpoints: Vec<String>,
}

impl StaticListSource {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl ProxySource for StaticListSource {
    fn name(&self) -> &str {
        "static_list"
    }

    async fn fetch_endpoints(&self) -> Result<Vec<String>, ProxySourceError> {
        Ok(self.endpoints.clone())
    }
}

#[derive(Debug, Deserialize)]
struct WebshareResponse {
    #[serde(default)]
    results: Vec<WebshareProxy>,
}

#[derive(Debug, Deserialize)]
struct WebshareProxy {
    username: String,
    password: String,
    proxy_address: String,
    port: u16,
}

/// Paid rotating provider authenticated with an API token.
#[derive(Debug, Clone)]
pub struct WebshareSource {
    api_key: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebshareSource {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self {
            api_key,
            endpoint: WEBSHARE_ENDPOINT.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ProxySource for WebshareSource {
    fn name(&self) -> &str {
        "webshare"
    }

    async fn fetch_endpoints(&self) -> Result<Vec<String>, ProxySourceError> {
        let response = self
            .client
            .get(&self.endpoint)
            .header(http::header::AUTHORIZATION, format!("Token {}", self.api_key))
            .query(&[("mode", "direct"), ("page", "1"), ("page_size", "100")])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProxySourceError::Status(response.status().as_u16()));
        }

        let payload: WebshareResponse = response
            .json()
            .await
            .map_err(|err| ProxySourceError::Payload(err.to_string()))?;

        Ok(payload
            .results
            .into_iter()
            .map(|proxy| {
                format!(
                    "http://{}:{}@{}:{}",
                    proxy.username, proxy.password, proxy.proxy_address, proxy.port
                )
            })
            .collect())
    }
}

/// Keyed free-tier provider returning one `host:port` per line.
#[derive(Debug, Clone)]
pub struct ProxyScrapeSource {
    api_key: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl ProxyScrapeSource {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self {
            api_key,
            endpoint: PROXYSCRAPE_ENDPOINT.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ProxySource for ProxyScrapeSource {
    fn name(&self) -> &str {
        "proxyscrape"
    }

    async fn fetch_endpoints(&self) -> Result<Vec<String>, ProxySourceError> {
        let query = [
            ("request", "displayproxies"),
            ("protocol", "http"),
            ("timeout", "5000"),
            ("country", "all"),
            ("ssl", "all"),
            ("anonymity", "elite"),
            ("apikey", self.api_key.as_str()),
        ];
        fetch_line_list(&self.client, &self.endpoint, &query, self.timeout).await
    }
}

/// Unauthenticated public listing; last resort.
#[derive(Debug, Clone)]
pub struct PublicListSource {
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl PublicListSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            endpoint: PUBLIC_LIST_ENDPOINT.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ProxySource for PublicListSource {
    fn name(&self) -> &str {
        "public_list"
    }

    async fn fetch_endpoints(&self) -> Result<Vec<String>, ProxySourceError> {
        log::warn!("[proxy] falling back to free public proxies (less reliable)");
        let query = [
            ("request", "getproxies"),
            ("protocol", "http"),
            ("timeout", "5000"),
            ("country", "all"),
            ("ssl", "all"),
            ("anonymity", "elite"),
        ];
        fetch_line_list(&self.client, &self.endpoint, &query, self.timeout).await
    }
}

async fn fetch_line_list(
    client: &reqwest::Client,
    endpoint: &str,
    query: &[(&str, &str)],
    timeout: Duration,
) -> Result<Vec<String>, ProxySourceError> {
    let response = client
        .get(endpoint)
        .query(query)
        .timeout(timeout)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ProxySourceError::Status(response.status().as_u16()));
    }

    let body = response.text().await?;
    Ok(parse_line_list(&body))
}

fn parse_line_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.contains("://") {
                line.to_string()
            } else {
                format!("http://{line}")
            }
        })
        .collect()
}
