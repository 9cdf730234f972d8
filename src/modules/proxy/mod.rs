//! Proxy rotation and health tracking utilities.
//!
//! Keeps a pool of egress endpoints loaded from the first configured source
//! that yields anything, counts failures per endpoint, retires endpoints that
//! cross the failure threshold, and refreshes the whole pool periodically.

mod sources;

pub use sources::{
    ProxyScrapeSource, ProxySource, ProxySourceError, PublicListSource, StaticListSource,
    WebshareSource,
};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::duration_secs;

pub const PROXY_LIST_ENV: &str = "PROXY_LIST";
pub const WEBSHARE_API_KEY_ENV: &str = "WEBSHARE_API_KEY";
pub const PROXYSCRAPE_API_ENV: &str = "PROXYSCRAPE_API";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    #[serde(with = "duration_secs")]
    pub source_timeout: Duration,
    /// Explicit endpoints; highest precedence.
    pub static_list: Vec<String>,
    pub webshare_api_key: Option<String>,
    pub proxyscrape_api_key: Option<String>,
    /// Fall back to the public, unauthenticated listing.
    pub public_fallback: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            refresh_interval: Duration::from_secs(3600),
            source_timeout: Duration::from_secs(10),
            static_list: Vec::new(),
            webshare_api_key: None,
            proxyscrape_api_key: None,
            public_fallback: true,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let static_list = std::env::var(PROXY_LIST_ENV)
            .map(|raw| parse_proxy_list(&raw))
            .unwrap_or_default();

        Self {
            static_list,
            webshare_api_key: non_empty_env(WEBSHARE_API_KEY_ENV),
            proxyscrape_api_key: non_empty_env(PROXYSCRAPE_API_ENV),
            ..Self::default()
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Split a comma separated list, dropping blanks.
pub fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Snapshot of one endpoint's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub url: String,
    pub failure_count: u32,
    pub is_dead: bool,
}

impl ProxyEndpoint {
    pub fn as_str(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHealthReport {
    pub total: usize,
    pub alive: usize,
    pub dead: usize,
}

impl fmt::Display for ProxyHealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proxies: {} alive / {} dead / {} total",
            self.alive, self.dead, self.total
        )
    }
}

#[derive(Debug, Default)]
struct PoolState {
    endpoints: Vec<String>,
    failures: HashMap<String, u32>,
    dead: HashSet<String>,
    loaded_at: Option<Instant>,
}

impl PoolState {
    fn replace(&mut self, endpoints: Vec<String>) {
        let mut seen = HashSet::new();
        self.endpoints = endpoints
            .into_iter()
            .filter(|endpoint| seen.insert(endpoint.clone()))
            .collect();
        self.failures.clear();
        self.dead.clear();
        self.loaded_at = Some(Instant::now());
    }

    fn is_stale(&self, refresh_interval: Duration) -> bool {
        self.loaded_at
            .is_none_or(|loaded| loaded.elapsed() >= refresh_interval)
    }

    fn alive(&self) -> Vec<&String> {
        self.endpoints
            .iter()
            .filter(|endpoint| !self.dead.contains(*endpoint))
            .collect()
    }

    fn endpoint(&self, url: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            url: url.to_string(),
            failure_count: self.failures.get(url).copied().unwrap_or(0),
            is_dead: self.dead.contains(url),
        }
    }
}

/// Shared pool of egress endpoints.
///
/// Safe to share behind an `Arc`; the state lock is never held across a
/// network call and concurrent reloads are serialised by a separate gate.
pub struct ProxyPool {
    config: ProxyConfig,
    sources: Vec<Arc<dyn ProxySource>>,
    state: Mutex<PoolState>,
    reload_gate: tokio::sync::Mutex<()>,
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("config", &self.config)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProxyPool {
    /// Pool whose sources follow the configured precedence.
    pub fn new(config: ProxyConfig) -> Self {
        let sources = sources::from_config(&config);
        Self::with_sources(config, sources)
    }

    /// A zero failure threshold is replaced with the default.
    pub fn with_sources(mut config: ProxyConfig, sources: Vec<Arc<dyn ProxySource>>) -> Self {
        if config.failure_threshold == 0 {
            let fallback = ProxyConfig::default().failure_threshold;
            log::warn!("[proxy] failure_threshold of 0 is invalid, using {}", fallback);
            config.failure_threshold = fallback;
        }
        Self {
            config,
            sources,
            state: Mutex::new(PoolState::default()),
            reload_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Pool backed by a fixed list of endpoints.
    pub fn from_endpoints<I, S>(config: ProxyConfig, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list = endpoints.into_iter().map(Into::into).collect();
        Self::with_sources(config, vec![Arc::new(StaticListSource::new(list))])
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick a random healthy endpoint. `None` means connect directly.
    pub async fn get_endpoint(&self) -> Option<ProxyEndpoint> {
        self.refresh_if_stale().await;

        if let Some(endpoint) = self.pick_alive() {
            return Some(endpoint);
        }

        // Every loaded endpoint is dead: one forced reload before giving up.
        let exhausted = {
            let state = self.lock_state();
            !state.endpoints.is_empty()
        };
        if exhausted {
            log::warn!("[proxy] all endpoints dead, reloading pool");
            self.reload().await;
            return self.pick_alive();
        }

        None
    }

    fn pick_alive(&self) -> Option<ProxyEndpoint> {
        let state = self.lock_state();
        let alive = state.alive();
        let mut rng = rand::thread_rng();
        alive
            .choose(&mut rng)
            .map(|endpoint| state.endpoint(endpoint))
    }

    async fn refresh_if_stale(&self) {
        let stale = self.lock_state().is_stale(self.config.refresh_interval);
        if !stale {
            return;
        }

        let _gate = self.reload_gate.lock().await;
        let still_stale = self.lock_state().is_stale(self.config.refresh_interval);
        if still_stale {
            self.load_from_sources().await;
        }
    }

    /// Replace the pool with a fresh load and clear all failure state.
    /// Returns the number of endpoints now in the pool.
    pub async fn reload(&self) -> usize {
        let _gate = self.reload_gate.lock().await;
        self.load_from_sources().await
    }

    async fn load_from_sources(&self) -> usize {
        let mut loaded = Vec::new();
        for source in &self.sources {
            match source.fetch_endpoints().await {
                Ok(endpoints) if !endpoints.is_empty() => {
                    log::info!(
                        "[proxy] loaded {} endpoints from {}",
                        endpoints.len(),
                        source.name()
                    );
                    loaded = endpoints;
                    break;
                }
                Ok(_) => log::debug!("[proxy] source {} returned no endpoints", source.name()),
                Err(err) => log::warn!("[proxy] source {} failed: {}", source.name(), err),
            }
        }

        if loaded.is_empty() && !self.sources.is_empty() {
            log::warn!("[proxy] no proxy source produced endpoints, connecting directly");
        }

        let mut state = self.lock_state();
        state.replace(loaded);
        state.endpoints.len()
    }

    /// Count a failure; the endpoint is retired once the threshold is reached.
    pub fn mark_failed(&self, endpoint: &str) {
        let mut state = self.lock_state();
        if !state.endpoints.iter().any(|known| known == endpoint) {
            return;
        }

        let count = {
            let counter = state.failures.entry(endpoint.to_string()).or_insert(0);
            *counter = counter.saturating_add(1);
            *counter
        };

        if count >= self.config.failure_threshold && state.dead.insert(endpoint.to_string()) {
            log::warn!("[proxy] retiring {} after {} failures", endpoint, count);
        }
    }

    /// Clear the failure counter and revive the endpoint.
    pub fn mark_working(&self, endpoint: &str) {
        let mut state = self.lock_state();
        state.failures.remove(endpoint);
        if state.dead.remove(endpoint) {
            log::info!("[proxy] revived {}", endpoint);
        }
    }

    pub fn status(&self) -> ProxyHealthReport {
        let state = self.lock_state();
        let dead = state
            .endpoints
            .iter()
            .filter(|endpoint| state.dead.contains(*endpoint))
            .count();
        ProxyHealthReport {
            total: state.endpoints.len(),
            alive: state.endpoints.len() - dead,
            dead,
        }
    }

    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        let state = self.lock_state();
        state
            .endpoints
            .iter()
            .map(|endpoint| state.endpoint(endpoint))
            .collect()
    }
}
