//! Settings and configuration module
//!
//! Provides the resolver configuration with:
//! - Sensible defaults (7 day cache window, proxies on, no overall deadline)
//! - Environment loading for proxy credentials
//! - JSON loading for front-ends that keep settings on disk

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::proxy::ProxyConfig;

const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolver-wide settings consumed by [`crate::ResolutionManagerBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Validity window of cached resolutions.
    #[serde(with = "duration_secs")]
    pub cache_max_age: Duration,
    /// Optional on-disk cache (redb file). `None` keeps the cache in memory.
    pub cache_path: Option<PathBuf>,
    pub proxy: ProxyConfig,
    /// Route strategy traffic through the proxy pool.
    pub use_proxies: bool,
    /// Budget for a whole resolve call; `None` only bounds each strategy.
    #[serde(with = "option_duration_secs")]
    pub deadline: Option<Duration>,
    /// Fixed user agent; a random browser profile is used otherwise.
    pub user_agent: Option<String>,
    /// Fallback timeout for fetches that do not carry their own.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            cache_path: None,
            proxy: ProxyConfig::default(),
            use_proxies: true,
            deadline: None,
            user_agent: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ResolverConfig {
    /// Defaults plus proxy credentials from `PROXY_LIST`, `WEBSHARE_API_KEY`
    /// and `PROXYSCRAPE_API`.
    pub fn from_env() -> Self {
        Self {
            proxy: ProxyConfig::from_env(),
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_max_age.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "cache_max_age",
                reason: "must be greater than zero".into(),
            });
        }
        if self.proxy.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "proxy.failure_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "request_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Serde helpers storing durations as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Same as [`duration_secs`] for optional values.
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
