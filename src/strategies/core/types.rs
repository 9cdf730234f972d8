//! Core data structures shared by strategies, the registry, and the manager.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use url::Url;

/// Outcome category of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Success,
    Failed,
    Error,
    Unsupported,
    Timeout,
    RateLimited,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Success => "success",
            ResolutionStatus::Failed => "failed",
            ResolutionStatus::Error => "error",
            ResolutionStatus::Unsupported => "unsupported",
            ResolutionStatus::Timeout => "timeout",
            ResolutionStatus::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry for one strategy invocation inside a single resolve call.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub strategy_name: String,
    pub success: bool,
    pub status: ResolutionStatus,
    #[serde(serialize_with = "serialize_secs")]
    pub execution_time: Duration,
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn from_result(result: &ResolutionResult) -> Self {
        Self {
            strategy_name: result.strategy_name.clone(),
            success: result.success,
            status: result.status,
            execution_time: result.execution_time,
            error: result.error_message.clone(),
        }
    }

    /// Compact JSON view stored in result metadata.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "strategy": self.strategy_name,
            "success": self.success,
            "status": self.status.as_str(),
            "time": self.execution_time.as_secs_f64(),
        })
    }
}

/// Outcome of a strategy or of a full resolution.
///
/// Results are only built through the named constructors, so `success` and
/// `resolved_url` always agree with `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    success: bool,
    resolved_url: Option<Url>,
    strategy_name: String,
    status: ResolutionStatus,
    error_message: Option<String>,
    metadata: HashMap<String, Value>,
    #[serde(serialize_with = "serialize_secs")]
    execution_time: Duration,
    attempts: Vec<AttemptRecord>,
}

impl ResolutionResult {
    pub fn success(strategy: impl Into<String>, resolved_url: Url) -> Self {
        Self {
            success: true,
            resolved_url: Some(resolved_url),
            strategy_name: strategy.into(),
            status: ResolutionStatus::Success,
            error_message: None,
            metadata: HashMap::new(),
            execution_time: Duration::ZERO,
            attempts: Vec::new(),
        }
    }

    pub fn failure(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::unsuccessful(ResolutionStatus::Failed, strategy, message)
    }

    pub fn error(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::unsuccessful(ResolutionStatus::Error, strategy, message)
    }

    pub fn unsupported(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::unsuccessful(ResolutionStatus::Unsupported, strategy, message)
    }

    pub fn timeout(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::unsuccessful(ResolutionStatus::Timeout, strategy, message)
    }

    pub fn rate_limited(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::unsuccessful(ResolutionStatus::RateLimited, strategy, message)
    }

    fn unsuccessful(
        status: ResolutionStatus,
        strategy: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            resolved_url: None,
            strategy_name: strategy.into(),
            status,
            error_message: Some(message.into()),
            metadata: HashMap::new(),
            execution_time: Duration::ZERO,
            attempts: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time = elapsed;
        self
    }

    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn set_execution_time(&mut self, elapsed: Duration) {
        self.execution_time = elapsed;
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn resolved_url(&self) -> Option<&Url> {
        self.resolved_url.as_ref()
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn status(&self) -> ResolutionStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// JSON representation handed to front-ends.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Static description of a strategy: identity, ordering, limits and scope.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub priority: u32,
    #[serde(serialize_with = "serialize_secs")]
    pub timeout: Duration,
    /// Lowercased host fragments; empty means every domain.
    pub supported_domains: Vec<String>,
}

impl StrategyDescriptor {
    pub fn new(name: impl Into<String>, priority: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            priority,
            timeout,
            supported_domains: Vec::new(),
        }
    }

    pub fn with_supported_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_domains = domains
            .into_iter()
            .map(|domain| domain.into().to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the URL's host falls inside the allow-list.
    pub fn supports(&self, url: &Url) -> bool {
        if self.supported_domains.is_empty() {
            return true;
        }

        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.supported_domains
            .iter()
            .any(|domain| host.contains(domain.as_str()))
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_carries_url_and_status() {
        let url = Url::parse("https://real-destination.test/file").unwrap();
        let result = ResolutionResult::success("html_forms", url.clone());
        assert!(result.is_success());
        assert_eq!(result.status(), ResolutionStatus::Success);
        assert_eq!(result.resolved_url(), Some(&url));
        assert!(result.error_message().is_none());
    }

    #[test]
    fn failures_never_carry_a_url() {
        for result in [
            ResolutionResult::failure("a", "x"),
            ResolutionResult::error("a", "x"),
            ResolutionResult::unsupported("a", "x"),
            ResolutionResult::timeout("a", "x"),
            ResolutionResult::rate_limited("a", "x"),
        ] {
            assert!(!result.is_success());
            assert!(result.resolved_url().is_none());
            assert_ne!(result.status(), ResolutionStatus::Success);
        }
    }

    #[test]
    fn descriptor_matches_host_fragments_case_insensitively() {
        let descriptor = StrategyDescriptor::new("shortener", 10, Duration::from_secs(60))
            .with_supported_domains(["GPLinks", "bit.ly"]);

        assert!(descriptor.supports(&Url::parse("https://gplinks.co/abc").unwrap()));
        assert!(descriptor.supports(&Url::parse("https://BIT.LY/xyz").unwrap()));
        assert!(!descriptor.supports(&Url::parse("https://example.com/gplinks").unwrap()));
    }

    #[test]
    fn empty_allow_list_supports_everything() {
        let descriptor = StrategyDescriptor::new("html_forms", 1, Duration::from_secs(15));
        assert!(descriptor.supports(&Url::parse("https://anything.test/").unwrap()));
    }

    #[test]
    fn json_view_uses_seconds() {
        let result = ResolutionResult::failure("css_hidden", "no hidden links")
            .with_execution_time(Duration::from_millis(1500));
        let json = result.to_json();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["execution_time"], 1.5);
    }
}
