//! Resolution strategies.
//!
//! Each strategy owns one family of techniques for turning a protected or
//! shortened link into its destination. Strategies never fail toward the
//! caller: every outcome is a [`ResolutionResult`].

pub mod browser_auto;
pub mod cloudflare;
pub mod core;
pub mod css_hidden;
pub mod html_forms;
pub mod javascript;
pub mod registry;
pub mod shortener;
pub mod user_agents;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use url::Url;

pub use browser_auto::BrowserAutoStrategy;
pub use cloudflare::CloudflareStrategy;
pub use self::core::{
    AttemptRecord, FetchError, FetchedPage, PageFetcher, PageRequest, ReqwestPageFetcher,
    ReqwestSession, ResolutionResult, ResolutionStatus, StrategyDescriptor, is_valid_candidate,
};
pub use css_hidden::CssHiddenStrategy;
pub use html_forms::HtmlFormsStrategy;
pub use javascript::JavascriptStrategy;
pub use registry::{RegistryError, StrategyRegistry, StrategyRegistryBuilder};
pub use shortener::{ShortenerStrategy, SiteHandler, SiteRule};

use crate::external_deps::{JavascriptInterpreter, PageRenderer};

#[async_trait]
pub trait Strategy: Send + Sync {
    fn descriptor(&self) -> &StrategyDescriptor;

    /// Run the techniques. Only called for URLs the descriptor supports.
    async fn execute(&self, url: &Url) -> ResolutionResult;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Allow-list gate around [`Strategy::execute`].
    async fn resolve(&self, url: &Url) -> ResolutionResult {
        if !self.descriptor().supports(url) {
            return ResolutionResult::unsupported(
                self.name(),
                format!(
                    "domain {} not supported",
                    url.host_str().unwrap_or_default()
                ),
            );
        }

        let started = Instant::now();
        let mut result = self.execute(url).await;
        if result.execution_time().is_zero() {
            result.set_execution_time(started.elapsed());
        }
        result
    }
}

/// The built-in strategy set in priority order.
pub fn default_strategies(
    fetcher: Arc<dyn PageFetcher>,
    interpreter: Arc<dyn JavascriptInterpreter>,
    renderer: Option<Arc<dyn PageRenderer>>,
) -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(HtmlFormsStrategy::new(fetcher.clone())),
        Arc::new(CssHiddenStrategy::new(fetcher.clone())),
        Arc::new(JavascriptStrategy::new(fetcher.clone(), interpreter)),
        Arc::new(CloudflareStrategy::new(fetcher.clone())),
        Arc::new(BrowserAutoStrategy::new(renderer)),
        Arc::new(ShortenerStrategy::new(fetcher)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct OnlyExample(StrategyDescriptor);

    #[async_trait]
    impl Strategy for OnlyExample {
        fn descriptor(&self) -> &StrategyDescriptor {
            &self.0
        }

        async fn execute(&self, url: &Url) -> ResolutionResult {
            ResolutionResult::success(self.name(), url.join("/dest").unwrap())
        }
    }

    fn strategy() -> OnlyExample {
        OnlyExample(
            StrategyDescriptor::new("only_example", 1, Duration::from_secs(1))
                .with_supported_domains(["Example.test"]),
        )
    }

    #[tokio::test]
    async fn unsupported_hosts_skip_execution() {
        let url = Url::parse("https://other.test/a").unwrap();
        let result = strategy().resolve(&url).await;
        assert_eq!(result.status(), ResolutionStatus::Unsupported);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn supported_hosts_match_case_insensitively() {
        let url = Url::parse("https://cdn.EXAMPLE.test/a").unwrap();
        let result = strategy().resolve(&url).await;
        assert!(result.is_success());
        assert_eq!(result.resolved_url().unwrap().path(), "/dest");
    }
}
