//! # linkbypass-rs
//!
//! Resolve shortened and protected links to the destination they hide.
//!
//! A [`ResolutionManager`] checks a result cache, then walks an ordered set of
//! strategies (form replay, hidden CSS links, inline scripts, anti-bot
//! interstitials, an optional headless renderer and a table of known
//! shorteners) until one of them produces the real URL.
//!
//! ## Features
//!
//! - Priority-ordered strategies with per-strategy timeouts and panic isolation
//! - Result cache keyed by normalised URL, optionally persisted with redb
//! - Rotating proxy pool with failure tracking and periodic refresh
//! - Sandboxed script execution through Boa
//! - Resolution events and per-strategy metrics
//!
//! ## Example
//!
//! ```no_run
//! use linkbypass_rs::ResolutionManager;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ResolutionManager::builder().build()?;
//!     let result = manager.resolve_url("https://gplinks.co/AbC12").await?;
//!     match result.resolved_url() {
//!         Some(url) => println!("{} via {}", url, result.strategy_name()),
//!         None => println!("{}", result.error_message().unwrap_or("failed")),
//!     }
//!     Ok(())
//! }
//! ```

mod resolver;

pub mod config;
pub mod external_deps;
pub mod modules;
pub mod strategies;

pub use crate::resolver::{
    ResolutionManager,
    ResolutionManagerBuilder,
    ResolutionRequest,
    ResolverError,
    ResolverResult,
};

pub use crate::config::{ConfigError, ResolverConfig};

pub use crate::strategies::{
    AttemptRecord,
    BrowserAutoStrategy,
    CloudflareStrategy,
    CssHiddenStrategy,
    FetchError,
    FetchedPage,
    HtmlFormsStrategy,
    JavascriptStrategy,
    PageFetcher,
    PageRequest,
    RegistryError,
    ReqwestPageFetcher,
    ReqwestSession,
    ResolutionResult,
    ResolutionStatus,
    ShortenerStrategy,
    SiteHandler,
    SiteRule,
    Strategy,
    StrategyDescriptor,
    StrategyRegistry,
    StrategyRegistryBuilder,
    default_strategies,
};

pub use crate::external_deps::interpreters::{
    BoaJavascriptInterpreter,
    InterpreterError,
    InterpreterResult,
    JavascriptInterpreter,
};

pub use crate::external_deps::renderers::{PageRenderer, RenderError, RenderedPage};

pub use crate::modules::{
    AttemptFinishedEvent,
    AttemptStartedEvent,
    CacheEntry,
    CacheHitEvent,
    CacheStats,
    CacheStore,
    CacheStoreError,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MemoryCacheStore,
    MetricsCollector,
    MetricsHandler,
    ProxyConfig,
    ProxyEndpoint,
    ProxyHealthReport,
    ProxyPool,
    ProxySource,
    ProxySourceError,
    RedbCacheStore,
    ResolutionFinishedEvent,
    ResolutionStats,
    ResolverEvent,
    ResultCache,
    StrategyStats,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
