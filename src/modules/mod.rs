//! Cross-cutting services module
//!
//! Result caching, proxy rotation, resolution events and metrics shared by
//! the manager and the strategies.

pub mod cache;
pub mod events;
pub mod metrics;
pub mod proxy;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheStats, CacheStore, CacheStoreError, MemoryCacheStore, RedbCacheStore,
    ResultCache, hash_url, normalize_url,
};
pub use events::{
    AttemptFinishedEvent, AttemptStartedEvent, CacheHitEvent, EventDispatcher, EventHandler,
    LoggingHandler, MetricsHandler, ResolutionFinishedEvent, ResolverEvent,
};
pub use metrics::{MetricsCollector, ResolutionStats, StrategyStats};
pub use proxy::{
    ProxyConfig, ProxyEndpoint, ProxyHealthReport, ProxyPool, ProxySource, ProxySourceError,
};
