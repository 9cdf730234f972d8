//! Event system for the resolution pipeline.
//!
//! Provides hooks for metrics, logging, and custom reactions around strategy
//! attempts and cache activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;
use crate::strategies::ResolutionStatus;

#[derive(Debug, Clone)]
pub struct AttemptStartedEvent {
    pub url: Url,
    pub strategy: String,
    pub budget: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptFinishedEvent {
    pub url: Url,
    pub strategy: String,
    pub status: ResolutionStatus,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub url: Url,
    pub resolved_url: String,
    pub strategy_used: String,
    pub access_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResolutionFinishedEvent {
    pub url: Url,
    pub success: bool,
    pub strategy: String,
    pub attempts: usize,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ResolverEvent {
    AttemptStarted(AttemptStartedEvent),
    AttemptFinished(AttemptFinishedEvent),
    CacheHit(CacheHitEvent),
    ResolutionFinished(ResolutionFinishedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ResolverEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ResolverEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ResolverEvent) {
        match event {
            ResolverEvent::AttemptStarted(started) => {
                log::debug!(
                    "[{}] -> {} (budget {:.1}s)",
                    started.strategy,
                    started.url,
                    started.budget.as_secs_f64()
                );
            }
            ResolverEvent::AttemptFinished(finished) => match &finished.error {
                Some(error) => log::debug!(
                    "[{}] <- {} {} ({:.2}s): {}",
                    finished.strategy,
                    finished.url,
                    finished.status,
                    finished.elapsed.as_secs_f64(),
                    error
                ),
                None => log::debug!(
                    "[{}] <- {} {} ({:.2}s)",
                    finished.strategy,
                    finished.url,
                    finished.status,
                    finished.elapsed.as_secs_f64()
                ),
            },
            ResolverEvent::CacheHit(hit) => {
                log::info!(
                    "[cache] {} -> {} (via {}, hit #{})",
                    hit.url,
                    hit.resolved_url,
                    hit.strategy_used,
                    hit.access_count
                );
            }
            ResolverEvent::ResolutionFinished(done) if done.success => {
                log::info!(
                    "[resolver] {} resolved by {} after {} attempt(s) in {:.2}s",
                    done.url,
                    done.strategy,
                    done.attempts,
                    done.elapsed.as_secs_f64()
                );
            }
            ResolverEvent::ResolutionFinished(done) => {
                log::warn!(
                    "[resolver] {} unresolved after {} attempt(s) in {:.2}s",
                    done.url,
                    done.attempts,
                    done.elapsed.as_secs_f64()
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &ResolverEvent) {
        match event {
            ResolverEvent::AttemptFinished(finished) => {
                self.metrics
                    .record_attempt(&finished.strategy, finished.status, finished.elapsed);
            }
            ResolverEvent::CacheHit(_) => self.metrics.record_cache_hit(),
            ResolverEvent::ResolutionFinished(done) => self.metrics.record_resolution(done.success),
            ResolverEvent::AttemptStarted(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &ResolverEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn finished(strategy: &str, status: ResolutionStatus) -> ResolverEvent {
        ResolverEvent::AttemptFinished(AttemptFinishedEvent {
            url: Url::parse("https://short.test/a").unwrap(),
            strategy: strategy.into(),
            status,
            elapsed: Duration::from_millis(40),
            error: None,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(finished("html_forms", ResolutionStatus::Failed));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_counts_attempts() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&finished("css_hidden", ResolutionStatus::Success));
        handler.handle(&ResolverEvent::ResolutionFinished(ResolutionFinishedEvent {
            url: Url::parse("https://short.test/a").unwrap(),
            success: true,
            strategy: "css_hidden".into(),
            attempts: 1,
            elapsed: Duration::from_millis(40),
            timestamp: Utc::now(),
        }));

        let stats = metrics.snapshot();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.successful_resolutions, 1);
    }
}
