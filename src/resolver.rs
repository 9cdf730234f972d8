//! Resolution orchestration.
//!
//! Wires the strategy registry, result cache, proxy pool, events and metrics
//! together behind [`ResolutionManager::resolve`]. Strategies run one at a
//! time per call, each in its own task so a panic or an overrun only costs
//! that attempt.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, ResolverConfig};
use crate::external_deps::{BoaJavascriptInterpreter, JavascriptInterpreter, PageRenderer};
use crate::modules::cache::{
	CacheEntry, CacheStats, CacheStore, CacheStoreError, RedbCacheStore, ResultCache, hash_url,
};
use crate::modules::events::{
	AttemptFinishedEvent, AttemptStartedEvent, CacheHitEvent, EventDispatcher, EventHandler,
	LoggingHandler, MetricsHandler, ResolutionFinishedEvent, ResolverEvent,
};
use crate::modules::metrics::{MetricsCollector, ResolutionStats};
use crate::modules::proxy::{ProxyHealthReport, ProxyPool};
use crate::strategies::{
	AttemptRecord, FetchError, PageFetcher, RegistryError, ReqwestPageFetcher, ResolutionResult,
	Strategy, StrategyDescriptor, StrategyRegistry, default_strategies, is_valid_candidate,
};

const CACHE_STRATEGY: &str = "cache";
const AGGREGATE_STRATEGY: &str = "all";

/// Result alias used across the orchestration layer.
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Construction and input errors. Strategy failures are results, not errors.
#[derive(Debug, Error)]
pub enum ResolverError {
	#[error("invalid url '{url}': {reason}")]
	InvalidUrl { url: String, reason: String },
	#[error("strategy registry error: {0}")]
	Registry(#[from] RegistryError),
	#[error("http client initialisation failed: {0}")]
	Client(#[from] FetchError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("cache store error: {0}")]
	Store(#[from] CacheStoreError),
}

/// One resolve call.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
	pub url: Url,
	pub skip_cache: bool,
	pub preferred_strategy: Option<String>,
	/// Overrides the manager-wide deadline for this call.
	pub deadline: Option<Duration>,
}

impl ResolutionRequest {
	pub fn new(url: Url) -> Self {
		Self {
			url,
			skip_cache: false,
			preferred_strategy: None,
			deadline: None,
		}
	}

	/// Parse and validate an absolute http(s) URL.
	pub fn parse(raw: &str) -> ResolverResult<Self> {
		let trimmed = raw.trim();
		let url = Url::parse(trimmed).map_err(|err| ResolverError::InvalidUrl {
			url: trimmed.to_string(),
			reason: err.to_string(),
		})?;
		if !is_valid_candidate(&url) {
			return Err(ResolverError::InvalidUrl {
				url: trimmed.to_string(),
				reason: "expected an absolute http(s) url".into(),
			});
		}
		Ok(Self::new(url))
	}

	pub fn with_skip_cache(mut self, skip: bool) -> Self {
		self.skip_cache = skip;
		self
	}

	pub fn with_preferred_strategy(mut self, name: impl Into<String>) -> Self {
		self.preferred_strategy = Some(name.into());
		self
	}

	pub fn with_deadline(mut self, deadline: Duration) -> Self {
		self.deadline = Some(deadline);
		self
	}
}

/// Fluent builder for [`ResolutionManager`].
pub struct ResolutionManagerBuilder {
	config: ResolverConfig,
	strategies: Option<Vec<Arc<dyn Strategy>>>,
	fetcher: Option<Arc<dyn PageFetcher>>,
	interpreter: Option<Arc<dyn JavascriptInterpreter>>,
	renderer: Option<Arc<dyn PageRenderer>>,
	proxy_pool: Option<Arc<ProxyPool>>,
	cache_store: Option<Arc<dyn CacheStore>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl ResolutionManagerBuilder {
	pub fn new() -> Self {
		Self {
			config: ResolverConfig::default(),
			strategies: None,
			fetcher: None,
			interpreter: None,
			renderer: None,
			proxy_pool: None,
			cache_store: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: ResolverConfig) -> Self {
		self.config = config;
		self
	}

	/// Register a strategy. Once any strategy is registered the built-in set
	/// is no longer added.
	pub fn with_strategy<S: Strategy + 'static>(self, strategy: S) -> Self {
		self.with_strategy_arc(Arc::new(strategy))
	}

	pub fn with_strategy_arc(mut self, strategy: Arc<dyn Strategy>) -> Self {
		self.strategies.get_or_insert_with(Vec::new).push(strategy);
		self
	}

	/// Start from an empty registry instead of the built-in strategies.
	pub fn without_default_strategies(mut self) -> Self {
		self.strategies.get_or_insert_with(Vec::new);
		self
	}

	/// Transport for the built-in strategies.
	pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
		self.fetcher = Some(fetcher);
		self
	}

	pub fn with_interpreter(mut self, interpreter: Arc<dyn JavascriptInterpreter>) -> Self {
		self.interpreter = Some(interpreter);
		self
	}

	pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
		self.renderer = Some(renderer);
		self
	}

	pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
		self.proxy_pool = Some(pool);
		self
	}

	pub fn disable_proxies(mut self) -> Self {
		self.config.use_proxies = false;
		self
	}

	pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
		self.cache_store = Some(store);
		self
	}

	pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.config.cache_path = Some(path.into());
		self
	}

	pub fn with_cache_max_age(mut self, max_age: Duration) -> Self {
		self.config.cache_max_age = max_age;
		self
	}

	pub fn with_deadline(mut self, deadline: Duration) -> Self {
		self.config.deadline = Some(deadline);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> ResolverResult<ResolutionManager> {
		self.config.validate()?;
		let config = self.config;

		let proxies = if config.use_proxies {
			Some(
				self.proxy_pool
					.unwrap_or_else(|| Arc::new(ProxyPool::new(config.proxy.clone()))),
			)
		} else {
			None
		};

		let strategies = match self.strategies {
			Some(strategies) => strategies,
			None => {
				let fetcher = match self.fetcher {
					Some(fetcher) => fetcher,
					None => {
						let mut fetcher = ReqwestPageFetcher::new(
							config.user_agent.as_deref(),
							config.request_timeout,
						)?;
						if let Some(pool) = &proxies {
							fetcher = fetcher.with_proxy_pool(Arc::clone(pool));
						}
						Arc::new(fetcher)
					}
				};
				let interpreter = self
					.interpreter
					.unwrap_or_else(|| Arc::new(BoaJavascriptInterpreter::new()));
				default_strategies(fetcher, interpreter, self.renderer)
			}
		};

		let registry = strategies
			.into_iter()
			.fold(StrategyRegistry::builder(), |builder, strategy| {
				builder.register_arc(strategy)
			})
			.build()?;

		let store: Option<Arc<dyn CacheStore>> = match (self.cache_store, &config.cache_path) {
			(Some(store), _) => Some(store),
			(None, Some(path)) => Some(Arc::new(RedbCacheStore::open(path)?)),
			(None, None) => None,
		};
		let mut cache = ResultCache::new(config.cache_max_age);
		if let Some(store) = store {
			cache = cache.with_store(store);
		}

		let metrics = MetricsCollector::new();
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		events.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
		for handler in self.handlers {
			events.register_handler(handler);
		}

		log::debug!(
			"[resolver] built with strategies {:?}, proxies {}",
			registry.names(),
			if proxies.is_some() { "on" } else { "off" }
		);

		Ok(ResolutionManager {
			registry,
			cache,
			proxies,
			metrics,
			events: Arc::new(events),
			deadline: config.deadline,
		})
	}
}

impl Default for ResolutionManagerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Cache-first, priority-ordered resolution over a strategy registry.
pub struct ResolutionManager {
	registry: StrategyRegistry,
	cache: ResultCache,
	proxies: Option<Arc<ProxyPool>>,
	metrics: MetricsCollector,
	events: Arc<EventDispatcher>,
	deadline: Option<Duration>,
}

impl std::fmt::Debug for ResolutionManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResolutionManager")
			.field("registry", &self.registry)
			.field("cache", &self.cache)
			.field("proxied", &self.proxies.is_some())
			.field("deadline", &self.deadline)
			.finish()
	}
}

impl ResolutionManager {
	pub fn builder() -> ResolutionManagerBuilder {
		ResolutionManagerBuilder::new()
	}

	/// Manager with the built-in strategies and the given configuration.
	pub fn with_config(config: ResolverConfig) -> ResolverResult<Self> {
		ResolutionManagerBuilder::new().with_config(config).build()
	}

	pub fn registry(&self) -> &StrategyRegistry {
		&self.registry
	}

	pub fn cache(&self) -> &ResultCache {
		&self.cache
	}

	/// Parse `raw` and resolve it with default options.
	pub async fn resolve_url(&self, raw: &str) -> ResolverResult<ResolutionResult> {
		let request = ResolutionRequest::parse(raw)?;
		Ok(self.resolve(request).await)
	}

	pub async fn resolve(&self, request: ResolutionRequest) -> ResolutionResult {
		let started = Instant::now();
		let url = request.url;
		let url_hash = hash_url(url.as_str());
		log::info!("[resolver] resolving {}", url);

		if !request.skip_cache
			&& let Some(hit) = self.cached(&url, &url_hash, started).await
		{
			return hit;
		}

		let order = self.ordered_strategies(request.preferred_strategy.as_deref());
		if order.is_empty() {
			let result = ResolutionResult::failure(
				AGGREGATE_STRATEGY,
				"No resolution strategies registered",
			)
			.with_execution_time(started.elapsed());
			self.finish(&url, &result, 0, started);
			return result;
		}

		let budget = request.deadline.or(self.deadline);
		let deadline = budget.map(|budget| started + budget);
		let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(order.len());

		for strategy in order {
			let mut timeout = strategy.descriptor().timeout;
			if let Some(deadline) = deadline {
				let remaining = deadline.saturating_duration_since(Instant::now());
				if remaining.is_zero() {
					break;
				}
				timeout = timeout.min(remaining);
			}

			let mut result = self.run_strategy(strategy, &url, timeout).await;
			attempts.push(AttemptRecord::from_result(&result));

			if let Some(resolved) = result.resolved_url().cloned() {
				let entry = CacheEntry::new(&url, &resolved, result.strategy_name());
				self.cache.set(entry).await;

				let trail: Vec<Value> = attempts.iter().map(AttemptRecord::summary).collect();
				result.insert_metadata("attempts", trail);
				result.insert_metadata("total_time", started.elapsed().as_secs_f64());
				let result = result.with_attempts(attempts);

				log::info!(
					"[resolver] {} resolved by {}: {}",
					url,
					result.strategy_name(),
					resolved
				);
				self.finish(&url, &result, result.attempts().len(), started);
				return result;
			}
			log::debug!(
				"[resolver] {} failed: {}",
				result.strategy_name(),
				result.error_message().unwrap_or("Failed")
			);
		}

		let deadline_hit = deadline.is_some_and(|deadline| Instant::now() >= deadline);
		let mut message = String::from("All resolution strategies failed:");
		for attempt in &attempts {
			message.push_str(&format!(
				"\n• {}: {}",
				attempt.strategy_name,
				attempt.error.as_deref().unwrap_or("Failed")
			));
		}

		let result = match budget {
			Some(budget) if deadline_hit => {
				message.push_str(&format!(
					"\nOverall deadline of {:.1}s exceeded",
					budget.as_secs_f64()
				));
				ResolutionResult::timeout(AGGREGATE_STRATEGY, message)
			}
			_ => ResolutionResult::failure(AGGREGATE_STRATEGY, message),
		};
		let attempt_count = attempts.len();
		let result = result
			.with_attempts(attempts)
			.with_execution_time(started.elapsed());

		log::warn!("[resolver] all strategies failed for {}", url);
		self.finish(&url, &result, attempt_count, started);
		result
	}

	/// Run one named strategy, bypassing the cache.
	pub async fn test_strategy(&self, url: &Url, name: &str) -> ResolutionResult {
		let Some(strategy) = self.registry.get(name) else {
			return ResolutionResult::failure(name, format!("Strategy '{}' is not registered", name));
		};
		let timeout = strategy.descriptor().timeout;
		let result = self.run_strategy(strategy, url, timeout).await;
		let attempt = AttemptRecord::from_result(&result);
		result.with_attempts(vec![attempt])
	}

	/// Registered strategies in priority order.
	pub fn strategy_info(&self) -> Vec<StrategyDescriptor> {
		self.registry.describe()
	}

	pub async fn invalidate(&self, url: &Url) -> bool {
		self.cache.invalidate(&hash_url(url.as_str())).await
	}

	pub async fn clear_cache(&self) {
		self.cache.clear().await;
	}

	pub fn stats(&self) -> ResolutionStats {
		self.metrics.snapshot()
	}

	pub fn cache_stats(&self) -> CacheStats {
		self.cache.stats()
	}

	/// `None` when the manager connects directly.
	pub fn proxy_status(&self) -> Option<ProxyHealthReport> {
		self.proxies.as_ref().map(|pool| pool.status())
	}

	async fn cached(&self, url: &Url, url_hash: &str, started: Instant) -> Option<ResolutionResult> {
		let entry = self.cache.get(url_hash).await?;
		let Ok(resolved) = Url::parse(&entry.resolved_url) else {
			log::warn!("[cache] dropping unparsable entry {}", url_hash);
			self.cache.invalidate(url_hash).await;
			return None;
		};
		let entry = self.cache.record_hit(url_hash).await.unwrap_or(entry);

		self.events.dispatch(ResolverEvent::CacheHit(CacheHitEvent {
			url: url.clone(),
			resolved_url: entry.resolved_url.clone(),
			strategy_used: entry.strategy_used.clone(),
			access_count: entry.access_count,
			timestamp: Utc::now(),
		}));

		Some(
			ResolutionResult::success(CACHE_STRATEGY, resolved)
				.with_metadata("cached", true)
				.with_metadata("cached_strategy", entry.strategy_used)
				.with_metadata("access_count", entry.access_count)
				.with_execution_time(started.elapsed()),
		)
	}

	/// Preferred strategy first when registered, then the rest by priority.
	fn ordered_strategies(&self, preferred: Option<&str>) -> Vec<Arc<dyn Strategy>> {
		let mut order = self.registry.all_by_priority();
		if let Some(name) = preferred {
			match order.iter().position(|strategy| strategy.name() == name) {
				Some(index) => {
					let strategy = order.remove(index);
					order.insert(0, strategy);
				}
				None => log::debug!("[resolver] ignoring unknown preferred strategy {}", name),
			}
		}
		order
	}

	async fn run_strategy(
		&self,
		strategy: Arc<dyn Strategy>,
		url: &Url,
		timeout: Duration,
	) -> ResolutionResult {
		let name = strategy.name().to_string();
		self.events
			.dispatch(ResolverEvent::AttemptStarted(AttemptStartedEvent {
				url: url.clone(),
				strategy: name.clone(),
				budget: timeout,
				timestamp: Utc::now(),
			}));

		let attempt_started = Instant::now();
		let task_url = url.clone();
		let mut handle = tokio::spawn(async move { strategy.resolve(&task_url).await });

		let mut result = match tokio::time::timeout(timeout, &mut handle).await {
			Ok(Ok(result)) => result,
			Ok(Err(err)) if err.is_panic() => ResolutionResult::error(
				name.as_str(),
				format!("strategy panicked: {}", panic_message(err.into_panic())),
			),
			Ok(Err(err)) => ResolutionResult::error(name.as_str(), err.to_string()),
			Err(_) => {
				handle.abort();
				ResolutionResult::timeout(
					name.as_str(),
					format!("Timed out after {:.1}s", timeout.as_secs_f64()),
				)
			}
		};
		if result.execution_time().is_zero() {
			result.set_execution_time(attempt_started.elapsed());
		}

		self.events
			.dispatch(ResolverEvent::AttemptFinished(AttemptFinishedEvent {
				url: url.clone(),
				strategy: name,
				status: result.status(),
				elapsed: result.execution_time(),
				error: result.error_message().map(str::to_string),
				timestamp: Utc::now(),
			}));
		result
	}

	fn finish(&self, url: &Url, result: &ResolutionResult, attempts: usize, started: Instant) {
		self.events
			.dispatch(ResolverEvent::ResolutionFinished(ResolutionFinishedEvent {
				url: url.clone(),
				success: result.is_success(),
				strategy: result.strategy_name().to_string(),
				attempts,
				elapsed: started.elapsed(),
				timestamp: Utc::now(),
			}));
	}
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic".to_string()
	}
}
