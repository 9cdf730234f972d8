//! Metrics collection utilities.
//!
//! Global resolution counters are lock-free atomics; per-strategy statistics
//! keep a bounded latency window for average and p95 reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::strategies::ResolutionStatus;

const DEFAULT_WINDOW: usize = 128;

/// Per-strategy snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub name: String,
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(with = "crate::config::duration_secs")]
    pub total_time: Duration,
    #[serde(with = "crate::config::option_duration_secs")]
    pub average_latency: Option<Duration>,
    #[serde(with = "crate::config::option_duration_secs")]
    pub p95_latency: Option<Duration>,
    pub last_status: Option<ResolutionStatus>,
}

/// Point-in-time view of the resolver counters.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionStats {
    pub started_at: DateTime<Utc>,
    /// Strategy invocations across all resolutions.
    pub total_attempts: u64,
    pub successful_resolutions: u64,
    pub failed_resolutions: u64,
    pub cache_hits: u64,
    /// Percentage of finished resolutions that succeeded.
    pub success_rate: f64,
    pub strategies: Vec<StrategyStats>,
}

#[derive(Debug)]
struct StrategyAccumulator {
    invocations: u64,
    successes: u64,
    failures: u64,
    total_time: Duration,
    latencies: VecDeque<Duration>,
    max_window: usize,
    last_status: Option<ResolutionStatus>,
}

impl StrategyAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            invocations: 0,
            successes: 0,
            failures: 0,
            total_time: Duration::ZERO,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            last_status: None,
        }
    }

    fn record(&mut self, status: ResolutionStatus, elapsed: Duration) {
        self.invocations += 1;
        self.total_time += elapsed;
        self.last_status = Some(status);

        if status == ResolutionStatus::Success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(elapsed);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().copied().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }

    fn snapshot(&self, name: &str) -> StrategyStats {
        let (average_latency, p95_latency) = self.latency_stats();
        StrategyStats {
            name: name.to_string(),
            invocations: self.invocations,
            successes: self.successes,
            failures: self.failures,
            total_time: self.total_time,
            average_latency,
            p95_latency,
            last_status: self.last_status,
        }
    }
}

#[derive(Debug)]
struct MetricsState {
    started_at: DateTime<Utc>,
    total_attempts: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    max_window: usize,
    strategies: Mutex<HashMap<String, StrategyAccumulator>>,
}

/// Thread-safe collector shared by the manager and its event handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(MetricsState {
                started_at: Utc::now(),
                total_attempts: AtomicU64::new(0),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                max_window: window.max(16),
                strategies: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn record_attempt(&self, strategy: &str, status: ResolutionStatus, elapsed: Duration) {
        self.inner.total_attempts.fetch_add(1, Ordering::Relaxed);
        let mut strategies = self
            .inner
            .strategies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        strategies
            .entry(strategy.to_string())
            .or_insert_with(|| StrategyAccumulator::new(self.inner.max_window))
            .record(status, elapsed);
    }

    pub fn record_resolution(&self, success: bool) {
        let counter = if success {
            &self.inner.successful
        } else {
            &self.inner.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ResolutionStats {
        let successful = self.inner.successful.load(Ordering::Relaxed);
        let failed = self.inner.failed.load(Ordering::Relaxed);
        let finished = successful + failed;

        let mut strategies: Vec<StrategyStats> = self
            .inner
            .strategies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, acc)| acc.snapshot(name))
            .collect();
        strategies.sort_by(|a, b| a.name.cmp(&b.name));

        ResolutionStats {
            started_at: self.inner.started_at,
            total_attempts: self.inner.total_attempts.load(Ordering::Relaxed),
            successful_resolutions: successful,
            failed_resolutions: failed,
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            success_rate: if finished == 0 {
                0.0
            } else {
                successful as f64 / finished as f64 * 100.0
            },
            strategies,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
