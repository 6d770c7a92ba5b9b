//! Fallback Strategy
//!
//! Chooses how a request is executed from live pressure signals:
//!
//! - **Level 0** (`Async`): persistent session, events streamed to the caller
//! - **Level 1** (`SyncReuse`): persistent session, caller waits for the full exchange
//! - **Level 2** (`OneShot`): a disposable process per request
//!
//! The choice is a pure function of [`FallbackInputs`]; [`FallbackStrategy`]
//! only remembers the last level so changes can be logged and counted.

use crate::health::HealthStatus;
use crate::metrics::Metrics;
use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Execution level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLevel {
    Async,
    SyncReuse,
    OneShot,
}

impl ExecutionLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionLevel::Async => "async",
            ExecutionLevel::SyncReuse => "sync_reuse",
            ExecutionLevel::OneShot => "one_shot",
        }
    }

    /// Whether this level goes through the session pool
    #[must_use]
    pub fn uses_pool(self) -> bool {
        self != ExecutionLevel::OneShot
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: u8) -> Self {
        match index {
            0 => ExecutionLevel::Async,
            1 => ExecutionLevel::SyncReuse,
            _ => ExecutionLevel::OneShot,
        }
    }
}

impl fmt::Display for ExecutionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downgrade thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackThresholds {
    /// Resident memory at or above which requests go one-shot
    pub memory_limit_bytes: u64,
    /// Queue depth, as a fraction of queue capacity, that forces synchronous execution
    pub queue_depth_ratio: f64,
    /// Recent error rate that forces synchronous execution
    pub error_rate: f64,
    /// Recent error rate that forces one-shot execution
    pub severe_error_rate: f64,
    /// Outcomes needed before the error rate is trusted
    pub min_samples: usize,
}

impl Default for FallbackThresholds {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            queue_depth_ratio: 0.8,
            error_rate: 0.3,
            severe_error_rate: 0.6,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub thresholds: FallbackThresholds,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: FallbackThresholds::default(),
        }
    }
}

/// Signals the level is selected from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallbackInputs {
    pub memory_bytes: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub error_rate: f64,
    /// Outcomes the error rate was computed from
    pub samples: usize,
    pub health: HealthStatus,
    pub breaker: CircuitState,
}

impl Default for FallbackInputs {
    fn default() -> Self {
        Self {
            memory_bytes: 0,
            queue_depth: 0,
            queue_capacity: 1,
            error_rate: 0.0,
            samples: 0,
            health: HealthStatus::Healthy,
            breaker: CircuitState::Closed,
        }
    }
}

/// Select the execution level for the next request
#[must_use]
pub fn select_level(config: &FallbackConfig, inputs: &FallbackInputs) -> ExecutionLevel {
    decide(config, inputs).0
}

fn decide(config: &FallbackConfig, inputs: &FallbackInputs) -> (ExecutionLevel, &'static str) {
    if !config.enabled {
        return (ExecutionLevel::Async, "fallback disabled");
    }
    let t = &config.thresholds;
    let error_rate = if inputs.samples >= t.min_samples {
        inputs.error_rate
    } else {
        0.0
    };

    if inputs.memory_bytes >= t.memory_limit_bytes {
        return (ExecutionLevel::OneShot, "memory above limit");
    }
    if inputs.health == HealthStatus::Unhealthy {
        return (ExecutionLevel::OneShot, "health unhealthy");
    }
    if inputs.breaker == CircuitState::Open {
        return (ExecutionLevel::OneShot, "circuit open");
    }
    if error_rate >= t.severe_error_rate {
        return (ExecutionLevel::OneShot, "severe error rate");
    }

    let queue_limit = t.queue_depth_ratio * inputs.queue_capacity.max(1) as f64;
    if inputs.queue_depth as f64 >= queue_limit {
        return (ExecutionLevel::SyncReuse, "queue depth above limit");
    }
    if error_rate >= t.error_rate {
        return (ExecutionLevel::SyncReuse, "elevated error rate");
    }
    if inputs.health == HealthStatus::Degraded {
        return (ExecutionLevel::SyncReuse, "health degraded");
    }

    (ExecutionLevel::Async, "nominal")
}

/// Tracks the selected level across requests
#[derive(Debug)]
pub struct FallbackStrategy {
    config: FallbackConfig,
    current: AtomicU8,
    metrics: Option<Arc<Metrics>>,
}

impl FallbackStrategy {
    #[must_use]
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            current: AtomicU8::new(ExecutionLevel::Async as u8),
            metrics: None,
        }
    }

    /// Count selections in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Level chosen by the most recent evaluation
    #[must_use]
    pub fn current(&self) -> ExecutionLevel {
        ExecutionLevel::from_index(self.current.load(Ordering::Acquire))
    }

    /// Re-evaluate for a new request
    pub fn evaluate(&self, inputs: &FallbackInputs) -> ExecutionLevel {
        let (level, reason) = decide(&self.config, inputs);
        let previous = ExecutionLevel::from_index(self.current.swap(level as u8, Ordering::AcqRel));

        if level > previous {
            tracing::warn!(from = %previous, to = %level, reason, "Execution level downgraded");
        } else if level < previous {
            tracing::info!(from = %previous, to = %level, reason, "Execution level upgraded");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_level(level);
        }
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FallbackConfig {
        FallbackConfig::default()
    }

    #[test]
    fn test_nominal_is_async() {
        assert_eq!(
            select_level(&config(), &FallbackInputs::default()),
            ExecutionLevel::Async
        );
    }

    #[test]
    fn test_memory_pressure_goes_one_shot() {
        let inputs = FallbackInputs {
            memory_bytes: 3 * 1024 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &inputs), ExecutionLevel::OneShot);
    }

    #[test]
    fn test_queue_and_error_rate_go_sync() {
        let queued = FallbackInputs {
            queue_depth: 80,
            queue_capacity: 100,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &queued), ExecutionLevel::SyncReuse);

        let below = FallbackInputs {
            queue_depth: 79,
            queue_capacity: 100,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &below), ExecutionLevel::Async);

        let erroring = FallbackInputs {
            error_rate: 0.4,
            samples: 20,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &erroring), ExecutionLevel::SyncReuse);

        let failing = FallbackInputs {
            error_rate: 0.9,
            samples: 20,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &failing), ExecutionLevel::OneShot);

        // Too few outcomes to judge
        let early = FallbackInputs {
            error_rate: 1.0,
            samples: 2,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &early), ExecutionLevel::Async);
    }

    #[test]
    fn test_health_and_breaker() {
        let degraded = FallbackInputs {
            health: HealthStatus::Degraded,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &degraded), ExecutionLevel::SyncReuse);

        let unhealthy = FallbackInputs {
            health: HealthStatus::Unhealthy,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &unhealthy), ExecutionLevel::OneShot);

        let open = FallbackInputs {
            breaker: CircuitState::Open,
            ..Default::default()
        };
        assert_eq!(select_level(&config(), &open), ExecutionLevel::OneShot);
    }

    #[test]
    fn test_disabled_always_async() {
        let disabled = FallbackConfig {
            enabled: false,
            ..Default::default()
        };
        let inputs = FallbackInputs {
            memory_bytes: u64::MAX,
            health: HealthStatus::Unhealthy,
            ..Default::default()
        };
        assert_eq!(select_level(&disabled, &inputs), ExecutionLevel::Async);
    }

    #[test]
    fn test_strategy_downgrades_and_recovers() {
        let metrics = Arc::new(Metrics::new());
        let strategy = FallbackStrategy::new(config()).with_metrics(Arc::clone(&metrics));
        assert_eq!(strategy.current(), ExecutionLevel::Async);

        let pressure = FallbackInputs {
            memory_bytes: u64::MAX,
            ..Default::default()
        };
        assert_eq!(strategy.evaluate(&pressure), ExecutionLevel::OneShot);
        assert_eq!(strategy.current(), ExecutionLevel::OneShot);

        assert_eq!(strategy.evaluate(&FallbackInputs::default()), ExecutionLevel::Async);
        assert_eq!(strategy.current(), ExecutionLevel::Async);

        let counts = metrics.snapshot().level_selections;
        assert_eq!((counts.async_reuse, counts.one_shot), (1, 1));
    }

    #[test]
    fn test_level_names_and_pool_use() {
        assert_eq!(ExecutionLevel::SyncReuse.to_string(), "sync_reuse");
        assert!(ExecutionLevel::Async < ExecutionLevel::OneShot);
        assert!(ExecutionLevel::SyncReuse.uses_pool());
        assert!(!ExecutionLevel::OneShot.uses_pool());
    }
}
