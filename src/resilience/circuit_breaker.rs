//! Circuit Breaker
//!
//! One breaker per backend target, shared by every session in the pool.

use crate::config::duration_ms;
use crate::error::{BackendError, BackendResult};
use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Fast-failing until the open timeout elapses
    Open,
    /// Admitting a single trial request
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit
    pub failure_threshold: u32,
    /// Trial successes needed to close it again
    pub success_threshold: u32,
    #[serde(rename = "open_timeout_ms", with = "duration_ms")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Permission granted by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Allowed,
    /// The half-open trial slot; its outcome decides the next state
    Trial,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            metrics: None,
        }
    }

    /// Record state transitions into `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Effective state; an open circuit whose timeout has elapsed reads as half-open
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner();
        match inner.state {
            CircuitState::Open if self.open_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner().consecutive_failures
    }

    fn open_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.config.open_timeout)
    }

    fn retry_after(&self, inner: &Inner) -> Duration {
        inner
            .opened_at
            .map(|at| self.config.open_timeout.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        inner.state = next;
        match next {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                inner.consecutive_successes = 0;
                tracing::warn!(from = %previous, failures = inner.consecutive_failures, "Circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                tracing::info!(from = %previous, "Circuit breaker half-open, admitting trial");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
                tracing::info!(from = %previous, "Circuit breaker closed");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(next);
        }
    }

    /// Ask permission to call the backend.
    ///
    /// An open circuit fast-fails with `CircuitOpen` until its timeout
    /// elapses; then exactly one trial is admitted at a time.
    pub fn try_acquire(&self) -> BackendResult<Admission> {
        let mut inner = self.inner();

        if inner.state == CircuitState::Open {
            if !self.open_elapsed(&inner) {
                return Err(BackendError::CircuitOpen {
                    retry_after_ms: u64::try_from(self.retry_after(&inner).as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Ok(Admission::Allowed),
            CircuitState::HalfOpen if inner.trial_in_flight => {
                Err(BackendError::CircuitOpen { retry_after_ms: 0 })
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::Open => Err(BackendError::CircuitOpen { retry_after_ms: 0 }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Late result from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// An admitted call ended without a verdict; frees the trial slot
    pub fn record_aborted(&self) {
        let mut inner = self.inner();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Record a failed call, counting it only if its category warrants
    pub fn record_error(&self, error: &BackendError) {
        if error.counts_toward_breaker() {
            self.record_failure();
        } else {
            self.record_aborted();
        }
    }

    /// Force the circuit closed
    pub fn reset(&self) {
        let mut inner = self.inner();
        inner.consecutive_failures = 0;
        self.transition(&mut inner, CircuitState::Closed);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
