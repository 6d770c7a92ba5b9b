//! Metrics
//!
//! Counters, gauges and a task-duration histogram for the session pool,
//! exported as named points or as a serializable snapshot. Also keeps the
//! window of recent outcomes the fallback strategy reads its error rate from.

use crate::error::ErrorCategory;
use crate::fallback::ExecutionLevel;
use crate::resilience::CircuitState;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Upper bounds (ms) of the task-duration histogram buckets
pub const DURATION_BUCKETS_MS: [u64; 8] = [100, 500, 1_000, 5_000, 10_000, 30_000, 60_000, 300_000];

const DEFAULT_OUTCOME_WINDOW: usize = 50;
const RECENT_DURATIONS: usize = 256;

/// Kind of an exported metric point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// A single exported measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub name: String,
    pub kind: MetricKind,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl MetricPoint {
    fn new(name: &str, kind: MetricKind, value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            labels: Vec::new(),
            value,
        }
    }

    fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorCounts {
    pub transient: u64,
    pub session: u64,
    pub config: u64,
    pub platform: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransitionCounts {
    pub closed: u64,
    pub open: u64,
    pub half_open: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LevelCounts {
    pub async_reuse: u64,
    pub sync_reuse: u64,
    pub one_shot: u64,
}

/// Task duration distribution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub sum_ms: u64,
    /// Cumulative counts per bucket of [`DURATION_BUCKETS_MS`], plus `+Inf`
    pub buckets: Vec<u64>,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: u64,
    pub sessions_created: u64,
    pub queue_depth: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub error_rate: f64,
    pub errors: ErrorCounts,
    pub breaker_transitions: TransitionCounts,
    pub level_selections: LevelCounts,
    pub task_duration: DurationStats,
}

#[derive(Debug, Default)]
struct Histogram {
    buckets: [u64; DURATION_BUCKETS_MS.len() + 1],
    count: u64,
    sum_ms: u64,
    recent: VecDeque<u64>,
}

impl Histogram {
    fn observe(&mut self, ms: u64) {
        let index = DURATION_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[index] += 1;
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(ms);
        if self.recent.len() >= RECENT_DURATIONS {
            self.recent.pop_front();
        }
        self.recent.push_back(ms);
    }

    fn stats(&self) -> DurationStats {
        let mut cumulative = 0;
        let buckets = self
            .buckets
            .iter()
            .map(|n| {
                cumulative += n;
                cumulative
            })
            .collect();

        let mut sorted: Vec<u64> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        let percentile = |p: f64| -> u64 {
            if sorted.is_empty() {
                return 0;
            }
            // Nearest-rank
            let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
            sorted[rank - 1]
        };

        DurationStats {
            count: self.count,
            sum_ms: self.sum_ms,
            buckets,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            max_ms: sorted.last().copied().unwrap_or(0),
        }
    }
}

/// Metrics registry shared by the supervisor's components
#[derive(Debug)]
pub struct Metrics {
    active_sessions: AtomicU64,
    sessions_created: AtomicU64,
    queue_depth: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    errors: [AtomicU64; 4],
    transitions: [AtomicU64; 3],
    levels: [AtomicU64; 3],
    durations: Mutex<Histogram>,
    outcomes: Mutex<VecDeque<bool>>,
    outcome_window: usize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_OUTCOME_WINDOW)
    }

    /// Error rate is computed over the last `window` outcomes
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            active_sessions: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            errors: Default::default(),
            transitions: Default::default(),
            levels: Default::default(),
            durations: Mutex::new(Histogram::default()),
            outcomes: Mutex::new(VecDeque::with_capacity(window)),
            outcome_window: window.max(1),
        }
    }

    pub fn set_active_sessions(&self, n: usize) {
        self.active_sessions.store(n as u64, Ordering::Relaxed);
    }

    pub fn set_sessions_created(&self, n: u64) {
        self.sessions_created.store(n, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, n: usize) {
        self.queue_depth.store(n as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, category: ErrorCategory) {
        self.errors[category.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_transition(&self, to: CircuitState) {
        let index = match to {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.transitions[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_level(&self, level: ExecutionLevel) {
        self.levels[level.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record how one execution attempt ended
    pub fn record_outcome(&self, success: bool, duration: Duration) {
        if success {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        lock(&self.durations).observe(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));

        let mut outcomes = lock(&self.outcomes);
        if outcomes.len() >= self.outcome_window {
            outcomes.pop_front();
        }
        outcomes.push_back(success);
    }

    /// Fraction of failures among recent outcomes (0.0 when none)
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let outcomes = lock(&self.outcomes);
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / outcomes.len() as f64
    }

    /// Outcomes currently in the error-rate window
    #[must_use]
    pub fn outcome_samples(&self) -> usize {
        lock(&self.outcomes).len()
    }

    /// Forget the outcome window, e.g. after an operator intervention
    pub fn reset_error_window(&self) {
        lock(&self.outcomes).clear();
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSnapshot {
            active_sessions: load(&self.active_sessions),
            sessions_created: load(&self.sessions_created),
            queue_depth: load(&self.queue_depth),
            requests_succeeded: load(&self.requests_succeeded),
            requests_failed: load(&self.requests_failed),
            error_rate: self.error_rate(),
            errors: ErrorCounts {
                transient: load(&self.errors[ErrorCategory::Transient.index()]),
                session: load(&self.errors[ErrorCategory::Session.index()]),
                config: load(&self.errors[ErrorCategory::Config.index()]),
                platform: load(&self.errors[ErrorCategory::Platform.index()]),
            },
            breaker_transitions: TransitionCounts {
                closed: load(&self.transitions[0]),
                open: load(&self.transitions[1]),
                half_open: load(&self.transitions[2]),
            },
            level_selections: LevelCounts {
                async_reuse: load(&self.levels[ExecutionLevel::Async.index()]),
                sync_reuse: load(&self.levels[ExecutionLevel::SyncReuse.index()]),
                one_shot: load(&self.levels[ExecutionLevel::OneShot.index()]),
            },
            task_duration: lock(&self.durations).stats(),
        }
    }

    /// Export every metric as a named point
    #[must_use]
    pub fn export(&self) -> Vec<MetricPoint> {
        let s = self.snapshot();
        let mut points = vec![
            MetricPoint::new("agsession_sessions_active", MetricKind::Gauge, s.active_sessions as f64),
            MetricPoint::new("agsession_sessions_created_total", MetricKind::Counter, s.sessions_created as f64),
            MetricPoint::new("agsession_queue_depth", MetricKind::Gauge, s.queue_depth as f64),
            MetricPoint::new("agsession_requests_total", MetricKind::Counter, s.requests_succeeded as f64)
                .label("outcome", "success"),
            MetricPoint::new("agsession_requests_total", MetricKind::Counter, s.requests_failed as f64)
                .label("outcome", "failure"),
            MetricPoint::new("agsession_error_rate", MetricKind::Gauge, s.error_rate),
        ];

        let errors = [
            (ErrorCategory::Transient, s.errors.transient),
            (ErrorCategory::Session, s.errors.session),
            (ErrorCategory::Config, s.errors.config),
            (ErrorCategory::Platform, s.errors.platform),
        ];
        points.extend(errors.iter().map(|(category, n)| {
            MetricPoint::new("agsession_errors_total", MetricKind::Counter, *n as f64)
                .label("category", category.as_str())
        }));

        let transitions = [
            (CircuitState::Closed, s.breaker_transitions.closed),
            (CircuitState::Open, s.breaker_transitions.open),
            (CircuitState::HalfOpen, s.breaker_transitions.half_open),
        ];
        points.extend(transitions.iter().map(|(state, n)| {
            MetricPoint::new("agsession_breaker_transitions_total", MetricKind::Counter, *n as f64)
                .label("to", state.as_str())
        }));

        let levels = [
            (ExecutionLevel::Async, s.level_selections.async_reuse),
            (ExecutionLevel::SyncReuse, s.level_selections.sync_reuse),
            (ExecutionLevel::OneShot, s.level_selections.one_shot),
        ];
        points.extend(levels.iter().map(|(level, n)| {
            MetricPoint::new("agsession_level_selections_total", MetricKind::Counter, *n as f64)
                .label("level", level.as_str())
        }));

        let bounds = DURATION_BUCKETS_MS
            .iter()
            .map(ToString::to_string)
            .chain(std::iter::once("+Inf".to_string()));
        points.extend(bounds.zip(&s.task_duration.buckets).map(|(le, n)| {
            MetricPoint::new("agsession_task_duration_ms_bucket", MetricKind::Histogram, *n as f64)
                .label("le", le)
        }));
        points.push(MetricPoint::new(
            "agsession_task_duration_ms_sum",
            MetricKind::Histogram,
            s.task_duration.sum_ms as f64,
        ));
        points.push(MetricPoint::new(
            "agsession_task_duration_ms_count",
            MetricKind::Histogram,
            s.task_duration.count as f64,
        ));
        points
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
