//! Health Checker
//!
//! Independent checks over a sampled [`HealthContext`], reduced to a single
//! [`HealthStatus`] that feeds fallback level selection.

use crate::config::duration_ms;
use crate::infrastructure::session::{SessionMeta, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Reduce check outcomes: any failure degrades, a failing majority is unhealthy
    #[must_use]
    pub fn reduce(checks: &[CheckResult]) -> Self {
        let failing = checks.iter().filter(|c| !c.passed).count();
        if failing == 0 {
            HealthStatus::Healthy
        } else if failing * 2 > checks.len() {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    pub memory_limit_bytes: u64,
    /// Queue depth, as a fraction of capacity, considered unhealthy
    pub queue_depth_ratio: f64,
    /// Longest a ready session may sit idle before cleanup is considered stalled
    #[serde(rename = "max_idle_ms", with = "duration_ms")]
    pub max_idle: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            queue_depth_ratio: 0.8,
            max_idle: Duration::from_secs(35 * 60),
        }
    }
}

/// Everything the checks look at, sampled once per evaluation
#[derive(Debug, Clone, Default)]
pub struct HealthContext {
    pub sessions: Vec<SessionMeta>,
    pub memory_bytes: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        }
    }
}

pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, context: &HealthContext) -> CheckResult;
}

/// No ready session has outlived the idle bound
pub struct IdleBoundCheck {
    pub max_idle: Duration,
}

impl HealthCheck for IdleBoundCheck {
    fn name(&self) -> &str {
        "idle_bound"
    }

    fn check(&self, context: &HealthContext) -> CheckResult {
        let limit = u64::try_from(self.max_idle.as_millis()).unwrap_or(u64::MAX);
        let stale = context
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Ready && s.idle_ms > limit)
            .count();
        CheckResult::new(self.name(), stale == 0, format!("{stale} sessions past idle bound"))
    }
}

pub struct MemoryCheck {
    pub limit_bytes: u64,
}

impl HealthCheck for MemoryCheck {
    fn name(&self) -> &str {
        "memory"
    }

    fn check(&self, context: &HealthContext) -> CheckResult {
        CheckResult::new(
            self.name(),
            context.memory_bytes < self.limit_bytes,
            format!("{} of {} bytes", context.memory_bytes, self.limit_bytes),
        )
    }
}

pub struct QueueDepthCheck {
    pub ratio: f64,
}

impl HealthCheck for QueueDepthCheck {
    fn name(&self) -> &str {
        "queue_depth"
    }

    fn check(&self, context: &HealthContext) -> CheckResult {
        let limit = self.ratio * context.queue_capacity.max(1) as f64;
        CheckResult::new(
            self.name(),
            (context.queue_depth as f64) < limit,
            format!("{} of {} queued", context.queue_depth, context.queue_capacity),
        )
    }
}

/// Every pooled session still has a running process
pub struct LivenessCheck;

impl HealthCheck for LivenessCheck {
    fn name(&self) -> &str {
        "liveness"
    }

    fn check(&self, context: &HealthContext) -> CheckResult {
        let dead = context
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Dead)
            .count();
        CheckResult::new(self.name(), dead == 0, format!("{dead} dead sessions"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub memory_bytes: u64,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    fn initial() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
            memory_bytes: 0,
            checked_at: Utc::now(),
        }
    }

    /// Names of the checks that failed
    pub fn failing(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().filter(|c| !c.passed).map(|c| c.name.as_str())
    }
}

/// Source of resident memory readings
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes of this process plus `pids`
    fn resident_bytes(&self, pids: &[u32]) -> u64;
}

/// Reads resident set sizes from `/proc/<pid>/statm`; reports zero elsewhere
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemoryProbe;

const PAGE_SIZE: u64 = 4096;

impl ProcMemoryProbe {
    fn statm_bytes(pid: &str) -> Option<u64> {
        let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * PAGE_SIZE)
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn resident_bytes(&self, pids: &[u32]) -> u64 {
        let own = Self::statm_bytes("self").unwrap_or(0);
        pids.iter()
            .filter_map(|pid| Self::statm_bytes(&pid.to_string()))
            .fold(own, u64::saturating_add)
    }
}

/// Settable reading, for simulating memory pressure
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    bytes: AtomicU64,
}

impl FixedMemoryProbe {
    #[must_use]
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn resident_bytes(&self, _pids: &[u32]) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Runs the checks and caches the latest report
pub struct HealthChecker {
    config: HealthConfig,
    checks: Vec<Box<dyn HealthCheck>>,
    latest: Mutex<HealthReport>,
}

impl HealthChecker {
    /// Checker with the standard idle, memory, queue and liveness checks
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        let checks: Vec<Box<dyn HealthCheck>> = vec![
            Box::new(IdleBoundCheck {
                max_idle: config.max_idle,
            }),
            Box::new(MemoryCheck {
                limit_bytes: config.memory_limit_bytes,
            }),
            Box::new(QueueDepthCheck {
                ratio: config.queue_depth_ratio,
            }),
            Box::new(LivenessCheck),
        ];
        Self::with_checks(config, checks)
    }

    #[must_use]
    pub fn with_checks(config: HealthConfig, checks: Vec<Box<dyn HealthCheck>>) -> Self {
        Self {
            config,
            checks,
            latest: Mutex::new(HealthReport::initial()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run every check against `context` and cache the result
    pub fn evaluate(&self, context: &HealthContext) -> HealthReport {
        let checks: Vec<CheckResult> = self.checks.iter().map(|c| c.check(context)).collect();
        let report = HealthReport {
            status: HealthStatus::reduce(&checks),
            checks,
            memory_bytes: context.memory_bytes,
            checked_at: Utc::now(),
        };

        let previous = {
            let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *latest, report.clone()).status
        };
        if previous != report.status {
            let failing: Vec<&str> = report.failing().collect();
            match report.status {
                HealthStatus::Healthy => tracing::info!(from = %previous, "Health recovered"),
                status => tracing::warn!(from = %previous, to = %status, ?failing, "Health changed"),
            }
        }
        report
    }

    /// Most recent report
    #[must_use]
    pub fn latest(&self) -> HealthReport {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Evaluate every `config.interval` with a freshly sampled context until `cancel` fires
    pub fn spawn_periodic<F>(self: &Arc<Self>, cancel: CancellationToken, sample: F) -> JoinHandle<()>
    where
        F: Fn() -> HealthContext + Send + 'static,
    {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checker.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Health checker stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        checker.evaluate(&sample());
                    }
                }
            }
        })
    }
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("checks", &self.checks.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
