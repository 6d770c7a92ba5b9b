//! Retry Policy
//!
//! Bounded retries with exponential backoff, driven by error categories.

use crate::config::duration_ms;
use crate::error::{BackendError, BackendResult, ErrorCategory};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Immutable retry policy.
///
/// `max_attempts` counts retries after the first call, so the default policy
/// makes up to four calls, sleeping 1s, 2s and 4s in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Categories worth another attempt
    #[serde(rename = "retryable_categories")]
    pub retryable: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retryable: vec![
                ErrorCategory::Transient,
                ErrorCategory::Session,
                ErrorCategory::Platform,
            ],
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before the `retry`-th retry (1-based), capped at `max_delay`
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether `error` may be retried after `retries_done` retries
    #[must_use]
    pub fn should_retry(&self, error: &BackendError, retries_done: u32) -> bool {
        retries_done < self.max_attempts
            && error.is_retry_candidate()
            && self.retryable.contains(&error.category())
    }

    /// Run `operation` until it succeeds, fails permanently or the budget runs out.
    ///
    /// The closure receives the zero-based attempt number. Cancellation during
    /// a backoff sleep returns `Cancelled` immediately.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> BackendResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut retries = 0;
        loop {
            let error = match operation(retries).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.should_retry(&error, retries) {
                if retries > 0 {
                    tracing::warn!(attempts = retries + 1, category = %error.category(), error = %error, "Giving up");
                }
                return Err(error);
            }

            retries += 1;
            let delay = self.delay_for(retries);
            tracing::debug!(
                attempt = retries,
                category = %error.category(),
                ?delay,
                error = %error,
                "Retrying after backoff"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
