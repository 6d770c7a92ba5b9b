//! Supervisor
//!
//! The upward interface: resolves a logical key to a session, picks an
//! execution level from live health signals, runs the request through retry
//! and the circuit breaker, and falls back to a one-shot process when the
//! pooled path fails.

use crate::config::SupervisorConfig;
use crate::error::{BackendError, BackendResult, ErrorCategory, ExecuteError};
use crate::fallback::{ExecutionLevel, FallbackInputs, FallbackStrategy};
use crate::health::{HealthChecker, HealthContext, HealthReport, HealthStatus, MemoryProbe, ProcMemoryProbe};
use crate::infrastructure::session::process::{run_one_shot, OneShotOptions};
use crate::infrastructure::session::{
    registry, SessionConfig, SessionId, SessionManager, SessionMeta, SessionStatus,
};
use crate::infrastructure::stream::{CallStream, MessageType, StreamMessage};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Counts a request against the queue until dropped
struct QueueTicket {
    in_flight: Arc<AtomicUsize>,
}

impl QueueTicket {
    fn acquire(in_flight: &Arc<AtomicUsize>, capacity: usize) -> BackendResult<Self> {
        in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| BackendError::QueueFull { capacity })?;
        Ok(Self {
            in_flight: Arc::clone(in_flight),
        })
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Records the verdict of a live call once its terminal frame passes by
struct CallObserver {
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    started: Instant,
    settled: bool,
}

impl CallObserver {
    fn settle(&mut self, terminal: &StreamMessage) {
        self.settled = true;
        let elapsed = self.started.elapsed();
        if terminal.message_type == MessageType::Result {
            self.breaker.record_success();
            self.metrics.record_outcome(true, elapsed);
            return;
        }
        let error = BackendError::from_error_message(terminal);
        tracing::debug!(session_id = %terminal.session_id, category = %error.category(), error = %error, "Streamed call failed");
        self.breaker.record_error(&error);
        self.metrics.record_error(error.category());
        self.metrics.record_outcome(false, elapsed);
    }
}

impl Drop for CallObserver {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_aborted();
        }
    }
}

/// Messages of one execution, in order, ending with its terminal frame
pub struct ExecutionStream {
    session_id: SessionId,
    level: ExecutionLevel,
    inner: Pin<Box<dyn Stream<Item = StreamMessage> + Send>>,
    _ticket: QueueTicket,
}

impl ExecutionStream {
    fn live(call: CallStream, observer: CallObserver, ticket: QueueTicket) -> Self {
        let session_id = call.session_id();
        let inner = async_stream::stream! {
            let mut observer = observer;
            let mut call = call;
            while let Some(message) = call.next().await {
                if message.is_terminal() {
                    observer.settle(&message);
                }
                yield message;
            }
        };
        Self {
            session_id,
            level: ExecutionLevel::Async,
            inner: Box::pin(inner),
            _ticket: ticket,
        }
    }

    fn collected(
        session_id: SessionId,
        level: ExecutionLevel,
        messages: Vec<StreamMessage>,
        ticket: QueueTicket,
    ) -> Self {
        Self {
            session_id,
            level,
            inner: Box::pin(futures::stream::iter(messages)),
            _ticket: ticket,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Level that produced this stream
    #[must_use]
    pub fn level(&self) -> ExecutionLevel {
        self.level
    }

    /// Drain the stream into an [`ExecutionOutput`]
    pub async fn collect_output(mut self) -> ExecutionOutput {
        let mut messages = Vec::new();
        while let Some(message) = self.inner.next().await {
            messages.push(message);
        }
        ExecutionOutput {
            session_id: self.session_id,
            level: self.level,
            messages,
        }
    }
}

impl Stream for ExecutionStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("session_id", &self.session_id)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Complete exchange returned by [`Supervisor::execute_sync`]
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutput {
    pub session_id: SessionId,
    pub level: ExecutionLevel,
    pub messages: Vec<StreamMessage>,
}

impl ExecutionOutput {
    /// The final `result` frame, if the exchange completed
    #[must_use]
    pub fn result(&self) -> Option<&StreamMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.message_type == MessageType::Result)
    }

    /// Concatenated content deltas
    #[must_use]
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.message_type == MessageType::ContentDelta)
            .map(|m| m.content.as_str())
            .collect()
    }
}

/// Borrowed inputs of one execution
#[derive(Clone, Copy)]
struct Request<'a> {
    id: SessionId,
    config: &'a SessionConfig,
    input: &'a str,
    cancel: &'a CancellationToken,
}

fn sample_health(
    manager: &SessionManager,
    probe: &dyn MemoryProbe,
    in_flight: &AtomicUsize,
) -> HealthContext {
    // Dead sessions stay listed until reaped so liveness can see them
    let sessions = manager.list_all_sessions();
    let pids: Vec<u32> = sessions
        .iter()
        .filter(|s| s.status != SessionStatus::Dead)
        .filter_map(|s| s.pid)
        .collect();
    HealthContext {
        memory_bytes: probe.resident_bytes(&pids),
        sessions,
        queue_depth: in_flight.load(Ordering::Acquire),
        queue_capacity: manager.config().queue_size,
    }
}

/// Session pool with retry, circuit breaking, health checks and fallback
pub struct Supervisor {
    config: SupervisorConfig,
    manager: Arc<SessionManager>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    fallback: FallbackStrategy,
    health: Arc<HealthChecker>,
    metrics: Arc<Metrics>,
    probe: Arc<dyn MemoryProbe>,
    in_flight: Arc<AtomicUsize>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        Self {
            manager: Arc::new(SessionManager::new(config.pool.clone())),
            breaker: Arc::new(
                CircuitBreaker::new(config.circuit_breaker.clone()).with_metrics(Arc::clone(&metrics)),
            ),
            retry: config.retry.clone(),
            fallback: FallbackStrategy::new(config.fallback.clone()).with_metrics(Arc::clone(&metrics)),
            health: Arc::new(HealthChecker::new(config.health.clone())),
            metrics,
            probe: Arc::new(ProcMemoryProbe),
            in_flight: Arc::new(AtomicUsize::new(0)),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Read memory through `probe` instead of `/proc`
    #[must_use]
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Session configuration built from the `backend` section
    #[must_use]
    pub fn default_session_config(&self) -> SessionConfig {
        self.config.backend.session_config()
    }

    /// Execute `input` for `key`, streaming events as they arrive.
    ///
    /// At level 0 the stream is live: failures after the first frame arrive
    /// as a fatal `error` message and are not retried. At the lower levels
    /// the exchange has already completed and the stream replays it.
    #[tracing::instrument(skip_all, fields(key = %key, session_id = tracing::field::Empty))]
    pub async fn execute_async(
        &self,
        key: &str,
        config: &SessionConfig,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionStream, ExecuteError> {
        self.execute(key, config, input, &cancel, true).await
    }

    /// Execute `input` for `key` and wait for the whole exchange.
    ///
    /// A synchronous caller gains nothing from live streaming, so level 0
    /// runs as level 1 here.
    #[tracing::instrument(skip_all, fields(key = %key, session_id = tracing::field::Empty))]
    pub async fn execute_sync(
        &self,
        key: &str,
        config: &SessionConfig,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecuteError> {
        let stream = self.execute(key, config, input, &cancel, false).await?;
        Ok(stream.collect_output().await)
    }

    async fn execute(
        &self,
        key: &str,
        config: &SessionConfig,
        input: &str,
        cancel: &CancellationToken,
        streaming: bool,
    ) -> Result<ExecutionStream, ExecuteError> {
        let id = registry::resolve(key).map_err(|e| ExecuteError::new(e, ExecutionLevel::Async))?;
        tracing::Span::current().record("session_id", tracing::field::display(id));

        let ticket = QueueTicket::acquire(&self.in_flight, self.config.pool.queue_size).map_err(|e| {
            self.metrics.record_error(e.category());
            ExecuteError::new(e, ExecutionLevel::Async)
        })?;

        let mut level = self.fallback.evaluate(&self.fallback_inputs());
        if !streaming && level == ExecutionLevel::Async {
            level = ExecutionLevel::SyncReuse;
        }

        let request = Request {
            id,
            config,
            input,
            cancel,
        };

        // Output of failed levels, in the order it was produced
        let mut partial = Vec::new();
        loop {
            tracing::debug!(level = %level, "Executing");
            let mut produced = Vec::new();
            let attempt = match level {
                ExecutionLevel::Async => match self.stream_call(request).await {
                    Ok((call, observer)) => return Ok(ExecutionStream::live(call, observer, ticket)),
                    Err(e) => Err(e),
                },
                ExecutionLevel::SyncReuse => self.collect_call(request, &mut produced).await,
                ExecutionLevel::OneShot => self.one_shot(request, &mut produced).await,
            };

            let error = match attempt {
                Ok(messages) => return Ok(ExecutionStream::collected(id, level, messages, ticket)),
                Err(e) => e,
            };
            partial.append(&mut produced);

            let final_failure = matches!(error, BackendError::Cancelled)
                || error.category() == ErrorCategory::Config
                || !self.config.fallback.enabled;
            if final_failure {
                return Err(ExecuteError::new(error, level).with_partial(partial));
            }
            if !level.uses_pool() {
                tracing::error!(level = %level, error = %error, "All execution levels failed");
                return Err(ExecuteError::new(
                    BackendError::Unavailable {
                        reason: error.to_string(),
                    },
                    level,
                )
                .with_partial(partial));
            }

            // Every pooled level shares the pool and the breaker
            tracing::warn!(from = %level, error = %error, "Pooled execution failed, falling back to one-shot");
            level = ExecutionLevel::OneShot;
        }
    }

    fn fallback_inputs(&self) -> FallbackInputs {
        let pids: Vec<u32> = self
            .manager
            .list_active_sessions()
            .iter()
            .filter_map(|s| s.pid)
            .collect();
        FallbackInputs {
            memory_bytes: self.probe.resident_bytes(&pids),
            // Requests ahead of the one being admitted
            queue_depth: self.in_flight.load(Ordering::Acquire).saturating_sub(1),
            queue_capacity: self.config.pool.queue_size,
            error_rate: self.metrics.error_rate(),
            samples: self.metrics.outcome_samples(),
            health: self.health.status(),
            breaker: self.breaker.state(),
        }
    }

    fn record_failure(&self, error: &BackendError, started: Instant) {
        self.breaker.record_error(error);
        self.metrics.record_error(error.category());
        self.metrics.record_outcome(false, started.elapsed());
    }

    /// Drop a session that failed so the next attempt gets a fresh one
    async fn discard_broken(&self, id: SessionId, error: &BackendError) {
        if error.category() != ErrorCategory::Session || matches!(error, BackendError::StreamTaken { .. }) {
            return;
        }
        if self.manager.terminate_session(&id).await.is_ok() {
            tracing::debug!(session_id = %id, "Discarded broken session before retry");
        }
    }

    /// Level 0: admit through the breaker, get the session and start the call
    async fn stream_call(&self, req: Request<'_>) -> BackendResult<(CallStream, CallObserver)> {
        self.retry
            .run(req.cancel, |attempt| async move {
                self.breaker.try_acquire()?;
                let started = Instant::now();

                let started_call: BackendResult<CallStream> = async {
                    let session = self.manager.get_or_create_session(req.id, req.config).await?;
                    session.call(req.input, req.cancel.clone()).await
                }
                .await;

                match started_call {
                    Ok(call) => Ok((
                        call,
                        CallObserver {
                            breaker: Arc::clone(&self.breaker),
                            metrics: Arc::clone(&self.metrics),
                            started,
                            settled: false,
                        },
                    )),
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "Streaming call failed to start");
                        self.record_failure(&e, started);
                        self.discard_broken(req.id, &e).await;
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Level 1: like level 0, but the whole exchange is collected before
    /// returning, so mid-call failures can still be retried
    async fn collect_call(
        &self,
        req: Request<'_>,
        partial: &mut Vec<StreamMessage>,
    ) -> BackendResult<Vec<StreamMessage>> {
        let latest = Mutex::new(Vec::new());
        let latest_ref = &latest;

        let result = self
            .retry
            .run(req.cancel, |attempt| async move {
                self.breaker.try_acquire()?;
                let started = Instant::now();
                let mut messages = Vec::new();

                let outcome: BackendResult<()> = async {
                    let session = self.manager.get_or_create_session(req.id, req.config).await?;
                    let mut call = session.call(req.input, req.cancel.clone()).await?;
                    while let Some(message) = call.next().await {
                        let terminal = message.is_terminal();
                        messages.push(message);
                        if terminal {
                            break;
                        }
                    }
                    match messages.last() {
                        Some(last) if last.message_type == MessageType::Result => Ok(()),
                        Some(last) if last.is_fatal() => Err(BackendError::from_error_message(last)),
                        _ => Err(BackendError::Cancelled),
                    }
                }
                .await;

                match outcome {
                    Ok(()) => {
                        self.breaker.record_success();
                        self.metrics.record_outcome(true, started.elapsed());
                        Ok(messages)
                    }
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "Collected call failed");
                        if matches!(e, BackendError::Cancelled) {
                            self.breaker.record_aborted();
                        } else {
                            self.record_failure(&e, started);
                        }
                        self.discard_broken(req.id, &e).await;
                        *latest_ref.lock().unwrap_or_else(PoisonError::into_inner) = messages;
                        Err(e)
                    }
                }
            })
            .await;

        *partial = latest.into_inner().unwrap_or_else(PoisonError::into_inner);
        result
    }

    /// Level 2: a disposable process per attempt; the breaker is bypassed
    async fn one_shot(
        &self,
        req: Request<'_>,
        partial: &mut Vec<StreamMessage>,
    ) -> BackendResult<Vec<StreamMessage>> {
        let pool = &self.config.pool;
        let options = OneShotOptions {
            max_frame_bytes: pool.max_frame_bytes,
            graceful_shutdown_timeout: pool.graceful_shutdown_timeout,
            force_kill_timeout: pool.force_kill_timeout,
        };
        let latest = Mutex::new(Vec::new());
        let latest_ref = &latest;

        let result = self
            .retry
            .run(req.cancel, |attempt| async move {
                let started = Instant::now();
                let run = run_one_shot(req.id, req.config, req.input, options, req.cancel).await;
                match run.error {
                    None => {
                        self.metrics.record_outcome(true, started.elapsed());
                        Ok(run.messages)
                    }
                    Some(e) => {
                        tracing::debug!(attempt, error = %e, "One-shot run failed");
                        self.metrics.record_error(e.category());
                        self.metrics.record_outcome(false, started.elapsed());
                        *latest_ref.lock().unwrap_or_else(PoisonError::into_inner) = run.messages;
                        Err(e)
                    }
                }
            })
            .await;

        *partial = latest.into_inner().unwrap_or_else(PoisonError::into_inner);
        result
    }

    /// Re-run the health checks now and return the overall status
    pub fn health(&self) -> HealthStatus {
        self.health_report().status
    }

    /// Re-run the health checks now and return the full report
    pub fn health_report(&self) -> HealthReport {
        self.health
            .evaluate(&sample_health(&self.manager, self.probe.as_ref(), &self.in_flight))
    }

    /// Report cached by the last evaluation
    #[must_use]
    pub fn last_health_report(&self) -> HealthReport {
        self.health.latest()
    }

    pub fn list_sessions(&self) -> Vec<SessionMeta> {
        self.manager.list_active_sessions()
    }

    /// Refresh the gauges and take a snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.refresh_gauges();
        self.metrics.snapshot()
    }

    /// The shared metrics registry, e.g. for [`Metrics::export`]
    pub fn metrics_registry(&self) -> Arc<Metrics> {
        self.refresh_gauges();
        Arc::clone(&self.metrics)
    }

    fn refresh_gauges(&self) {
        self.metrics.set_active_sessions(self.manager.session_count());
        self.metrics.set_sessions_created(self.manager.sessions_created());
        self.metrics.set_queue_depth(self.in_flight.load(Ordering::Acquire));
    }

    /// Level chosen for the most recent request
    pub fn current_level(&self) -> ExecutionLevel {
        self.fallback.current()
    }

    /// Forcibly terminate the session behind `key`
    pub async fn terminate(&self, key: &str) -> BackendResult<()> {
        let id = registry::resolve(key)?;
        self.manager.terminate_session(&id).await
    }

    /// Start pool maintenance and periodic health checks; repeated calls are no-ops
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.background.is_cancelled() {
            return;
        }

        let pool = &self.config.pool;
        tasks.push(self.manager.spawn_maintenance(
            pool.maintenance_interval,
            pool.idle_timeout,
            self.background.child_token(),
        ));

        let manager = Arc::clone(&self.manager);
        let probe = Arc::clone(&self.probe);
        let in_flight = Arc::clone(&self.in_flight);
        tasks.push(self.health.spawn_periodic(self.background.child_token(), move || {
            sample_health(&manager, probe.as_ref(), &in_flight)
        }));

        tracing::info!(
            maintenance_interval = ?pool.maintenance_interval,
            health_interval = ?self.config.health.interval,
            "Background tasks started"
        );
    }

    /// Stop background tasks and terminate every session
    pub async fn shutdown(&self) -> usize {
        self.background.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        let terminated = self.manager.terminate_all().await;
        tracing::info!(terminated, "Supervisor shut down");
        terminated
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("manager", &self.manager)
            .field("breaker", &self.breaker)
            .field("level", &self.fallback.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FixedMemoryProbe;
    use crate::resilience::CircuitState;
    use std::time::Duration;

    const ECHO_BACKEND: &str = r#"while IFS= read -r line; do
  echo '{"type":"content_delta","content":"hi"}'
  echo '{"type":"result","result":"done"}'
done"#;

    fn fast_config() -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.retry.initial_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(20);
        config
    }

    fn backend(script: &str) -> SessionConfig {
        SessionConfig::new("sh")
            .args(["-c", script])
            .call_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_queue_ticket_bounds_in_flight() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let first = QueueTicket::acquire(&in_flight, 2).unwrap();
        let _second = QueueTicket::acquire(&in_flight, 2).unwrap();
        assert!(matches!(
            QueueTicket::acquire(&in_flight, 2),
            Err(BackendError::QueueFull { capacity: 2 })
        ));
        drop(first);
        assert_eq!(in_flight.load(Ordering::Acquire), 1);
        assert!(QueueTicket::acquire(&in_flight, 2).is_ok());
    }

    #[test]
    fn test_output_helpers() {
        let id = registry::resolve("k").unwrap();
        let output = ExecutionOutput {
            session_id: id,
            level: ExecutionLevel::SyncReuse,
            messages: vec![
                StreamMessage::new(MessageType::ContentDelta, id, "a"),
                StreamMessage::new(MessageType::ContentDelta, id, "b"),
                StreamMessage::new(MessageType::Result, id, "done"),
            ],
        };
        assert_eq!(output.text(), "ab");
        assert_eq!(output.result().map(|m| m.content.as_str()), Some("done"));
    }

    #[tokio::test]
    async fn test_async_execution_reuses_session() {
        let supervisor = Supervisor::new(fast_config());
        let config = backend(ECHO_BACKEND);

        let first = supervisor
            .execute_async("conversation:1", &config, "hello", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.level(), ExecutionLevel::Async);
        let output = first.collect_output().await;
        assert_eq!(output.text(), "hi");

        let second = supervisor
            .execute_sync("conversation:1", &config, "again", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.level, ExecutionLevel::SyncReuse);
        assert_eq!(second.session_id, output.session_id);
        assert_eq!(supervisor.manager().sessions_created(), 1);

        let metrics = supervisor.metrics();
        assert_eq!(metrics.requests_succeeded, 2);
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.queue_depth, 0);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_key_is_config_error() {
        let supervisor = Supervisor::new(fast_config());
        let err = supervisor
            .execute_sync("   ", &backend(ECHO_BACKEND), "x", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[tokio::test]
    async fn test_memory_pressure_selects_one_shot() {
        let probe = Arc::new(FixedMemoryProbe::new(0));
        let supervisor = Supervisor::new(fast_config()).with_memory_probe(probe.clone());
        let config = backend(ECHO_BACKEND);

        probe.set(u64::MAX);
        let output = supervisor
            .execute_sync("k", &config, "x", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.level, ExecutionLevel::OneShot);
        assert_eq!(supervisor.manager().session_count(), 0);

        probe.set(0);
        let stream = supervisor
            .execute_async("k", &config, "x", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.level(), ExecutionLevel::Async);
        drop(stream.collect_output().await);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unspawnable_backend_falls_back_then_fails() {
        let mut config = fast_config();
        config.retry.max_attempts = 1;
        let supervisor = Supervisor::new(config);
        let missing = SessionConfig::new("/nonexistent/agsession-backend");

        let err = supervisor
            .execute_sync("k", &missing, "x", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.level, ExecutionLevel::OneShot);
        assert!(matches!(err.source, BackendError::Unavailable { .. }));
        assert_eq!(supervisor.circuit_breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_health_reflects_memory_probe() {
        let probe = Arc::new(FixedMemoryProbe::new(u64::MAX));
        let supervisor = Supervisor::new(fast_config()).with_memory_probe(probe.clone());
        assert_eq!(supervisor.health(), HealthStatus::Degraded);
        probe.set(0);
        assert_eq!(supervisor.health(), HealthStatus::Healthy);
        assert_eq!(supervisor.last_health_report().status, HealthStatus::Healthy);
    }
}
