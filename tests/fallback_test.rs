//! Integration tests for health-driven level selection

mod common;

use agsession::{
    resolve, BackendError, ExecutionLevel, FixedMemoryProbe, HealthStatus, MessageType,
    SessionStatus, Supervisor, SupervisorConfig,
};
use common::{
    backend, fast_config, CRASH_THEN_SILENT_BACKEND, ECHO_BACKEND, SINGLE_CALL_BACKEND,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const GIB: u64 = 1024 * 1024 * 1024;

fn supervisor_with_probe(config: SupervisorConfig) -> (Supervisor, Arc<FixedMemoryProbe>) {
    let probe = Arc::new(FixedMemoryProbe::new(256 * 1024 * 1024));
    let supervisor = Supervisor::new(config).with_memory_probe(probe.clone());
    (supervisor, probe)
}

#[tokio::test]
async fn test_memory_pressure_degrades_to_one_shot_and_recovers() {
    let (supervisor, probe) = supervisor_with_probe(fast_config());
    let config = backend(ECHO_BACKEND);
    let key = "pr:octo/repo/99";

    let stream = supervisor
        .execute_async(key, &config, "first", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.level(), ExecutionLevel::Async);
    assert_eq!(stream.collect_output().await.text(), "pong");

    probe.set(3 * GIB);
    let stream = supervisor
        .execute_async(key, &config, "second", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.level(), ExecutionLevel::OneShot);
    let output = stream.collect_output().await;
    assert_eq!(output.text(), "pong");
    assert!(output.result().is_some());
    assert_eq!(supervisor.health(), HealthStatus::Degraded);
    // The pooled session is left alone
    assert_eq!(supervisor.manager().sessions_created(), 1);

    // Selection reads the cached health, so refresh it before the next request
    probe.set(256 * 1024 * 1024);
    assert_eq!(supervisor.health(), HealthStatus::Healthy);
    let stream = supervisor
        .execute_async(key, &config, "third", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.level(), ExecutionLevel::Async);
    drop(stream.collect_output().await);

    let selections = supervisor.metrics().level_selections;
    assert_eq!(selections.async_reuse, 2);
    assert_eq!(selections.one_shot, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_disabled_fallback_stays_on_pool() {
    let mut config = fast_config();
    config.fallback.enabled = false;
    let (supervisor, probe) = supervisor_with_probe(config);
    probe.set(8 * GIB);

    let stream = supervisor
        .execute_async("conversation:pinned", &backend(ECHO_BACKEND), "x", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.level(), ExecutionLevel::Async);
    drop(stream.collect_output().await);
    assert_eq!(supervisor.manager().session_count(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_health_report_lists_failing_checks() {
    let mut config = fast_config();
    config.health.memory_limit_bytes = GIB;
    let (supervisor, probe) = supervisor_with_probe(config);

    let report = supervisor.health_report();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.failing().count(), 0);

    probe.set(2 * GIB);
    let report = supervisor.health_report();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.failing().collect::<Vec<_>>(), vec!["memory"]);
    assert_eq!(report.memory_bytes, 2 * GIB);
    assert_eq!(supervisor.last_health_report().status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_background_tasks_start_once_and_stop_on_shutdown() {
    let mut config = fast_config();
    config.pool.maintenance_interval = Duration::from_millis(50);
    config.pool.idle_timeout = Duration::from_millis(100);
    config.health.interval = Duration::from_millis(50);
    let (supervisor, _probe) = supervisor_with_probe(config);

    supervisor
        .execute_sync("conversation:idle", &backend(ECHO_BACKEND), "x", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(supervisor.manager().session_count(), 1);

    supervisor.start_background_tasks();
    supervisor.start_background_tasks();

    // Maintenance evicts the idle session
    for _ in 0..50 {
        if supervisor.manager().session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(supervisor.manager().session_count(), 0);
    assert_eq!(supervisor.last_health_report().status, HealthStatus::Healthy);

    assert_eq!(supervisor.shutdown().await, 0);
}

#[tokio::test]
async fn test_liveness_fails_while_dead_session_is_unreaped() {
    let (supervisor, _probe) = supervisor_with_probe(fast_config());
    let key = "conversation:short-lived";
    let id = resolve(key).unwrap();

    let output = supervisor
        .execute_sync(key, &backend(SINGLE_CALL_BACKEND), "x", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.text(), "once");

    let session = supervisor.manager().get(&id).unwrap();
    for _ in 0..100 {
        if session.status() == SessionStatus::Dead {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(session.status(), SessionStatus::Dead);

    let report = supervisor.health_report();
    assert_eq!(report.failing().collect::<Vec<_>>(), vec!["liveness"]);
    assert_eq!(report.status, HealthStatus::Degraded);

    assert_eq!(supervisor.manager().reap_dead_sessions().await, 1);
    assert_eq!(supervisor.health(), HealthStatus::Healthy);
}

#[tokio::test]
async fn test_partial_output_survives_fallback_to_one_shot() {
    let dir = tempfile::tempdir().unwrap();
    let config = backend(CRASH_THEN_SILENT_BACKEND)
        .env("MARKER", dir.path().join("started").to_string_lossy());
    let mut supervisor_config = fast_config();
    supervisor_config.retry.max_attempts = 0;
    let (supervisor, _probe) = supervisor_with_probe(supervisor_config);

    let err = supervisor
        .execute_sync("conversation:lossy", &config, "x", CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.level, ExecutionLevel::OneShot);
    assert!(matches!(err.source, BackendError::Unavailable { .. }));

    // The pooled attempt's delta is kept even though one-shot produced nothing
    let first = err.partial.first().unwrap();
    assert_eq!(first.message_type, MessageType::ContentDelta);
    assert_eq!(first.content, "partial");
    assert!(err.partial.last().unwrap().is_fatal());

    supervisor.shutdown().await;
}
