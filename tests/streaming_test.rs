//! Integration tests for bidirectional streaming through the supervisor

mod common;

use agsession::{
    resolve, ErrorCategory, ExecutionLevel, MessageType, SessionStatus, StreamMessage, Supervisor,
};
use common::{backend, fast_config, CRASHING_BACKEND, ECHO_BACKEND, STALLING_BACKEND};
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_events_arrive_in_order_and_end_with_result() {
    let supervisor = Supervisor::new(fast_config());
    let config = backend(ECHO_BACKEND);

    let stream = supervisor
        .execute_async("conversation:order", &config, "ping", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.level(), ExecutionLevel::Async);
    assert_eq!(stream.session_id(), resolve("conversation:order").unwrap());

    let messages: Vec<StreamMessage> = stream.collect().await;
    let kinds: Vec<MessageType> = messages.iter().map(|m| m.message_type).collect();
    assert_eq!(kinds, vec![MessageType::ContentDelta, MessageType::Result]);
    assert_eq!(messages[0].content, "pong");
    assert!(messages.iter().all(|m| m.session_id == resolve("conversation:order").unwrap()));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crash_mid_call_surfaces_error_and_next_request_gets_fresh_session() {
    let supervisor = Supervisor::new(fast_config());
    let config = backend(CRASHING_BACKEND);
    let key = "pr:octo/repo/7";
    let id = resolve(key).unwrap();

    let warmup = supervisor
        .execute_sync(key, &config, "hello", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(warmup.text(), "ok");

    let messages: Vec<StreamMessage> = supervisor
        .execute_async(key, &config, "crash", CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(messages.first().map(|m| m.content.as_str()), Some("partial"));
    let last = messages.last().unwrap();
    assert!(last.is_fatal());
    assert_eq!(last.error_category(), Some(ErrorCategory::Session));

    // The dead session is never handed out again
    if let Some(session) = supervisor.manager().get(&id) {
        assert_eq!(session.status(), SessionStatus::Dead);
    }

    let output = supervisor
        .execute_sync(key, &config, "again", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.text(), "ok");
    assert_eq!(output.session_id, id);
    assert_eq!(supervisor.manager().sessions_created(), 2);

    let metrics = supervisor.metrics();
    assert_eq!(metrics.errors.session, 1);
    assert_eq!(metrics.requests_succeeded, 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_call_leaves_session_reusable() {
    let supervisor = Supervisor::new(fast_config());
    let config = backend(STALLING_BACKEND);
    let key = "conversation:cancel";
    let id = resolve(key).unwrap();
    let cancel = CancellationToken::new();

    let mut stream = supervisor
        .execute_async(key, &config, "work", cancel.clone())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().content, "working");

    cancel.cancel();
    assert!(stream.next().await.is_none());
    drop(stream);

    let session = supervisor.manager().get(&id).unwrap();
    wait_until(|| session.status() == SessionStatus::Ready).await;
    assert_eq!(supervisor.metrics().queue_depth, 0);
    assert_eq!(supervisor.circuit_breaker().consecutive_failures(), 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_feedback_injection_during_call() {
    let supervisor = Supervisor::new(fast_config());
    let config = backend(STALLING_BACKEND);
    let key = "conversation:feedback";

    let mut stream = supervisor
        .execute_async(key, &config, "start", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().content, "working");

    let session = supervisor.manager().get(&stream.session_id()).unwrap();
    session.inject_feedback("also check the tests").await.unwrap();
    let next = stream.next().await.unwrap();
    assert_eq!(next.message_type, MessageType::ContentDelta);
    assert_eq!(next.content, "working");

    drop(stream);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_raw_event_stream_is_taken_once() {
    let supervisor = Supervisor::new(fast_config());
    let config = backend(ECHO_BACKEND);
    let id = resolve("conversation:raw").unwrap();

    let session = supervisor
        .manager()
        .get_or_create_session(id, &config)
        .await
        .unwrap();
    let mut events = session.start_streaming().unwrap();
    assert!(session.start_streaming().is_err());
    assert!(session.call("x", CancellationToken::new()).await.is_err());

    session
        .write_input(StreamMessage::user_input(id, "hello"))
        .await
        .unwrap();
    assert_eq!(events.next().await.unwrap().message_type, MessageType::ContentDelta);
    assert_eq!(events.next().await.unwrap().message_type, MessageType::Result);

    // Read-side messages cannot be written
    assert!(session
        .write_input(StreamMessage::new(MessageType::Result, id, "forged"))
        .await
        .is_err());

    supervisor.shutdown().await;
}
