//! Bidirectional Streamer
//!
//! Write path (`write_input`) and read path (`start_streaming`, `call`) over a
//! session's stdin/stdout.
//!
//! A call owns the session's event receiver for its whole duration, so at most
//! one call is active per session. Dropping or cancelling a call before its
//! terminal frame interrupts the backend and drains the rest of the exchange
//! in the background; a session that fails to settle is shut down.

use super::{MessageType, StreamMessage};
use crate::error::{BackendError, BackendResult, ErrorCategory};
use crate::infrastructure::session::{Session, SessionId, SessionStatus};
use chrono::Utc;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type EventReceiver = OwnedMutexGuard<mpsc::Receiver<StreamMessage>>;

/// The raw event sequence of a session, handed out once
pub struct EventStream {
    session_id: SessionId,
    rx: EventReceiver,
}

impl EventStream {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Stream for EventStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Frames of a single call, ending with its terminal frame
pub struct CallStream {
    session_id: SessionId,
    inner: Pin<Box<dyn Stream<Item = StreamMessage> + Send>>,
}

impl CallStream {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Stream for CallStream {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for CallStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

enum Step {
    Message(StreamMessage),
    Closed,
    TimedOut,
    Cancelled,
}

/// Holds the event receiver for the duration of a call
struct CallGuard {
    session: Arc<Session>,
    rx: Option<EventReceiver>,
    finished: bool,
}

impl CallGuard {
    fn finish(&mut self, terminal: &StreamMessage) {
        self.finished = true;
        if terminal.message_type == MessageType::Result {
            self.session.complete_call();
        } else if terminal.error_category() == Some(ErrorCategory::Session) {
            self.session.mark_dead("backend reported a session failure");
        } else {
            self.session.release_busy();
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(rx) = self.rx.take() else {
            return;
        };

        let session = Arc::clone(&self.session);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(session_id = %session.id(), "Call abandoned mid-stream, interrupting backend");
                handle.spawn(session.recover_call(rx));
            }
            Err(_) => {
                session.mark_dead("call abandoned outside a runtime");
                session.cancel.cancel();
            }
        }
    }
}

impl Session {
    /// Write one message to the backend.
    ///
    /// Only write-side messages addressed to this session are accepted, and
    /// only while the session is `ready` or `busy`. A failed write marks the
    /// session dead.
    pub async fn write_input(&self, mut message: StreamMessage) -> BackendResult<()> {
        if !message.message_type.is_write_side() {
            return Err(BackendError::InvalidMessage(format!(
                "{} messages cannot be written to a backend",
                message.message_type
            )));
        }
        if message.session_id != self.id() {
            return Err(BackendError::InvalidMessage(format!(
                "message addressed to session {} written to {}",
                message.session_id,
                self.id()
            )));
        }
        let status = self.status();
        if !matches!(status, SessionStatus::Ready | SessionStatus::Busy) {
            return Err(BackendError::SessionUnavailable {
                id: self.id(),
                status: status.to_string(),
            });
        }

        message.timestamp = Utc::now();
        let frame = self.codec.encode(&message)?;

        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(BackendError::SessionUnavailable {
                id: self.id(),
                status: SessionStatus::Dead.to_string(),
            });
        };
        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        drop(stdin);

        if let Err(e) = written {
            self.mark_dead("stdin write failed");
            return Err(BackendError::WriteFailed {
                id: self.id(),
                reason: e.to_string(),
            });
        }

        tracing::trace!(session_id = %self.id(), kind = %message.message_type, "Frame written");
        self.touch();
        Ok(())
    }

    /// Inject feedback into the call in progress
    pub async fn inject_feedback(&self, content: impl Into<String>) -> BackendResult<()> {
        self.write_input(StreamMessage::feedback(self.id(), content))
            .await
    }

    /// Take the session's raw event sequence.
    ///
    /// The sequence can be taken only once; afterwards `call` is unavailable
    /// on this session.
    pub fn start_streaming(&self) -> BackendResult<EventStream> {
        if self.stream_taken.swap(true, Ordering::AcqRel) {
            return Err(BackendError::StreamTaken { id: self.id() });
        }
        match Arc::clone(&self.events).try_lock_owned() {
            Ok(rx) => Ok(EventStream {
                session_id: self.id(),
                rx,
            }),
            Err(_) => {
                self.stream_taken.store(false, Ordering::Release);
                Err(BackendError::SessionBusy { id: self.id() })
            }
        }
    }

    /// Send `input` and stream the backend's answer up to its terminal frame
    pub async fn call(
        self: &Arc<Self>,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> BackendResult<CallStream> {
        self.call_with(StreamMessage::user_input(self.id(), input), cancel)
            .await
    }

    /// Like [`Session::call`] with a caller-built message
    pub async fn call_with(
        self: &Arc<Self>,
        message: StreamMessage,
        cancel: CancellationToken,
    ) -> BackendResult<CallStream> {
        if !matches!(
            message.message_type,
            MessageType::UserInput | MessageType::FeedbackInjection
        ) {
            return Err(BackendError::InvalidMessage(format!(
                "a call cannot start with a {} message",
                message.message_type
            )));
        }
        if self.stream_taken.load(Ordering::Acquire) {
            return Err(BackendError::StreamTaken { id: self.id() });
        }

        let mut rx = Arc::clone(&self.events)
            .try_lock_owned()
            .map_err(|_| BackendError::SessionBusy { id: self.id() })?;

        {
            let mut state = self.lifecycle();
            match state.status {
                SessionStatus::Ready => state.status = SessionStatus::Busy,
                SessionStatus::Busy => return Err(BackendError::SessionBusy { id: self.id() }),
                other => {
                    return Err(BackendError::SessionUnavailable {
                        id: self.id(),
                        status: other.to_string(),
                    })
                }
            }
        }

        // Leftovers from a previous exchange must not leak into this call
        while let Ok(stale) = rx.try_recv() {
            tracing::trace!(session_id = %self.id(), kind = %stale.message_type, "Discarding stale frame");
        }

        if let Err(e) = self.write_input(message).await {
            self.release_busy();
            return Err(e);
        }

        let guard = CallGuard {
            session: Arc::clone(self),
            rx: Some(rx),
            finished: false,
        };
        Ok(CallStream {
            session_id: self.id(),
            inner: Box::pin(call_frames(guard, self.config().call_timeout, cancel)),
        })
    }

    pub(crate) fn release_busy(&self) {
        let mut state = self.lifecycle();
        if state.status == SessionStatus::Busy {
            state.status = SessionStatus::Ready;
        }
    }

    /// Interrupt an abandoned call and wait for the backend to settle
    async fn recover_call(self: Arc<Self>, mut rx: EventReceiver) {
        if self.is_alive() {
            if let Err(e) = self.write_input(StreamMessage::cancel(self.id())).await {
                tracing::debug!(session_id = %self.id(), error = %e, "Interrupt frame not delivered");
            } else {
                let deadline = Instant::now() + self.options.graceful_shutdown_timeout;
                while let Ok(Some(message)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                    if !message.is_terminal() {
                        continue;
                    }
                    if self.status() == SessionStatus::Busy && !message.is_fatal() {
                        self.release_busy();
                        tracing::debug!(session_id = %self.id(), "Session recovered after interrupt");
                        return;
                    }
                    break;
                }
            }
        }

        drop(rx);
        tracing::info!(session_id = %self.id(), "Session did not settle after interrupt, shutting down");
        self.shutdown().await;
    }
}

fn call_frames(
    guard: CallGuard,
    call_timeout: std::time::Duration,
    cancel: CancellationToken,
) -> impl Stream<Item = StreamMessage> + Send {
    async_stream::stream! {
        let mut guard = guard;
        let session_id = guard.session.id();
        let timeout_ms = u64::try_from(call_timeout.as_millis()).unwrap_or(u64::MAX);

        loop {
            let Some(rx) = guard.rx.as_deref_mut() else {
                break;
            };
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                next = tokio::time::timeout(call_timeout, rx.recv()) => match next {
                    Ok(Some(message)) => Step::Message(message),
                    Ok(None) => Step::Closed,
                    Err(_) => Step::TimedOut,
                },
            };

            match step {
                Step::Message(message) => {
                    guard.session.touch();
                    if message.is_terminal() {
                        guard.finish(&message);
                        yield message;
                        break;
                    }
                    yield message;
                }
                Step::Closed => {
                    guard.finished = true;
                    guard.session.mark_dead("backend output closed mid-call");
                    yield StreamMessage::error(
                        session_id,
                        "backend output closed mid-call",
                        ErrorCategory::Session,
                        true,
                    );
                    break;
                }
                Step::TimedOut => {
                    tracing::warn!(session_id = %session_id, timeout_ms, "Call timed out waiting for backend output");
                    yield StreamMessage::timeout(session_id, timeout_ms);
                    break;
                }
                Step::Cancelled => {
                    tracing::debug!(session_id = %session_id, "Call cancelled");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::session::{SessionConfig, SpawnOptions};
    use futures::StreamExt;
    use std::time::Duration;
    use uuid::Uuid;

    const ECHO_BACKEND: &str = r#"while IFS= read -r line; do
  case "$line" in
    *interrupt*) echo '{"type":"result","result":"interrupted"}' ;;
    *) echo '{"type":"content_delta","content":"echo"}'; echo '{"type":"result","result":"done"}' ;;
  esac
done"#;

    /// Answers input with one delta and never finishes unless interrupted
    const STALLING_BACKEND: &str = r#"while IFS= read -r line; do
  case "$line" in
    *interrupt*) echo '{"type":"result","result":"stopped"}' ;;
    *) echo '{"type":"content_delta","content":"working"}' ;;
  esac
done"#;

    async fn spawn(script: &str) -> Arc<Session> {
        spawn_with(script, Duration::from_secs(5), SpawnOptions::default()).await
    }

    async fn spawn_with(script: &str, call_timeout: Duration, options: SpawnOptions) -> Arc<Session> {
        let config = SessionConfig::new("sh")
            .args(["-c", script])
            .call_timeout(call_timeout);
        Session::spawn(Uuid::new_v4(), config, options).await.unwrap()
    }

    async fn wait_for_status(session: &Session, status: SessionStatus) {
        for _ in 0..100 {
            if session.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session never reached {status}, stuck at {}", session.status());
    }

    #[tokio::test]
    async fn test_call_streams_until_result() {
        let session = spawn(ECHO_BACKEND).await;

        for round in 1..=2 {
            let messages: Vec<_> = session
                .call("hello", CancellationToken::new())
                .await
                .unwrap()
                .collect()
                .await;
            let types: Vec<_> = messages.iter().map(|m| m.message_type).collect();
            assert_eq!(types, vec![MessageType::ContentDelta, MessageType::Result]);
            assert!(messages.iter().all(|m| m.session_id == session.id()));
            assert_eq!(session.status(), SessionStatus::Ready);
            assert_eq!(session.calls_served(), round);
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_call_at_a_time() {
        let session = spawn(STALLING_BACKEND).await;
        let mut first = session.call("one", CancellationToken::new()).await.unwrap();
        assert_eq!(first.next().await.unwrap().content, "working");
        assert_eq!(session.status(), SessionStatus::Busy);

        let second = session.call("two", CancellationToken::new()).await;
        assert!(matches!(second, Err(BackendError::SessionBusy { .. })));

        drop(first);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_input_validation() {
        let session = spawn(ECHO_BACKEND).await;

        let foreign = StreamMessage::user_input(Uuid::new_v4(), "hi");
        assert!(matches!(
            session.write_input(foreign).await,
            Err(BackendError::InvalidMessage(_))
        ));

        let read_side = StreamMessage::new(MessageType::Result, session.id(), "x");
        assert!(matches!(
            session.write_input(read_side).await,
            Err(BackendError::InvalidMessage(_))
        ));

        session.shutdown().await;
        let late = StreamMessage::user_input(session.id(), "hi");
        assert!(matches!(
            session.write_input(late).await,
            Err(BackendError::SessionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_event_stream_taken_once() {
        let session = spawn(ECHO_BACKEND).await;
        let mut events = session.start_streaming().unwrap();
        assert!(matches!(
            session.start_streaming(),
            Err(BackendError::StreamTaken { .. })
        ));
        assert!(matches!(
            session.call("x", CancellationToken::new()).await,
            Err(BackendError::StreamTaken { .. })
        ));

        session
            .write_input(StreamMessage::user_input(session.id(), "ping"))
            .await
            .unwrap();
        assert_eq!(events.next().await.unwrap().message_type, MessageType::ContentDelta);
        assert_eq!(events.next().await.unwrap().message_type, MessageType::Result);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_call_recovers_session() {
        let session = spawn(STALLING_BACKEND).await;
        let mut call = session.call("long task", CancellationToken::new()).await.unwrap();
        assert_eq!(call.next().await.unwrap().message_type, MessageType::ContentDelta);
        drop(call);

        wait_for_status(&session, SessionStatus::Ready).await;
        let messages: Vec<_> = session
            .call("again", CancellationToken::new())
            .await
            .unwrap()
            .take(1)
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_call_ends_without_terminal() {
        let session = spawn(STALLING_BACKEND).await;
        let cancel = CancellationToken::new();
        let mut call = session.call("task", cancel.clone()).await.unwrap();
        assert!(call.next().await.is_some());

        cancel.cancel();
        assert!(call.next().await.is_none());
        drop(call);
        wait_for_status(&session, SessionStatus::Ready).await;
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_then_unsettled_session_is_shut_down() {
        let options = SpawnOptions {
            graceful_shutdown_timeout: Duration::from_millis(200),
            ..SpawnOptions::default()
        };
        let session = spawn_with("while read -r line; do :; done", Duration::from_millis(150), options).await;

        let messages: Vec<_> = session
            .call("anyone?", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_fatal());
        assert_eq!(messages[0].error_category(), Some(ErrorCategory::Transient));

        wait_for_status(&session, SessionStatus::Dead).await;
    }

    #[tokio::test]
    async fn test_crash_mid_call() {
        let session = spawn(
            r#"read -r line; echo '{"type":"content_delta","content":"partial"}'; echo 'fatal: out of memory' >&2; exit 3"#,
        )
        .await;

        let messages: Vec<_> = session
            .call("go", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "partial");
        let last = &messages[1];
        assert!(last.is_fatal());
        assert_eq!(last.error_category(), Some(ErrorCategory::Session));
        assert_eq!(session.status(), SessionStatus::Dead);
    }

    #[tokio::test]
    async fn test_decode_errors_are_not_fatal() {
        let session = spawn(
            r#"while IFS= read -r line; do echo 'not json'; echo '{"type":"result","result":"ok"}'; done"#,
        )
        .await;
        let messages: Vec<_> = session
            .call("x", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::Error);
        assert!(!messages[0].is_fatal());
        assert_eq!(messages[1].message_type, MessageType::Result);
        assert_eq!(session.status(), SessionStatus::Ready);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_and_oversized_frames_keep_session_alive() {
        let options = SpawnOptions {
            max_frame_bytes: 1024,
            ..SpawnOptions::default()
        };
        let session = spawn_with(
            r#"while IFS= read -r line; do
  printf '\377\376\n'
  head -c 4096 /dev/zero | tr '\0' x; echo
  echo '{"type":"result","result":"ok"}'
done"#,
            Duration::from_secs(5),
            options,
        )
        .await;

        for _ in 0..2 {
            let messages: Vec<_> = session
                .call("x", CancellationToken::new())
                .await
                .unwrap()
                .collect()
                .await;
            let types: Vec<_> = messages.iter().map(|m| m.message_type).collect();
            assert_eq!(
                types,
                vec![MessageType::Error, MessageType::Error, MessageType::Result]
            );
            assert!(messages[..2].iter().all(|m| !m.is_fatal()));
            assert_eq!(messages[0].error_category(), Some(ErrorCategory::Session));
            assert_eq!(messages[2].content, "ok");
            assert_eq!(session.status(), SessionStatus::Ready);
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_feedback_mid_call() {
        let session = spawn(
            r#"while IFS= read -r line; do
  case "$line" in
    *feedback*) echo '{"type":"result","result":"adjusted"}' ;;
    *) echo '{"type":"thinking","content":"considering"}' ;;
  esac
done"#,
        )
        .await;
        let mut call = session.call("review", CancellationToken::new()).await.unwrap();
        assert_eq!(call.next().await.unwrap().message_type, MessageType::Thinking);

        session.inject_feedback("focus on error handling").await.unwrap();
        let result = call.next().await.unwrap();
        assert_eq!(result.content, "adjusted");
        assert!(call.next().await.is_none());
        session.shutdown().await;
    }
}
