//! Backend Session
//!
//! Runtime handle for one long-running backend process: its pipes, lifecycle
//! state and diagnostic metadata.

use super::process::{self, BackendProcess, ShutdownOutcome};
use super::registry::SessionId;
use crate::error::{BackendError, BackendResult, ErrorCategory};
use crate::infrastructure::stream::{FrameCodec, FrameReader, MessageType, StreamMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-session event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Process spawned, handshake pending
    Starting,
    /// Idle and accepting input
    Ready,
    /// Serving a call
    Busy,
    /// Process gone or shut down; terminal
    Dead,
}

impl SessionStatus {
    /// Whether `self -> next` is a legal lifecycle transition
    #[must_use]
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Starting, Ready) | (Ready, Busy) | (Busy, Ready) | (Starting | Ready | Busy, Dead)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Ready => "ready",
            SessionStatus::Busy => "busy",
            SessionStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a freshly spawned backend signals readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeMode {
    /// Ready as soon as the process is running
    #[default]
    None,
    /// Ready once the backend emits a `system` frame
    InitFrame,
}

/// Command-line flags used to pass limits and identity to the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendFlags {
    /// Flag preceding the model name (e.g. `--model`)
    pub model: Option<String>,
    /// Flag preceding the session id; omitted for one-shot runs
    pub session_id: Option<String>,
    /// Flag preceding the turn limit
    pub max_turns: Option<String>,
    /// Flag preceding the budget limit in USD
    pub max_budget: Option<String>,
    /// Arguments always passed after the user-provided ones
    pub extra: Vec<String>,
}

impl BackendFlags {
    /// Flags for the Claude CLI in `stream-json` mode
    #[must_use]
    pub fn claude() -> Self {
        Self {
            model: Some("--model".to_string()),
            session_id: Some("--session-id".to_string()),
            max_turns: Some("--max-turns".to_string()),
            max_budget: Some("--max-budget-usd".to_string()),
            extra: [
                "-p",
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
        }
    }
}

/// Immutable configuration for a backend session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Executable to run
    pub command: String,
    /// Arguments passed before any generated flags
    pub args: Vec<String>,
    /// Working directory (tilde-expanded)
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    /// Longest silence tolerated between frames of one call
    pub call_timeout: Duration,
    pub flags: BackendFlags,
    pub handshake: HandshakeMode,
    /// Initial metadata copied into the session
    pub metadata: HashMap<String, String>,
}

impl SessionConfig {
    /// Configuration for an arbitrary command with no generated flags
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            model: None,
            max_turns: None,
            max_budget_usd: None,
            call_timeout: Duration::from_secs(300),
            flags: BackendFlags::default(),
            handshake: HandshakeMode::None,
            metadata: HashMap::new(),
        }
    }

    /// Claude CLI preset
    #[must_use]
    pub fn claude() -> Self {
        let mut config = Self::new("claude");
        config.flags = BackendFlags::claude();
        config.handshake = HandshakeMode::InitFrame;
        config
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory, expanding a leading `~`
    #[must_use]
    pub fn working_dir(mut self, dir: impl AsRef<str>) -> Self {
        self.working_dir = Some(PathBuf::from(shellexpand::tilde(dir.as_ref()).into_owned()));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    #[must_use]
    pub fn max_budget_usd(mut self, budget: f64) -> Self {
        self.max_budget_usd = Some(budget);
        self
    }

    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn handshake(mut self, mode: HandshakeMode) -> Self {
        self.handshake = mode;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: BackendFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reject configurations that can never produce a working session
    pub fn validate(&self) -> BackendResult<()> {
        if self.command.trim().is_empty() {
            return Err(BackendError::InvalidConfig("command must not be empty".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(BackendError::InvalidConfig("call_timeout must be positive".into()));
        }
        if self.max_turns == Some(0) {
            return Err(BackendError::InvalidConfig("max_turns must be positive".into()));
        }
        if let Some(budget) = self.max_budget_usd {
            if !budget.is_finite() || budget <= 0.0 {
                return Err(BackendError::InvalidConfig(format!(
                    "max_budget_usd must be a positive amount, got {budget}"
                )));
            }
        }
        Ok(())
    }

    /// Full argument list; the session flag is rendered only when an id is given
    #[must_use]
    pub fn command_args(&self, session_id: Option<SessionId>) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(self.flags.extra.iter().cloned());

        let mut push = |flag: &Option<String>, value: Option<String>| {
            if let (Some(flag), Some(value)) = (flag, value) {
                args.push(flag.clone());
                args.push(value);
            }
        };
        push(&self.flags.model, self.model.clone());
        push(&self.flags.session_id, session_id.map(|id| id.to_string()));
        push(&self.flags.max_turns, self.max_turns.map(|t| t.to_string()));
        push(&self.flags.max_budget, self.max_budget_usd.map(|b| b.to_string()));
        args
    }
}

/// Timeouts and limits applied when spawning a session
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub startup_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub force_kill_timeout: Duration,
    pub max_frame_bytes: usize,
    pub stderr_tail_lines: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            graceful_shutdown_timeout: Duration::from_secs(5),
            force_kill_timeout: Duration::from_secs(2),
            max_frame_bytes: crate::infrastructure::stream::codec::DEFAULT_MAX_FRAME_BYTES,
            stderr_tail_lines: 50,
        }
    }
}

/// Serializable snapshot of a session for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub calls_served: u64,
    pub metadata: HashMap<String, String>,
    pub stderr_tail: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) status: SessionStatus,
    last_active: Instant,
    last_active_wall: DateTime<Utc>,
    calls_served: u64,
    metadata: HashMap<String, String>,
}

/// A single backend session
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    pub(crate) codec: FrameCodec,
    pid: Option<u32>,
    created_at: Instant,
    created_at_wall: DateTime<Utc>,
    pub(crate) lifecycle: Arc<Mutex<Lifecycle>>,
    /// Writer half; single-writer discipline via this lock
    pub(crate) stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Decoded output of the reader task
    pub(crate) events: Arc<tokio::sync::Mutex<mpsc::Receiver<StreamMessage>>>,
    pub(crate) stream_taken: AtomicBool,
    child: tokio::sync::Mutex<Option<Child>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) options: SpawnOptions,
}

impl Session {
    /// Spawn the backend process and wait for it to become ready
    pub async fn spawn(
        id: SessionId,
        config: SessionConfig,
        options: SpawnOptions,
    ) -> BackendResult<Arc<Self>> {
        config.validate()?;

        let BackendProcess {
            child,
            stdin,
            stdout,
            stderr,
            pid,
        } = process::spawn_backend(&config, Some(id))?;

        let now = Instant::now();
        let lifecycle = Arc::new(Mutex::new(Lifecycle {
            status: SessionStatus::Starting,
            last_active: now,
            last_active_wall: Utc::now(),
            calls_served: 0,
            metadata: config.metadata.clone(),
        }));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(options.stderr_tail_lines)));
        let cancel = CancellationToken::new();
        let codec = FrameCodec::new(options.max_frame_bytes);
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(read_stdout(
            id,
            stdout,
            codec,
            tx,
            Arc::clone(&lifecycle),
            Arc::clone(&stderr_tail),
            cancel.clone(),
        ));
        tokio::spawn(process::drain_stderr(
            id,
            stderr,
            Arc::clone(&stderr_tail),
            options.stderr_tail_lines,
            cancel.clone(),
        ));

        let mut child = child;
        let handshake = match config.handshake {
            HandshakeMode::None => match child.try_wait() {
                Ok(None) => Ok(()),
                Ok(Some(status)) => Err(BackendError::ProcessExited {
                    id,
                    detail: format!("exited during startup ({status})"),
                }),
                Err(e) => Err(BackendError::Io(e)),
            },
            HandshakeMode::InitFrame => await_init_frame(id, &mut rx, options.startup_timeout).await,
        };

        let session = Arc::new(Self {
            id,
            pid,
            created_at: now,
            created_at_wall: Utc::now(),
            lifecycle,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            events: Arc::new(tokio::sync::Mutex::new(rx)),
            stream_taken: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(Some(child)),
            stderr_tail,
            cancel,
            codec,
            options,
            config,
        });

        if let Err(e) = handshake {
            tracing::warn!(session_id = %id, error = %e, "Backend handshake failed");
            session.shutdown().await;
            return Err(e);
        }

        session.transition(SessionStatus::Ready)?;
        tracing::info!(
            session_id = %id,
            pid = ?session.pid,
            command = %session.config.command,
            "Backend session started"
        );
        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.lifecycle().status
    }

    /// Whether the session can still serve calls
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status() != SessionStatus::Dead
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn last_active(&self) -> Instant {
        self.lifecycle().last_active
    }

    #[must_use]
    pub fn idle_duration(&self) -> Duration {
        self.last_active().elapsed()
    }

    #[must_use]
    pub fn calls_served(&self) -> u64 {
        self.lifecycle().calls_served
    }

    /// Update last activity timestamp
    pub fn touch(&self) {
        let mut state = self.lifecycle();
        state.last_active = Instant::now();
        state.last_active_wall = Utc::now();
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lifecycle().metadata.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn metadata(&self) -> HashMap<String, String> {
        self.lifecycle().metadata.clone()
    }

    /// Most recent stderr lines, oldest first
    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Apply a lifecycle transition
    pub fn transition(&self, next: SessionStatus) -> BackendResult<()> {
        transition(&self.lifecycle, self.id, next)
    }

    pub(crate) fn complete_call(&self) {
        let mut state = self.lifecycle();
        if state.status == SessionStatus::Busy {
            state.status = SessionStatus::Ready;
            state.calls_served += 1;
            state.last_active = Instant::now();
            state.last_active_wall = Utc::now();
        }
    }

    /// Mark the session dead without touching the process
    pub fn mark_dead(&self, reason: &str) {
        let mut state = self.lifecycle();
        if state.status != SessionStatus::Dead {
            tracing::warn!(session_id = %self.id, from = %state.status, reason, "Session marked dead");
            state.status = SessionStatus::Dead;
        }
    }

    /// Diagnostics snapshot
    #[must_use]
    pub fn meta(&self) -> SessionMeta {
        let state = self.lifecycle();
        SessionMeta {
            id: self.id,
            status: state.status,
            pid: self.pid,
            command: self.config.command.clone(),
            created_at: self.created_at_wall,
            last_active_at: state.last_active_wall,
            idle_ms: u64::try_from(state.last_active.elapsed().as_millis()).unwrap_or(u64::MAX),
            calls_served: state.calls_served,
            metadata: state.metadata.clone(),
            stderr_tail: self.stderr_tail(),
        }
    }

    /// Close stdin, wait for a graceful exit, then force-kill.
    ///
    /// The session ends up `dead` whatever the outcome; calling this twice is
    /// harmless.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.mark_dead("shutdown requested");

        // Dropping stdin delivers EOF to the backend
        drop(self.stdin.lock().await.take());

        let child = self.child.lock().await.take();
        let outcome = match child {
            Some(child) => {
                process::shutdown_child(
                    child,
                    self.options.graceful_shutdown_timeout,
                    self.options.force_kill_timeout,
                )
                .await
            }
            None => ShutdownOutcome::AlreadyStopped,
        };
        self.cancel.cancel();

        tracing::debug!(session_id = %self.id, ?outcome, "Backend session shut down");
        outcome
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .field("command", &self.config.command)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn transition(lifecycle: &Mutex<Lifecycle>, id: SessionId, next: SessionStatus) -> BackendResult<()> {
    let mut state = lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
    if state.status == next && next == SessionStatus::Dead {
        return Ok(());
    }
    if !state.status.can_transition_to(next) {
        return Err(BackendError::InvalidTransition {
            from: state.status.to_string(),
            to: next.to_string(),
        });
    }
    tracing::trace!(session_id = %id, from = %state.status, to = %next, "Session transition");
    state.status = next;
    Ok(())
}

async fn await_init_frame(
    id: SessionId,
    rx: &mut mpsc::Receiver<StreamMessage>,
    startup_timeout: Duration,
) -> BackendResult<()> {
    let deadline = Instant::now() + startup_timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) => {
                return Err(BackendError::StartupTimeout {
                    timeout_ms: u64::try_from(startup_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Ok(None) => {
                return Err(BackendError::ProcessExited {
                    id,
                    detail: "output closed before handshake".to_string(),
                })
            }
            Ok(Some(msg)) if msg.message_type == MessageType::System => return Ok(()),
            Ok(Some(msg)) if msg.is_fatal() => {
                return Err(BackendError::ProcessExited {
                    id,
                    detail: msg.content,
                })
            }
            Ok(Some(msg)) => {
                tracing::debug!(session_id = %id, kind = %msg.message_type, "Ignoring frame before handshake");
            }
        }
    }
}

/// Reader task: decode stdout lines into the session's event channel
async fn read_stdout(
    id: SessionId,
    stdout: ChildStdout,
    codec: FrameCodec,
    tx: mpsc::Sender<StreamMessage>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    cancel: CancellationToken,
) {
    let mut frames = FrameReader::new(stdout, codec.max_frame_bytes());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.next_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Backend stdout read failed");
                break;
            }
        };

        for message in codec.decode_frame(id, &frame) {
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }

    let _ = transition(&lifecycle, id, SessionStatus::Dead);
    let last_stderr = stderr_tail
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .back()
        .cloned();
    let detail = match last_stderr {
        Some(line) => format!("backend process exited: {line}"),
        None => "backend process exited".to_string(),
    };
    tracing::warn!(session_id = %id, "Backend output closed");
    let _ = tx
        .send(StreamMessage::error(id, detail, ErrorCategory::Session, true))
        .await;
}
