//! Backend process plumbing: spawn with piped stdio, staged shutdown and
//! one-shot runs.

use super::registry::SessionId;
use super::session::SessionConfig;
use crate::error::{BackendError, BackendResult};
use crate::infrastructure::stream::{FrameCodec, FrameReader, RawFrame, StreamMessage};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

/// Longest stderr line kept verbatim
const MAX_STDERR_LINE_BYTES: usize = 64 * 1024;

/// A spawned backend with its pipes taken out
pub(crate) struct BackendProcess {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
    pub(crate) pid: Option<u32>,
}

/// How a backend process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited on its own after stdin closed
    Graceful,
    /// Had to be killed
    Killed,
    /// Kill was sent but the process did not exit in time
    Unresponsive,
    /// No process left to stop
    AlreadyStopped,
}

/// Spawn the backend described by `config`.
///
/// The session flag is rendered only when `session_id` is given, which is how
/// one-shot runs differ from persistent sessions.
pub(crate) fn spawn_backend(
    config: &SessionConfig,
    session_id: Option<SessionId>,
) -> BackendResult<BackendProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(config.command_args(session_id))
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| BackendError::SpawnFailed {
        reason: format!("{}: {e}", config.command),
    })?;

    let missing = |pipe: &str| BackendError::SpawnFailed {
        reason: format!("{pipe} was not captured"),
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    let pid = child.id();

    Ok(BackendProcess {
        child,
        stdin,
        stdout,
        stderr,
        pid,
    })
}

/// Wait for the child to exit, force-killing it after `graceful`.
///
/// Callers close stdin first; that is the graceful termination signal.
pub(crate) async fn shutdown_child(
    mut child: Child,
    graceful: Duration,
    force: Duration,
) -> ShutdownOutcome {
    match tokio::time::timeout(graceful, child.wait()).await {
        Ok(Ok(_)) => return ShutdownOutcome::Graceful,
        Ok(Err(e)) => tracing::debug!(error = %e, "Waiting for backend exit failed"),
        Err(_) => tracing::debug!(?graceful, "Backend ignored stdin close, killing"),
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Backend kill failed");
        return ShutdownOutcome::AlreadyStopped;
    }
    match tokio::time::timeout(force, child.wait()).await {
        Ok(_) => ShutdownOutcome::Killed,
        Err(_) => {
            tracing::warn!(pid = ?child.id(), "Backend did not exit after kill");
            ShutdownOutcome::Unresponsive
        }
    }
}

/// Keep the last `limit` non-empty stderr lines until the pipe closes
pub(crate) async fn drain_stderr(
    id: SessionId,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
    cancel: CancellationToken,
) {
    let mut frames = FrameReader::new(stderr, MAX_STDERR_LINE_BYTES);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.next_frame() => frame,
        };
        let line = match frame {
            Ok(Some(RawFrame::Line(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Some(RawFrame::Oversized(len))) => format!("<{len} bytes of stderr omitted>"),
            Ok(None) | Err(_) => return,
        };
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!(session_id = %id, stderr = %line, "Backend stderr");

        if limit == 0 {
            continue;
        }
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() >= limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Result of a one-shot run; `messages` holds everything produced even on failure
#[derive(Debug)]
pub struct OneShotRun {
    pub messages: Vec<StreamMessage>,
    pub error: Option<BackendError>,
}

/// Limits applied to a one-shot run
#[derive(Debug, Clone, Copy)]
pub(crate) struct OneShotOptions {
    pub(crate) max_frame_bytes: usize,
    pub(crate) graceful_shutdown_timeout: Duration,
    pub(crate) force_kill_timeout: Duration,
}

/// Spawn a fresh backend for a single exchange and tear it down afterwards
pub(crate) async fn run_one_shot(
    id: SessionId,
    config: &SessionConfig,
    input: &str,
    options: OneShotOptions,
    cancel: &CancellationToken,
) -> OneShotRun {
    let mut messages = Vec::new();
    let error = match one_shot_exchange(id, config, input, options, cancel, &mut messages).await {
        Ok(()) => None,
        Err(e) => Some(e),
    };
    OneShotRun { messages, error }
}

async fn one_shot_exchange(
    id: SessionId,
    config: &SessionConfig,
    input: &str,
    options: OneShotOptions,
    cancel: &CancellationToken,
    messages: &mut Vec<StreamMessage>,
) -> BackendResult<()> {
    config.validate()?;
    let codec = FrameCodec::new(options.max_frame_bytes);
    let frame = codec.encode(&StreamMessage::user_input(id, input))?;

    let BackendProcess {
        child,
        mut stdin,
        stdout,
        stderr,
        pid,
    } = spawn_backend(config, None)?;
    tracing::debug!(session_id = %id, ?pid, "One-shot backend spawned");

    let tail = Arc::new(Mutex::new(VecDeque::new()));
    let drain_cancel = CancellationToken::new();
    tokio::spawn(drain_stderr(id, stderr, Arc::clone(&tail), 20, drain_cancel.clone()));

    let written = async {
        stdin.write_all(frame.as_bytes()).await?;
        stdin.flush().await
    }
    .await;
    drop(stdin);

    let result = match written {
        Err(e) => Err(BackendError::WriteFailed {
            id,
            reason: e.to_string(),
        }),
        Ok(()) => collect_until_terminal(id, stdout, codec, config.call_timeout, cancel, messages).await,
    };

    let mut child = child;
    let clean_exit = match &result {
        Ok(false) => matches!(
            tokio::time::timeout(options.graceful_shutdown_timeout, child.wait()).await,
            Ok(Ok(status)) if status.success()
        ),
        _ => false,
    };
    shutdown_child(
        child,
        options.graceful_shutdown_timeout,
        options.force_kill_timeout,
    )
    .await;
    drain_cancel.cancel();

    match result {
        Ok(true) => Ok(()),
        Ok(false) if clean_exit => Ok(()),
        Ok(false) => {
            let last = tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .back()
                .cloned();
            let detail = match last {
                Some(line) => format!("one-shot backend ended without a result: {line}"),
                None => "one-shot backend ended without a result".to_string(),
            };
            Err(BackendError::ProcessExited { id, detail })
        }
        Err(e) => Err(e),
    }
}

/// Collect frames until a terminal one (`Ok(true)`) or EOF (`Ok(false)`)
async fn collect_until_terminal(
    id: SessionId,
    stdout: ChildStdout,
    codec: FrameCodec,
    call_timeout: Duration,
    cancel: &CancellationToken,
    messages: &mut Vec<StreamMessage>,
) -> BackendResult<bool> {
    let mut frames = FrameReader::new(stdout, codec.max_frame_bytes());
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            frame = tokio::time::timeout(call_timeout, frames.next_frame()) => frame,
        };
        let frame = match frame {
            Err(_) => {
                return Err(BackendError::Timeout {
                    timeout_ms: u64::try_from(call_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Ok(false),
            Ok(Err(e)) => return Err(BackendError::Io(e)),
        };

        for message in codec.decode_frame(id, &frame) {
            let terminal = message.is_terminal();
            let failure = message.is_fatal().then(|| BackendError::from_error_message(&message));
            messages.push(message);
            if let Some(err) = failure {
                return Err(err);
            }
            if terminal {
                return Ok(true);
            }
        }
    }
}
