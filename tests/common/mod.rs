//! Shared fixtures: fake backends as POSIX shell scripts

#![allow(dead_code)]

use agsession::{HandshakeMode, SessionConfig, SupervisorConfig};
use std::time::Duration;

/// Answers every line with one delta and a result; honours interrupts
pub const ECHO_BACKEND: &str = r#"while IFS= read -r line; do
  case "$line" in
    *interrupt*) echo '{"type":"result","result":"interrupted"}' ;;
    *) echo '{"type":"content_delta","content":"pong"}'; echo '{"type":"result","result":"done"}' ;;
  esac
done"#;

/// Takes half a second to come up, then announces itself with an init frame
pub const SLOW_INIT_BACKEND: &str = r#"sleep 0.5
echo '{"type":"system","subtype":"init"}'
while IFS= read -r line; do
  echo '{"type":"content_delta","content":"warm"}'
  echo '{"type":"result","result":"done"}'
done"#;

/// Exits mid-call when asked to crash
pub const CRASHING_BACKEND: &str = r#"while IFS= read -r line; do
  case "$line" in
    *crash*) echo '{"type":"content_delta","content":"partial"}'; exit 3 ;;
    *) echo '{"type":"content_delta","content":"ok"}'; echo '{"type":"result","result":"done"}' ;;
  esac
done"#;

/// Streams one delta and then waits until interrupted
pub const STALLING_BACKEND: &str = r#"while IFS= read -r line; do
  case "$line" in
    *interrupt*) echo '{"type":"result","result":"stopped"}' ;;
    *) echo '{"type":"content_delta","content":"working"}' ;;
  esac
done"#;

/// Every call ends with an overload error
pub const OVERLOADED_BACKEND: &str = r#"while IFS= read -r line; do
  echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"API overloaded"}'
done"#;

/// Serves a single call, then exits
pub const SINGLE_CALL_BACKEND: &str = r#"IFS= read -r line
echo '{"type":"content_delta","content":"once"}'
echo '{"type":"result","result":"done"}'"#;

/// The first process streams a delta and crashes mid-call; every later
/// process exits silently with a failure. `$MARKER` names the flag file.
pub const CRASH_THEN_SILENT_BACKEND: &str = r#"if [ -e "$MARKER" ]; then exit 1; fi
touch "$MARKER"
while IFS= read -r line; do
  echo '{"type":"content_delta","content":"partial"}'
  exit 3
done"#;

pub fn backend(script: &str) -> SessionConfig {
    SessionConfig::new("sh")
        .args(["-c", script])
        .call_timeout(Duration::from_secs(5))
}

pub fn slow_init_backend() -> SessionConfig {
    backend(SLOW_INIT_BACKEND).handshake(HandshakeMode::InitFrame)
}

/// Supervisor settings with millisecond backoff so failure paths stay fast
pub fn fast_config() -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(40);
    config.pool.graceful_shutdown_timeout = Duration::from_millis(500);
    config.pool.force_kill_timeout = Duration::from_millis(500);
    config
}
