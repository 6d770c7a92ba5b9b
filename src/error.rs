//! `AgSession` Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.
//!
//! Every backend failure maps onto one [`ErrorCategory`], which drives the
//! retry loop, the circuit breaker and session teardown.

use crate::fallback::ExecutionLevel;
use crate::infrastructure::stream::StreamMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for `AgSession`
#[derive(Error, Debug)]
pub enum AgSessionError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy used for retry and circuit-breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network/timeout-like failures on backend I/O
    Transient,
    /// The specific session is unusable and must be replaced
    Session,
    /// Invalid parameters, never retried
    Config,
    /// Rate limiting or backend-side overload
    Platform,
}

impl ErrorCategory {
    /// All categories, in metrics export order
    pub const ALL: [ErrorCategory; 4] = [
        ErrorCategory::Transient,
        ErrorCategory::Session,
        ErrorCategory::Config,
        ErrorCategory::Platform,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Session => "session",
            ErrorCategory::Config => "config",
            ErrorCategory::Platform => "platform",
        }
    }

    /// Parse a category from its wire name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(ErrorCategory::Transient),
            "session" => Some(ErrorCategory::Session),
            "config" => Some(ErrorCategory::Config),
            "platform" => Some(ErrorCategory::Platform),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ErrorCategory::Transient => 0,
            ErrorCategory::Session => 1,
            ErrorCategory::Config => 2,
            ErrorCategory::Platform => 3,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend session, streaming and resilience errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to spawn backend process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Session pool exhausted (max: {max}, current: {current})")]
    PoolExhausted { max: usize, current: usize },

    #[error("Request queue full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Session '{id}' not found")]
    SessionNotFound { id: Uuid },

    #[error("Session '{id}' is {status} and cannot accept input")]
    SessionUnavailable { id: Uuid, status: String },

    #[error("Session '{id}' is busy with another call")]
    SessionBusy { id: Uuid },

    #[error("Invalid session state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Backend handshake timed out after {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },

    #[error("Backend process for session '{id}' exited unexpectedly: {detail}")]
    ProcessExited { id: Uuid, detail: String },

    #[error("Failed to write to session '{id}': {reason}")]
    WriteFailed { id: Uuid, reason: String },

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Event stream for session '{id}' was already taken")]
    StreamTaken { id: Uuid },

    #[error("Call timed out after {timeout_ms}ms without backend output")]
    Timeout { timeout_ms: u64 },

    #[error("Backend rate limited: {0}")]
    RateLimited(String),

    #[error("Backend overloaded: {0}")]
    Overloaded(String),

    #[error("Backend reported error: {0}")]
    Reported(String),

    #[error("Invalid logical key: {0}")]
    InvalidKey(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Circuit breaker open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Call cancelled")]
    Cancelled,

    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

static RATE_LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(rate[ _-]?limit|too many requests|\b429\b|quota exceeded|usage limit)").unwrap()
});

static OVERLOAD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(overloaded|\b529\b|\b503\b|service unavailable|capacity)").unwrap()
});

impl BackendError {
    /// Category of this error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            BackendError::SpawnFailed { .. }
            | BackendError::SessionBusy { .. }
            | BackendError::StartupTimeout { .. }
            | BackendError::Timeout { .. }
            | BackendError::Reported(_)
            | BackendError::Cancelled
            | BackendError::Io(_) => ErrorCategory::Transient,

            BackendError::SessionNotFound { .. }
            | BackendError::SessionUnavailable { .. }
            | BackendError::InvalidTransition { .. }
            | BackendError::ProcessExited { .. }
            | BackendError::WriteFailed { .. }
            | BackendError::Decode(_)
            | BackendError::StreamTaken { .. } => ErrorCategory::Session,

            BackendError::InvalidKey(_)
            | BackendError::InvalidMessage(_)
            | BackendError::InvalidConfig(_) => ErrorCategory::Config,

            BackendError::PoolExhausted { .. }
            | BackendError::QueueFull { .. }
            | BackendError::RateLimited(_)
            | BackendError::Overloaded(_)
            | BackendError::CircuitOpen { .. }
            | BackendError::Unavailable { .. } => ErrorCategory::Platform,
        }
    }

    /// Whether the circuit breaker should count this failure.
    ///
    /// Local backpressure (a full pool or queue, a busy session) says nothing
    /// about backend health and is never counted.
    #[must_use]
    pub fn counts_toward_breaker(&self) -> bool {
        if matches!(
            self,
            BackendError::Cancelled
                | BackendError::CircuitOpen { .. }
                | BackendError::PoolExhausted { .. }
                | BackendError::QueueFull { .. }
                | BackendError::SessionBusy { .. }
        ) {
            return false;
        }
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::Platform
        )
    }

    /// Whether this error can ever be retried, independent of policy
    #[must_use]
    pub fn is_retry_candidate(&self) -> bool {
        !matches!(
            self,
            BackendError::Cancelled
                | BackendError::CircuitOpen { .. }
                | BackendError::Unavailable { .. }
        )
    }

    /// Classify an error message reported by the backend itself
    #[must_use]
    pub fn from_backend_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if RATE_LIMIT_PATTERN.is_match(&message) {
            BackendError::RateLimited(message)
        } else if OVERLOAD_PATTERN.is_match(&message) {
            BackendError::Overloaded(message)
        } else {
            BackendError::Reported(message)
        }
    }

    /// Rebuild an error from a fatal `error` stream message
    #[must_use]
    pub fn from_error_message(message: &StreamMessage) -> Self {
        match message.error_category() {
            Some(ErrorCategory::Session) => BackendError::ProcessExited {
                id: message.session_id,
                detail: message.content.clone(),
            },
            Some(ErrorCategory::Config) => BackendError::InvalidMessage(message.content.clone()),
            Some(ErrorCategory::Transient) if message.is_timeout() => BackendError::Timeout {
                timeout_ms: message.data_u64("timeout_ms").unwrap_or_default(),
            },
            _ => BackendError::from_backend_message(message.content.clone()),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Failure of a top-level execution, with everything streamed before it
#[derive(Error, Debug)]
#[error("{source} (level: {level}, partial messages: {})", partial.len())]
pub struct ExecuteError {
    /// The error that ended the execution
    #[source]
    pub source: BackendError,
    /// Execution level that was being attempted when the error surfaced
    pub level: ExecutionLevel,
    /// Messages already produced before the failure
    pub partial: Vec<StreamMessage>,
}

impl ExecuteError {
    #[must_use]
    pub fn new(source: BackendError, level: ExecutionLevel) -> Self {
        Self {
            source,
            level,
            partial: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_partial(mut self, partial: Vec<StreamMessage>) -> Self {
        self.partial = partial;
        self
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.source.category()
    }
}

/// Result type alias for `AgSession` operations
pub type Result<T> = std::result::Result<T, AgSessionError>;

/// Result type alias for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Result type alias for Config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
