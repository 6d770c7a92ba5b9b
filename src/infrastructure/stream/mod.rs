//! Bidirectional Streaming
//!
//! Message model, line-delimited frame codec and the per-session streamer.

pub mod codec;
pub mod streamer;

pub use codec::{FrameCodec, FrameReader, RawFrame};
pub use streamer::{CallStream, EventStream};

use crate::error::ErrorCategory;
use crate::infrastructure::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Type of a stream message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Write side
    UserInput,
    Cancel,
    FeedbackInjection,

    // Read side
    Thinking,
    ContentDelta,
    ToolUse,
    ToolResult,
    Result,
    Error,
    /// Handshake frames and anything the codec does not recognize
    System,
}

impl MessageType {
    /// Whether the message travels from caller to backend
    #[must_use]
    pub fn is_write_side(self) -> bool {
        matches!(
            self,
            MessageType::UserInput | MessageType::Cancel | MessageType::FeedbackInjection
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::UserInput => "user_input",
            MessageType::Cancel => "cancel",
            MessageType::FeedbackInjection => "feedback_injection",
            MessageType::Thinking => "thinking",
            MessageType::ContentDelta => "content_delta",
            MessageType::ToolUse => "tool_use",
            MessageType::ToolResult => "tool_result",
            MessageType::Result => "result",
            MessageType::Error => "error",
            MessageType::System => "system",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message exchanged with a backend session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub session_id: SessionId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamMessage {
    /// Create a message stamped with the current time
    #[must_use]
    pub fn new(message_type: MessageType, session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            message_type,
            session_id,
            content: content.into(),
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn user_input(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(MessageType::UserInput, session_id, content)
    }

    #[must_use]
    pub fn feedback(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(MessageType::FeedbackInjection, session_id, content)
    }

    #[must_use]
    pub fn cancel(session_id: SessionId) -> Self {
        Self::new(MessageType::Cancel, session_id, "")
    }

    /// Build an `error` message carrying its category and fatality
    #[must_use]
    pub fn error(
        session_id: SessionId,
        content: impl Into<String>,
        category: ErrorCategory,
        fatal: bool,
    ) -> Self {
        Self::new(MessageType::Error, session_id, content).with_data(json!({
            "fatal": fatal,
            "category": category.as_str(),
        }))
    }

    /// Fatal transient error emitted when a call sees no output in time
    #[must_use]
    pub fn timeout(session_id: SessionId, timeout_ms: u64) -> Self {
        Self::new(
            MessageType::Error,
            session_id,
            format!("no backend output for {timeout_ms}ms"),
        )
        .with_data(json!({
            "fatal": true,
            "category": ErrorCategory::Transient.as_str(),
            "kind": "timeout",
            "timeout_ms": timeout_ms,
        }))
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Whether this is an `error` message that ended the call
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.message_type == MessageType::Error
            && self.data.get("fatal").and_then(Value::as_bool).unwrap_or(true)
    }

    /// Whether this message ends the current call
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.message_type == MessageType::Result || self.is_fatal()
    }

    /// Error category attached to an `error` message
    #[must_use]
    pub fn error_category(&self) -> Option<ErrorCategory> {
        if self.message_type != MessageType::Error {
            return None;
        }
        self.data
            .get("category")
            .and_then(Value::as_str)
            .and_then(ErrorCategory::parse)
    }

    pub(crate) fn is_timeout(&self) -> bool {
        self.data.get("kind").and_then(Value::as_str) == Some("timeout")
    }

    pub(crate) fn data_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }
}
