//! Frame Codec
//!
//! One JSON object per line in both directions. Outgoing messages are
//! rendered as backend envelopes; incoming lines are normalized into
//! [`StreamMessage`]s whether the backend speaks the canonical event names
//! or the Claude CLI `stream-json` envelopes.

use super::{MessageType, StreamMessage};
use crate::error::{BackendError, BackendResult, ErrorCategory};
use crate::infrastructure::session::SessionId;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use uuid::Uuid;

/// Default upper bound for a single frame (4 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Encoder/decoder for line-delimited JSON frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode a message as a single newline-terminated frame
    pub fn encode(&self, message: &StreamMessage) -> BackendResult<String> {
        let frame = match message.message_type {
            MessageType::UserInput => user_envelope(message, None),
            MessageType::FeedbackInjection => user_envelope(message, Some("feedback")),
            MessageType::Cancel => json!({
                "type": "control_request",
                "request_id": format!("cancel-{}", Uuid::new_v4()),
                "request": { "subtype": "interrupt" },
            }),
            _ => serde_json::to_value(message)
                .map_err(|e| BackendError::InvalidMessage(e.to_string()))?,
        };

        let mut line = serde_json::to_string(&frame)
            .map_err(|e| BackendError::InvalidMessage(e.to_string()))?;
        if line.len() > self.max_frame_bytes {
            return Err(BackendError::InvalidMessage(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                line.len(),
                self.max_frame_bytes
            )));
        }
        line.push('\n');
        Ok(line)
    }

    /// Decode one raw frame, reporting failures in-band.
    ///
    /// Anything that cannot be decoded becomes a single non-fatal
    /// session-category `error` message so the event sequence keeps going.
    pub fn decode_frame(&self, session_id: SessionId, frame: &RawFrame) -> Vec<StreamMessage> {
        let decoded = match frame {
            RawFrame::Line(bytes) => self.decode_bytes(session_id, bytes),
            RawFrame::Oversized(len) => Err(BackendError::Decode(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                len, self.max_frame_bytes
            ))),
        };
        match decoded {
            Ok(messages) => messages,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Undecodable backend frame");
                vec![StreamMessage::error(session_id, e.to_string(), ErrorCategory::Session, false)]
            }
        }
    }

    /// Decode one line of raw backend output
    pub fn decode_bytes(&self, session_id: SessionId, line: &[u8]) -> BackendResult<Vec<StreamMessage>> {
        let line = std::str::from_utf8(line)
            .map_err(|e| BackendError::Decode(format!("frame is not valid UTF-8: {e}")))?;
        self.decode(session_id, line)
    }

    /// Decode one line of backend output.
    ///
    /// A single line may carry several events (an `assistant` envelope with
    /// multiple content blocks), and some lines carry none (blank lines,
    /// partial tool input deltas).
    pub fn decode(&self, session_id: SessionId, line: &str) -> BackendResult<Vec<StreamMessage>> {
        if line.len() > self.max_frame_bytes {
            return Err(BackendError::Decode(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                line.len(),
                self.max_frame_bytes
            )));
        }

        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let value: Value = serde_json::from_str(line)
            .map_err(|e| BackendError::Decode(format!("invalid JSON frame: {e}")))?;
        let Value::Object(frame) = value else {
            return Err(BackendError::Decode("frame is not a JSON object".to_string()));
        };
        let Some(frame_type) = frame.get("type").and_then(Value::as_str) else {
            return Err(BackendError::Decode("frame has no type".to_string()));
        };

        let out = FrameBuilder { session_id };
        let messages = match frame_type {
            "thinking" => vec![out.message(
                MessageType::Thinking,
                text_field(&frame, &["content", "thinking", "text"]),
            )],
            "content_delta" | "text" => vec![out.message(
                MessageType::ContentDelta,
                text_field(&frame, &["content", "text", "delta"]),
            )],
            "tool_use" => vec![out
                .message(MessageType::ToolUse, text_field(&frame, &["name", "content"]))
                .with_data(Value::Object(frame.clone()))],
            "tool_result" => vec![out
                .message(MessageType::ToolResult, text_field(&frame, &["content", "output"]))
                .with_data(Value::Object(frame.clone()))],
            "result" => vec![decode_result(&out, &frame)],
            "error" => vec![decode_error(&out, &frame)],
            "assistant" => decode_assistant(&out, &frame),
            "user" => decode_user(&out, &frame),
            "stream_event" => decode_stream_event(&out, &frame),
            _ => vec![out
                .message(MessageType::System, text_field(&frame, &["subtype", "content"]))
                .with_data(Value::Object(frame.clone()))],
        };

        Ok(messages)
    }
}

struct FrameBuilder {
    session_id: SessionId,
}

impl FrameBuilder {
    fn message(&self, message_type: MessageType, content: String) -> StreamMessage {
        StreamMessage {
            message_type,
            session_id: self.session_id,
            content,
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }
}

fn user_envelope(message: &StreamMessage, kind: Option<&str>) -> Value {
    let mut frame = json!({
        "type": "user",
        "session_id": message.session_id,
        "message": { "role": "user", "content": message.content },
        "timestamp": message.timestamp,
    });

    let mut metadata = match &message.data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    };
    if let Some(kind) = kind {
        metadata.insert("kind".to_string(), Value::String(kind.to_string()));
    }
    if !metadata.is_empty() {
        frame["metadata"] = Value::Object(metadata);
    }
    frame
}

/// First present field among `keys`, rendered as text
fn text_field(frame: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| frame.get(*key))
        .map(value_text)
        .unwrap_or_default()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| item.as_str().map(str::to_string))
            })
            .collect::<Vec<_>>()
            .join(""),
        other => other.to_string(),
    }
}

fn decode_result(out: &FrameBuilder, frame: &Map<String, Value>) -> StreamMessage {
    let content = text_field(frame, &["result", "content"]);
    let is_error = frame.get("is_error").and_then(Value::as_bool).unwrap_or(false)
        || frame
            .get("subtype")
            .and_then(Value::as_str)
            .is_some_and(|s| s.starts_with("error"));

    if is_error {
        let content = if content.is_empty() {
            text_field(frame, &["subtype"])
        } else {
            content
        };
        let category = BackendError::from_backend_message(content.clone()).category();
        let mut data = frame.clone();
        data.insert("fatal".to_string(), Value::Bool(true));
        data.insert("category".to_string(), Value::String(category.as_str().to_string()));
        return out.message(MessageType::Error, content).with_data(Value::Object(data));
    }

    out.message(MessageType::Result, content)
        .with_data(Value::Object(frame.clone()))
}

fn decode_error(out: &FrameBuilder, frame: &Map<String, Value>) -> StreamMessage {
    let content = match frame.get("error") {
        Some(Value::Object(err)) => text_field(err, &["message", "type"]),
        _ => text_field(frame, &["message", "error", "content"]),
    };
    let category = frame
        .get("category")
        .and_then(Value::as_str)
        .and_then(ErrorCategory::parse)
        .unwrap_or_else(|| BackendError::from_backend_message(content.clone()).category());
    let fatal = frame.get("fatal").and_then(Value::as_bool).unwrap_or(true);

    let mut data = frame.clone();
    data.insert("fatal".to_string(), Value::Bool(fatal));
    data.insert("category".to_string(), Value::String(category.as_str().to_string()));
    out.message(MessageType::Error, content)
        .with_data(Value::Object(data))
}

fn content_blocks(frame: &Map<String, Value>) -> Option<&Vec<Value>> {
    frame
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
}

fn decode_assistant(out: &FrameBuilder, frame: &Map<String, Value>) -> Vec<StreamMessage> {
    let Some(blocks) = content_blocks(frame) else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter_map(|block| {
            let kind = block.get("type").and_then(Value::as_str)?;
            let text = |key: &str| block.get(key).map(value_text).unwrap_or_default();
            match kind {
                "text" => Some(out.message(MessageType::ContentDelta, text("text"))),
                "thinking" => Some(out.message(MessageType::Thinking, text("thinking"))),
                "tool_use" => Some(
                    out.message(MessageType::ToolUse, text("name"))
                        .with_data(block.clone()),
                ),
                _ => None,
            }
        })
        .collect()
}

fn decode_user(out: &FrameBuilder, frame: &Map<String, Value>) -> Vec<StreamMessage> {
    let Some(blocks) = content_blocks(frame) else {
        // Echoed plain-text input
        return vec![out
            .message(MessageType::System, "user".to_string())
            .with_data(Value::Object(frame.clone()))];
    };

    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| {
            let content = block.get("content").map(value_text).unwrap_or_default();
            out.message(MessageType::ToolResult, content)
                .with_data(block.clone())
        })
        .collect()
}

fn decode_stream_event(out: &FrameBuilder, frame: &Map<String, Value>) -> Vec<StreamMessage> {
    let Some(event) = frame.get("event") else {
        return Vec::new();
    };
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return Vec::new();
    }
    let Some(delta) = event.get("delta") else {
        return Vec::new();
    };

    let text = |key: &str| delta.get(key).and_then(Value::as_str).map(str::to_string);
    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => text("text")
            .map(|t| vec![out.message(MessageType::ContentDelta, t)])
            .unwrap_or_default(),
        Some("thinking_delta") => text("thinking")
            .map(|t| vec![out.message(MessageType::Thinking, t)])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// One newline-delimited frame read from a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// Frame bytes without the trailing newline
    Line(Vec<u8>),
    /// A frame longer than the limit; its bytes were discarded
    Oversized(usize),
}

/// Splits backend output into frames without buffering more than
/// `max_frame_bytes` of any single frame.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame_bytes: usize,
    line: Vec<u8>,
    discarded: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame_bytes,
            line: Vec::new(),
            discarded: 0,
        }
    }

    /// Next frame, or `None` once the output is closed.
    ///
    /// Cancel safe: bytes of a frame interrupted mid-read are kept for the
    /// next call.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<RawFrame>> {
        loop {
            let (used, complete) = {
                let available = self.inner.fill_buf().await?;
                if available.is_empty() {
                    return Ok(self.take_frame(true));
                }
                let (chunk, used, complete) = match available.iter().position(|b| *b == b'\n') {
                    Some(i) => (&available[..i], i + 1, true),
                    None => (available, available.len(), false),
                };
                if self.discarded == 0 && self.line.len() + chunk.len() <= self.max_frame_bytes {
                    self.line.extend_from_slice(chunk);
                } else {
                    self.discarded += self.line.len() + chunk.len();
                    self.line = Vec::new();
                }
                (used, complete)
            };
            self.inner.consume(used);
            if complete {
                return Ok(self.take_frame(false));
            }
        }
    }

    fn take_frame(&mut self, at_eof: bool) -> Option<RawFrame> {
        let discarded = std::mem::take(&mut self.discarded);
        let line = std::mem::take(&mut self.line);
        if discarded > 0 {
            return Some(RawFrame::Oversized(discarded));
        }
        if at_eof && line.is_empty() {
            return None;
        }
        Some(RawFrame::Line(line))
    }
}
