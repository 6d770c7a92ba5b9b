//! Custom tracing subscriber layers
//!
//! Provides the in-memory log buffer used for operational inspection of
//! recent pool activity, filterable by session.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::span::{Attributes, Id};
use tracing::{field::Visit, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Field name used to tag events with their session
pub const SESSION_FIELD: &str = "session_id";

/// A log entry stored in the buffer
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Target module path
    pub target: String,
    pub message: String,
    /// Event fields followed by the fields of enclosing spans
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    pub fn level_str(&self) -> &'static str {
        match self.level {
            Level::TRACE => "TRACE",
            Level::DEBUG => "DEBUG",
            Level::INFO => "INFO",
            Level::WARN => "WARN",
            Level::ERROR => "ERROR",
        }
    }

    /// Value of the first field called `name`
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.field(SESSION_FIELD)
    }
}

/// Visitor to extract message and fields from tracing events
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let value_str = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(value_str);
        } else {
            self.fields.push((field.name().to_string(), value_str));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.push((field.name().to_string(), value.to_string()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.push((field.name().to_string(), value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.push((field.name().to_string(), value.to_string()));
    }
}

/// Fields captured when a span is created
struct SpanFields(Vec<(String, String)>);

type Entries = Arc<Mutex<VecDeque<LogEntry>>>;

fn lock(buffer: &Entries) -> MutexGuard<'_, VecDeque<LogEntry>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ring-buffer layer keeping the most recent log entries
pub struct LogBufferLayer {
    buffer: Entries,
    max_size: usize,
}

impl LogBufferLayer {
    /// Create a new log buffer layer with the specified maximum size
    pub fn new(max_size: usize) -> (Self, LogBuffer) {
        let max_size = max_size.max(1);
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(max_size)));
        let handle = LogBuffer {
            buffer: Arc::clone(&buffer),
        };
        let layer = Self { buffer, max_size };
        (layer, handle)
    }
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields(visitor.fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut fields = visitor.fields;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(span_fields) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.0.iter().cloned());
                }
            }
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
        };

        let mut buffer = lock(&self.buffer);
        if buffer.len() >= self.max_size {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }
}

/// Handle to read from the log buffer
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Entries,
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("entries", &self.len())
            .finish()
    }
}

impl LogBuffer {
    /// Get a snapshot of the current log entries
    pub fn get_entries(&self) -> Vec<LogEntry> {
        lock(&self.buffer).iter().cloned().collect()
    }

    /// Get the most recent N entries
    pub fn get_recent(&self, count: usize) -> Vec<LogEntry> {
        let guard = lock(&self.buffer);
        let skip = guard.len().saturating_sub(count);
        guard.iter().skip(skip).cloned().collect()
    }

    /// Entries at `min_level` or more severe
    pub fn filter_by_level(&self, min_level: Level) -> Vec<LogEntry> {
        lock(&self.buffer)
            .iter()
            .filter(|e| e.level <= min_level)
            .cloned()
            .collect()
    }

    /// Entries tagged with `session_id`, directly or through a span
    pub fn for_session(&self, session_id: &str) -> Vec<LogEntry> {
        lock(&self.buffer)
            .iter()
            .filter(|e| {
                e.fields
                    .iter()
                    .any(|(key, value)| key == SESSION_FIELD && value == session_id)
            })
            .cloned()
            .collect()
    }

    /// Search entries by message content
    pub fn search(&self, query: &str) -> Vec<LogEntry> {
        let query_lower = query.to_lowercase();
        lock(&self.buffer)
            .iter()
            .filter(|e| {
                e.message.to_lowercase().contains(&query_lower)
                    || e.target.to_lowercase().contains(&query_lower)
            })
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.buffer).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture<F: FnOnce()>(max_size: usize, f: F) -> LogBuffer {
        let (layer, buffer) = LogBufferLayer::new(max_size);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);
        buffer
    }

    #[test]
    fn test_records_message_and_fields() {
        let buffer = capture(10, || {
            tracing::info!(attempt = 2u64, ok = true, "Retrying after backoff");
        });
        let entries = buffer.get_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "Retrying after backoff");
        assert_eq!(entries[0].level_str(), "INFO");
        assert_eq!(entries[0].field("attempt"), Some("2"));
        assert_eq!(entries[0].field("ok"), Some("true"));
    }

    #[test]
    fn test_ring_buffer_keeps_most_recent() {
        let buffer = capture(5, || {
            for i in 0..10 {
                tracing::info!("message {}", i);
            }
        });
        assert_eq!(buffer.len(), 5);
        let entries = buffer.get_entries();
        assert_eq!(entries[0].message, "message 5");
        assert_eq!(entries[4].message, "message 9");

        let recent = buffer.get_recent(2);
        assert_eq!(recent[0].message, "message 8");

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_filter_by_session_including_span_fields() {
        let buffer = capture(10, || {
            tracing::info!(session_id = "a", "direct");
            tracing::info!(session_id = "b", "other");
            let span = tracing::info_span!("call", session_id = "a");
            let _entered = span.enter();
            tracing::warn!("inside span");
        });

        let entries = buffer.for_session("a");
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["direct", "inside span"]);
        assert_eq!(entries[1].session_id(), Some("a"));
    }

    #[test]
    fn test_level_filter_and_search() {
        let buffer = capture(10, || {
            tracing::debug!("Session added to pool");
            tracing::error!("Backend process exited");
        });
        assert_eq!(buffer.filter_by_level(Level::WARN).len(), 1);
        assert_eq!(buffer.search("POOL").len(), 1);
        // Target matches too
        assert_eq!(buffer.search("agsession").len(), 2);
    }
}
