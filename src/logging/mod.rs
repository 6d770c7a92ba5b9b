//! Logging system initialization and configuration
//!
//! Uses the tracing ecosystem for structured logging with support for:
//! - Environment variable override (AGSESSION_LOG)
//! - Console output in pretty, compact or JSON form
//! - File output with daily rotation
//! - In-memory log buffer, filterable by session

pub mod layers;

pub use layers::{LogBuffer, LogEntry};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use layers::LogBufferLayer;

/// Environment variable overriding the configured filter
pub const LOG_ENV: &str = "AGSESSION_LOG";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for the `agsession` target
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    /// Show file and line numbers
    pub file_line: bool,
    /// Also write a daily-rotated log file
    pub file_output: bool,
    /// Log file directory; defaults to the platform data dir
    pub file_path: Option<PathBuf>,
    /// Entries kept by the in-memory buffer
    pub buffer_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            file_line: false,
            file_output: false,
            file_path: None,
            buffer_size: 500,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    /// Lenient parse; unknown names fall back to `Pretty`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Get the default log directory path
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agsession")
        .join("logs")
}

static LOG_BUFFER: OnceCell<LogBuffer> = OnceCell::new();

/// Initialize the logging system
///
/// Returns a `LogBuffer` handle for reading recent entries. Only the first
/// call installs a subscriber; later calls return the same buffer. If the
/// host application already installed a global subscriber, ours is skipped
/// and the buffer stays empty.
///
/// # Environment Variables
/// - `AGSESSION_LOG`: Override the filter (e.g., "agsession=debug,agsession::resilience=trace")
pub fn init_logging(config: &LoggingConfig) -> LogBuffer {
    LOG_BUFFER.get_or_init(|| install(config)).clone()
}

fn install(config: &LoggingConfig) -> LogBuffer {
    let level = parse_level(&config.level);
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("agsession={}", level.as_str().to_lowercase())));

    let console_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .boxed(),
        LogFormat::Compact if config.timestamps => fmt::layer()
            .compact()
            .with_target(true)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .without_time()
            .with_target(true)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .boxed(),
        LogFormat::Pretty if config.timestamps => fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .with_ansi(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .without_time()
            .with_target(true)
            .with_level(true)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .with_ansi(true)
            .boxed(),
    };

    let file_layer = if config.file_output {
        let log_dir = config.file_path.clone().unwrap_or_else(default_log_dir);

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: Failed to create log directory {:?}: {}", log_dir, e);
            None
        } else {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "agsession.log");

            let file_layer = fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE);

            Some(file_layer.boxed())
        }
    } else {
        None
    };

    let (log_buffer_layer, log_buffer) = LogBufferLayer::new(config.buffer_size);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(log_buffer_layer)
        .try_init();

    match installed {
        Ok(()) => {
            tracing::info!("Logging initialized");
            tracing::debug!(
                level = %level,
                format = ?config.format,
                file_output = config.file_output,
                "Logging configuration"
            );
        }
        Err(e) => eprintln!("Warning: global tracing subscriber already set: {}", e),
    }

    log_buffer
}

/// Parse log level from string
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("unknown"), LogFormat::Pretty);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("info"), Level::INFO);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }

    #[test]
    fn test_config_from_toml() {
        let config: LoggingConfig = toml::from_str("format = \"json\"\nlevel = \"debug\"").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "debug");
        assert!(config.timestamps);
        assert!(!config.file_output);
        assert_eq!(config.buffer_size, 500);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            format: LogFormat::Compact,
            ..Default::default()
        };
        let first = init_logging(&config);
        let second = init_logging(&LoggingConfig::default());
        tracing::info!(session_id = "idempotent", "after init");
        assert_eq!(first.len(), second.len());
    }
}
