//! Configuration management for agsession
//!
//! Layers, later ones winning key by key:
//! 1. Embedded default_config.toml (compile-time defaults)
//! 2. User config at ~/.config/agsession/config.toml (or platform-specific location)
//! 3. Project-local config at ./.agsession/config.toml
//! 4. The file named by `AGSESSION_CONFIG`

use crate::error::{ConfigError, ConfigResult};
use crate::fallback::FallbackConfig;
use crate::health::HealthConfig;
use crate::infrastructure::session::{PoolConfig, SessionConfig};
use crate::logging::LoggingConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration embedded in binary
const DEFAULT_CONFIG: &str = include_str!("../../default_config.toml");

/// Environment variable naming an extra config file
pub const CONFIG_ENV: &str = "AGSESSION_CONFIG";

/// `Duration` as integer milliseconds, for `*_ms` keys
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Known backend command-line conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreset {
    /// Plain command, no generated flags
    #[default]
    Generic,
    /// Claude CLI in stream-json mode
    Claude,
}

/// Default backend used when callers do not pass their own `SessionConfig`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub command: String,
    pub args: Vec<String>,
    pub preset: BackendPreset,
    pub model: Option<String>,
    pub working_dir: Option<String>,
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            preset: BackendPreset::Claude,
            model: None,
            working_dir: None,
            call_timeout: Duration::from_secs(300),
        }
    }
}

impl BackendConfig {
    /// Session configuration described by this section
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let mut config = match self.preset {
            BackendPreset::Claude => SessionConfig::claude(),
            BackendPreset::Generic => SessionConfig::new(self.command.as_str()),
        };
        config.command = self.command.clone();
        config = config.args(self.args.iter().cloned()).call_timeout(self.call_timeout);
        if let Some(model) = &self.model {
            config = config.model(model.as_str());
        }
        if let Some(dir) = &self.working_dir {
            config = config.working_dir(dir);
        }
        config
    }
}

// ============================================================================
// Configuration loading
// ============================================================================

impl SupervisorConfig {
    /// Load configuration through the full layer chain and validate it.
    ///
    /// Unreadable optional layers are logged and skipped; a file named by
    /// `AGSESSION_CONFIG` must exist.
    pub fn load() -> ConfigResult<Self> {
        let mut merged = Self::default_table()?;

        for path in [Self::user_config_path(), Self::project_config_path()]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                continue;
            }
            match Self::read_table(&path) {
                Ok(layer) => {
                    merge_tables(&mut merged, layer);
                    tracing::info!(path = %path.display(), "Loaded config layer");
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping config layer"),
            }
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
            merge_tables(&mut merged, Self::read_table(&path)?);
            tracing::info!(path = %path.display(), "Loaded config from {}", CONFIG_ENV);
        }

        Self::from_table(merged)
    }

    /// Load one file layered over the embedded defaults
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let mut merged = Self::default_table()?;
        merge_tables(&mut merged, Self::read_table(path)?);
        Self::from_table(merged)
    }

    /// Parse a TOML document layered over the embedded defaults
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let overlay: toml::Table = toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut merged = Self::default_table()?;
        merge_tables(&mut merged, overlay);
        Self::from_table(merged)
    }

    /// Get the user config path (~/.config/agsession/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|config_dir| config_dir.join("agsession").join("config.toml"))
    }

    /// Get the project-local config path (./.agsession/config.toml)
    pub fn project_config_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".agsession").join("config.toml"))
    }

    fn default_table() -> ConfigResult<toml::Table> {
        toml::from_str(DEFAULT_CONFIG)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse default config: {e}")))
    }

    fn read_table(path: &Path) -> ConfigResult<toml::Table> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn from_table(table: toml::Table) -> ConfigResult<Self> {
        let config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let pool = &self.pool;
        if pool.max_sessions == 0 {
            return invalid("pool.max_sessions must be at least 1");
        }
        if pool.queue_size == 0 {
            return invalid("pool.queue_size must be at least 1");
        }
        if pool.max_frame_bytes == 0 {
            return invalid("pool.max_frame_bytes must be at least 1");
        }
        if pool.startup_timeout.is_zero() || pool.maintenance_interval.is_zero() {
            return invalid("pool timeouts and intervals must be non-zero");
        }

        let retry = &self.retry;
        if retry.initial_delay > retry.max_delay {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if !(retry.backoff_factor >= 1.0 && retry.backoff_factor.is_finite()) {
            return invalid("retry.backoff_factor must be a finite number >= 1.0");
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return invalid("circuit_breaker thresholds must be at least 1");
        }

        let ratios = [
            ("fallback.thresholds.queue_depth_ratio", self.fallback.thresholds.queue_depth_ratio),
            ("fallback.thresholds.error_rate", self.fallback.thresholds.error_rate),
            ("fallback.thresholds.severe_error_rate", self.fallback.thresholds.severe_error_rate),
            ("health.queue_depth_ratio", self.health.queue_depth_ratio),
        ];
        for (name, value) in ratios {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        if self.fallback.thresholds.severe_error_rate < self.fallback.thresholds.error_rate {
            return invalid("fallback.thresholds.severe_error_rate must not be below error_rate");
        }
        if self.health.interval.is_zero() {
            return invalid("health.interval_ms must be non-zero");
        }

        if self.backend.command.trim().is_empty() {
            return invalid("backend.command must not be empty");
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}

/// Deep-merge `overlay` into `base`; nested tables merge, other values replace
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::session::HandshakeMode;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_embedded_default_config_is_valid() {
        let config = SupervisorConfig::from_toml_str("").unwrap();
        assert_eq!(config.pool.max_sessions, 10);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.health.interval, Duration::from_secs(30));
        assert!(config.fallback.enabled);
    }

    #[test]
    fn test_embedded_defaults_match_code_defaults() {
        let embedded = SupervisorConfig::from_toml_str("").unwrap();
        let code = SupervisorConfig::default();
        assert_eq!(embedded.pool, code.pool);
        assert_eq!(embedded.retry, code.retry);
        assert_eq!(embedded.circuit_breaker, code.circuit_breaker);
        assert_eq!(embedded.fallback, code.fallback);
        assert_eq!(embedded.health, code.health);
    }

    #[test]
    fn test_overlay_merges_nested_keys() {
        let config = SupervisorConfig::from_toml_str(
            r#"
            [pool]
            max_sessions = 3

            [fallback.thresholds]
            error_rate = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_sessions, 3);
        // Untouched siblings keep their defaults
        assert_eq!(config.pool.queue_size, 100);
        assert_eq!(config.fallback.thresholds.error_rate, 0.5);
        assert_eq!(config.fallback.thresholds.severe_error_rate, 0.6);
    }

    #[test]
    fn test_merge_tables_replaces_scalars_and_arrays() {
        let mut base: toml::Table = toml::from_str("a = 1\nlist = [1, 2]\n[t]\nx = 1\ny = 2").unwrap();
        let overlay: toml::Table = toml::from_str("list = [3]\n[t]\ny = 5").unwrap();
        merge_tables(&mut base, overlay);
        assert_eq!(base["a"].as_integer(), Some(1));
        assert_eq!(base["list"].as_array().map(Vec::len), Some(1));
        assert_eq!(base["t"]["x"].as_integer(), Some(1));
        assert_eq!(base["t"]["y"].as_integer(), Some(5));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            "[pool]\nmax_sessions = 0",
            "[retry]\ninitial_delay_ms = 5000\nmax_delay_ms = 1000",
            "[retry]\nbackoff_factor = 0.5",
            "[circuit_breaker]\nfailure_threshold = 0",
            "[fallback.thresholds]\nqueue_depth_ratio = 1.5",
            "[health]\nqueue_depth_ratio = 0.0",
            "[backend]\ncommand = \"  \"",
        ];
        for case in cases {
            assert!(
                matches!(SupervisorConfig::from_toml_str(case), Err(ConfigError::Invalid(_))),
                "accepted: {case}"
            );
        }
    }

    #[test]
    fn test_parse_error_reported() {
        assert!(matches!(
            SupervisorConfig::from_toml_str("[pool\n"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            SupervisorConfig::from_toml_str("[pool]\nmax_sessions = \"many\""),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[circuit_breaker]\nopen_timeout_ms = 1500").unwrap();
        let config = SupervisorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.circuit_breaker.open_timeout, Duration::from_millis(1500));

        let missing = SupervisorConfig::load_from_file(Path::new("/nonexistent/agsession.toml"));
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SupervisorConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("idle_timeout_ms = 1800000"));
        assert_eq!(SupervisorConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn test_backend_session_config() {
        let backend = BackendConfig {
            command: "/bin/cat".into(),
            preset: BackendPreset::Generic,
            working_dir: Some("~/work".into()),
            ..Default::default()
        };
        let session = backend.session_config();
        assert_eq!(session.command, "/bin/cat");
        assert_eq!(session.handshake, HandshakeMode::None);
        assert!(session.command_args(None).is_empty());
        assert!(!session.working_dir.unwrap().to_string_lossy().starts_with('~'));

        let claude = BackendConfig::default().session_config();
        assert_eq!(claude.handshake, HandshakeMode::InitFrame);
        assert!(claude.command_args(None).contains(&"stream-json".to_string()));
    }
}
