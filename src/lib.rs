//! agsession Library
//!
//! Persistent AI-backend session pool:
//! - Deterministic session identity from logical keys
//! - Bounded pool of long-lived backend processes with idle eviction
//! - Bidirectional line-delimited JSON streaming per session
//! - Retry with backoff, a pool-wide circuit breaker and health-driven fallback

pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod infrastructure;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod supervisor;

pub use config::{BackendConfig, BackendPreset, SupervisorConfig};
pub use error::{AgSessionError, BackendError, ConfigError, ErrorCategory, ExecuteError, Result};
pub use fallback::{select_level, ExecutionLevel, FallbackConfig, FallbackInputs, FallbackStrategy};
pub use health::{FixedMemoryProbe, HealthChecker, HealthReport, HealthStatus, MemoryProbe, ProcMemoryProbe};
pub use infrastructure::session::{
    resolve, HandshakeMode, PoolConfig, PoolEvent, Session, SessionConfig, SessionId, SessionManager,
    SessionMeta, SessionStatus,
};
pub use infrastructure::stream::{CallStream, EventStream, MessageType, StreamMessage};
pub use metrics::{Metrics, MetricsSnapshot};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
pub use supervisor::{ExecutionOutput, ExecutionStream, Supervisor};
