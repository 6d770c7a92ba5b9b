//! Retry and circuit breaking around backend calls

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::RetryPolicy;
