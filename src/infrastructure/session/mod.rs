//! Backend Session Management
//!
//! Session identity, backend process lifecycle and the bounded session pool.

pub mod pool;
pub mod process;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use pool::{PoolConfig, PoolEvent, SessionManager};
pub use process::{OneShotRun, ShutdownOutcome};
pub use registry::{conversation_key, pr_key, resolve, resolve_in, SessionId, SESSION_NAMESPACE};
pub use session::{
    BackendFlags, HandshakeMode, Session, SessionConfig, SessionMeta, SessionStatus, SpawnOptions,
};
