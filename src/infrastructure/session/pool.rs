//! Session Pool Management
//!
//! Owns the bounded pool of backend sessions: create-or-reuse, idle eviction,
//! forced termination, enumeration and lifecycle events.

use super::registry::SessionId;
use super::session::{Session, SessionConfig, SessionMeta, SessionStatus, SpawnOptions};
use crate::config::duration_ms;
use crate::error::{BackendError, BackendResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for the session pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Sessions idle longer than this are evicted by maintenance
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Maximum number of in-flight requests
    pub queue_size: usize,
    #[serde(rename = "startup_timeout_ms", with = "duration_ms")]
    pub startup_timeout: Duration,
    #[serde(rename = "graceful_shutdown_timeout_ms", with = "duration_ms")]
    pub graceful_shutdown_timeout: Duration,
    #[serde(rename = "force_kill_timeout_ms", with = "duration_ms")]
    pub force_kill_timeout: Duration,
    #[serde(rename = "maintenance_interval_ms", with = "duration_ms")]
    pub maintenance_interval: Duration,
    /// Largest accepted frame in either direction
    pub max_frame_bytes: usize,
    /// Stderr lines kept per session for diagnostics
    pub stderr_tail_lines: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let spawn = SpawnOptions::default();
        Self {
            max_sessions: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            queue_size: 100,
            startup_timeout: spawn.startup_timeout,
            graceful_shutdown_timeout: spawn.graceful_shutdown_timeout,
            force_kill_timeout: spawn.force_kill_timeout,
            maintenance_interval: Duration::from_secs(60),
            max_frame_bytes: spawn.max_frame_bytes,
            stderr_tail_lines: spawn.stderr_tail_lines,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            startup_timeout: self.startup_timeout,
            graceful_shutdown_timeout: self.graceful_shutdown_timeout,
            force_kill_timeout: self.force_kill_timeout,
            max_frame_bytes: self.max_frame_bytes,
            stderr_tail_lines: self.stderr_tail_lines,
        }
    }
}

/// Session lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Started { id: SessionId, pid: Option<u32> },
    Terminated { id: SessionId, reason: String },
    Evicted { id: SessionId, idle_ms: u64 },
    Died { id: SessionId },
}

enum Slot {
    /// A spawn is in flight; waiters are woken when it resolves
    Reserved(Arc<Notify>),
    Live(Arc<Session>),
}

enum Claim<'a> {
    Live(Arc<Session>),
    Wait(Arc<Notify>),
    Spawn(Reservation<'a>),
}

/// Releases an abandoned reservation
struct Reservation<'a> {
    slots: &'a Mutex<HashMap<SessionId, Slot>>,
    id: SessionId,
    notify: Arc<Notify>,
    armed: bool,
}

impl Reservation<'_> {
    fn publish(mut self, session: Arc<Session>) {
        lock(self.slots).insert(self.id, Slot::Live(session));
        self.armed = false;
        self.notify.notify_waiters();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = lock(self.slots);
        if matches!(slots.get(&self.id), Some(Slot::Reserved(n)) if Arc::ptr_eq(n, &self.notify)) {
            slots.remove(&self.id);
        }
        drop(slots);
        self.notify.notify_waiters();
    }
}

fn lock(slots: &Mutex<HashMap<SessionId, Slot>>) -> MutexGuard<'_, HashMap<SessionId, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded pool of backend sessions
pub struct SessionManager {
    config: PoolConfig,
    slots: Mutex<HashMap<SessionId, Slot>>,
    events: broadcast::Sender<PoolEvent>,
    sessions_created: AtomicU64,
}

impl SessionManager {
    /// Create a new pool with the given configuration
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            events,
            sessions_created: AtomicU64::new(0),
        }
    }

    /// Create a new pool with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Whether no further session can be spawned; reservations count
    #[must_use]
    pub fn is_full(&self) -> bool {
        lock(&self.slots).len() >= self.config.max_sessions
    }

    /// Total sessions spawned over the pool's lifetime
    #[must_use]
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    /// Live session for `id`, if any
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        match lock(&self.slots).get(id) {
            Some(Slot::Live(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Return the live session for `id`, spawning one if needed.
    ///
    /// A live session is touched and returned as the same `Arc`. A dead one is
    /// dropped and replaced. At capacity the call fails immediately with
    /// `PoolExhausted`; nothing is evicted to make room. Concurrent callers for
    /// an id that is still spawning wait for that spawn.
    pub async fn get_or_create_session(
        &self,
        id: SessionId,
        config: &SessionConfig,
    ) -> BackendResult<Arc<Session>> {
        loop {
            match self.claim(id)? {
                Claim::Live(session) => return Ok(session),
                // Another caller is spawning this id
                Claim::Wait(notify) => self.wait_for_spawn(id, notify).await,
                Claim::Spawn(reservation) => return self.spawn_reserved(reservation, config).await,
            }
        }
    }

    fn claim(&self, id: SessionId) -> BackendResult<Claim<'_>> {
        let mut slots = lock(&self.slots);
        let replacing_dead = match slots.get(&id) {
            Some(Slot::Live(session)) if session.is_alive() => {
                session.touch();
                return Ok(Claim::Live(Arc::clone(session)));
            }
            Some(Slot::Reserved(notify)) => return Ok(Claim::Wait(Arc::clone(notify))),
            Some(Slot::Live(_)) => true,
            None => false,
        };
        if replacing_dead {
            if let Some(Slot::Live(dead)) = slots.remove(&id) {
                tracing::debug!(session_id = %id, "Replacing dead session");
                self.emit(PoolEvent::Died { id });
                tokio::spawn(async move {
                    dead.shutdown().await;
                });
            }
        }

        if slots.len() >= self.config.max_sessions {
            return Err(BackendError::PoolExhausted {
                max: self.config.max_sessions,
                current: slots.len(),
            });
        }
        let notify = Arc::new(Notify::new());
        slots.insert(id, Slot::Reserved(Arc::clone(&notify)));
        Ok(Claim::Spawn(Reservation {
            slots: &self.slots,
            id,
            notify,
            armed: true,
        }))
    }

    async fn wait_for_spawn(&self, id: SessionId, notify: Arc<Notify>) {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let still_pending = matches!(
            lock(&self.slots).get(&id),
            Some(Slot::Reserved(n)) if Arc::ptr_eq(n, &notify)
        );
        if still_pending {
            notified.await;
        }
    }

    async fn spawn_reserved(
        &self,
        reservation: Reservation<'_>,
        config: &SessionConfig,
    ) -> BackendResult<Arc<Session>> {
        let id = reservation.id;
        let session = match Session::spawn(id, config.clone(), self.config.spawn_options()).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Failed to start backend session");
                return Err(e);
            }
        };

        reservation.publish(Arc::clone(&session));
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::Started {
            id,
            pid: session.pid(),
        });
        tracing::info!(session_id = %id, pool_size = self.session_count(), "Session added to pool");
        Ok(session)
    }

    /// Remove a session from the pool and stop its process
    pub async fn terminate_session(&self, id: &SessionId) -> BackendResult<()> {
        let removed = {
            let mut slots = lock(&self.slots);
            match slots.get(id) {
                Some(Slot::Live(_)) => slots.remove(id),
                _ => None,
            }
        };
        let Some(Slot::Live(session)) = removed else {
            return Err(BackendError::SessionNotFound { id: *id });
        };

        let outcome = session.shutdown().await;
        tracing::info!(session_id = %id, ?outcome, "Session terminated");
        self.emit(PoolEvent::Terminated {
            id: *id,
            reason: "requested".to_string(),
        });
        Ok(())
    }

    /// Snapshot of every live session
    #[must_use]
    pub fn list_active_sessions(&self) -> Vec<SessionMeta> {
        let sessions = self.live_sessions();
        sessions
            .iter()
            .filter(|s| s.is_alive())
            .map(|s| s.meta())
            .collect()
    }

    /// Snapshot of every pooled session, including dead ones not yet reaped
    #[must_use]
    pub fn list_all_sessions(&self) -> Vec<SessionMeta> {
        self.live_sessions().iter().map(|s| s.meta()).collect()
    }

    fn live_sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.slots)
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(session) => Some(Arc::clone(session)),
                Slot::Reserved(_) => None,
            })
            .collect()
    }

    /// Terminate every idle session whose last activity is strictly older
    /// than `idle_timeout`. Busy sessions are never evicted.
    pub async fn cleanup_idle_sessions(&self, idle_timeout: Duration) -> usize {
        let expired: Vec<(Arc<Session>, Duration)> = {
            let mut slots = lock(&self.slots);
            let ids: Vec<SessionId> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Live(s)
                        if s.status() == SessionStatus::Ready && s.idle_duration() > idle_timeout =>
                    {
                        Some(*id)
                    }
                    _ => None,
                })
                .collect();
            ids.into_iter()
                .filter_map(|id| match slots.remove(&id) {
                    Some(Slot::Live(s)) => {
                        let idle = s.idle_duration();
                        Some((s, idle))
                    }
                    _ => None,
                })
                .collect()
        };

        let count = expired.len();
        for (session, idle) in expired {
            let id = session.id();
            session.shutdown().await;
            tracing::info!(session_id = %id, ?idle, "Idle session evicted");
            self.emit(PoolEvent::Evicted {
                id,
                idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
            });
        }
        count
    }

    /// Drop sessions whose process has died and reap the processes
    pub async fn reap_dead_sessions(&self) -> usize {
        let dead: Vec<Arc<Session>> = {
            let mut slots = lock(&self.slots);
            let ids: Vec<SessionId> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Live(s) if !s.is_alive() => Some(*id),
                    _ => None,
                })
                .collect();
            ids.into_iter()
                .filter_map(|id| match slots.remove(&id) {
                    Some(Slot::Live(s)) => Some(s),
                    _ => None,
                })
                .collect()
        };

        let count = dead.len();
        for session in dead {
            session.shutdown().await;
            tracing::debug!(session_id = %session.id(), "Dead session reaped");
            self.emit(PoolEvent::Died { id: session.id() });
        }
        count
    }

    /// Terminate every session in the pool
    pub async fn terminate_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut slots = lock(&self.slots);
            let ids: Vec<SessionId> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| match slots.remove(&id) {
                    Some(Slot::Live(s)) => Some(s),
                    _ => None,
                })
                .collect()
        };

        let count = sessions.len();
        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;
        for session in &sessions {
            self.emit(PoolEvent::Terminated {
                id: session.id(),
                reason: "shutdown".to_string(),
            });
        }
        if count > 0 {
            tracing::info!(count, "All sessions terminated");
        }
        count
    }

    /// Periodically reap dead sessions and evict idle ones until `cancel` fires
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Session maintenance stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = manager.reap_dead_sessions().await;
                        let evicted = manager.cleanup_idle_sessions(idle_timeout).await;
                        if reaped + evicted > 0 {
                            tracing::debug!(reaped, evicted, "Session maintenance pass");
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("max_sessions", &self.config.max_sessions)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}
