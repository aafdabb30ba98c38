//! # Relay Registry
//!
//! Process-wide table of live sessions. It is the only state shared between
//! sessions and is used for three things:
//!
//! 1. **Admission**: `register` enforces the concurrent session limit
//! 2. **Introspection**: `lookup`, `snapshot` and `session_count` for the ops surface
//! 3. **Shutdown**: `shutdown_all` asks every relay to drain, waits up to a grace
//!    period, then aborts whatever is left
//!
//! ## Thread Safety:
//! The table sits behind a `tokio::sync::RwLock`. Lookups take the read lock, so
//! many can run at once; register and unregister take the write lock briefly.
//! The registry never mutates a session: it only reads the `watch` channel each
//! relay publishes its status on.

use crate::relay::events::RelayCommand;
use crate::relay::session::{Session, SessionId, SessionSnapshot, SessionStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("maximum concurrent sessions ({limit}) reached")]
    CapacityExceeded { limit: usize },

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} is already registered")]
    Duplicate(SessionId),
}

/// What the registry needs to know about a session to track and stop it.
pub struct SessionRegistration {
    pub id: SessionId,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: watch::Receiver<SessionStatus>,

    /// Weak so the registry never keeps a relay's inbox open on its own
    pub control: mpsc::WeakSender<RelayCommand>,
}

impl SessionRegistration {
    pub fn new(
        session: &Session,
        status: watch::Receiver<SessionStatus>,
        control: mpsc::WeakSender<RelayCommand>,
    ) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id.clone(),
            created_at: session.created_at,
            status,
            control,
        }
    }
}

struct RegistryEntry {
    registration: SessionRegistration,
    task: Option<AbortHandle>,
}

impl RegistryEntry {
    fn snapshot(&self) -> SessionSnapshot {
        let status = self.registration.status.borrow().clone();
        SessionSnapshot {
            id: self.registration.id,
            user_id: self.registration.user_id.clone(),
            state: status.state,
            created_at: self.registration.created_at,
            last_activity: status.last_activity,
            ingest: status.ingest,
        }
    }
}

/// Outcome of [`RelayRegistry::shutdown_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Sessions that drained and unregistered within the grace period
    pub drained: usize,
    /// Sessions aborted after the grace period
    pub forced: usize,
}

pub struct RelayRegistry {
    sessions: RwLock<HashMap<SessionId, RegistryEntry>>,
    max_sessions: usize,

    /// Woken whenever a session unregisters
    unregistered: Notify,
}

impl RelayRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            unregistered: Notify::new(),
        }
    }

    /// Admit a session, or refuse it when the table is full.
    pub async fn register(&self, registration: SessionRegistration) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::CapacityExceeded {
                limit: self.max_sessions,
            });
        }
        if sessions.contains_key(&registration.id) {
            return Err(RegistryError::Duplicate(registration.id));
        }

        let id = registration.id;
        sessions.insert(
            id,
            RegistryEntry {
                registration,
                task: None,
            },
        );
        debug!(session_id = %id, active_sessions = sessions.len(), "Session registered");
        Ok(())
    }

    /// Remember the task driving a session so shutdown can abort it.
    pub async fn attach_task(&self, id: SessionId, task: AbortHandle) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        entry.task = Some(task);
        Ok(())
    }

    pub async fn lookup(&self, id: SessionId) -> Result<SessionSnapshot, RegistryError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&id)
            .map(RegistryEntry::snapshot)
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remove a session. Returns false if it was not registered.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id).is_some();
        if removed {
            debug!(session_id = %id, "Session unregistered");
            self.unregistered.notify_waiters();
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Snapshots of every live session, oldest first.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshots: Vec<SessionSnapshot> =
            sessions.values().map(RegistryEntry::snapshot).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Drain every session, then force-close whatever is still registered after `grace`.
    pub async fn shutdown_all(&self, grace: Duration) -> ShutdownReport {
        let controls: Vec<(SessionId, Option<mpsc::Sender<RelayCommand>>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, entry)| (*id, entry.registration.control.upgrade()))
                .collect()
        };
        let initial = controls.len();
        if initial == 0 {
            return ShutdownReport::default();
        }

        info!(sessions = initial, grace_ms = grace.as_millis() as u64, "Draining all sessions");
        for (id, control) in controls {
            let Some(control) = control else {
                debug!(session_id = %id, "Relay inbox already closed");
                continue;
            };
            match control.try_send(RelayCommand::Shutdown) {
                Ok(()) => {}
                Err(TrySendError::Full(command)) => {
                    // Inbox is backed up; deliver once there is room
                    tokio::spawn(async move {
                        let _ = control.send(command).await;
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %id, "Relay already stopped");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.unregistered.notified();
            if self.session_count().await == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let leftovers: Vec<(SessionId, RegistryEntry)> =
            self.sessions.write().await.drain().collect();
        let forced = leftovers.len();
        for (id, entry) in leftovers {
            warn!(session_id = %id, "Force-closing session after shutdown grace period");
            if let Some(task) = entry.task {
                task.abort();
            }
        }

        let report = ShutdownReport {
            drained: initial.saturating_sub(forced),
            forced,
        };
        info!(drained = report.drained, forced = report.forced, "Session shutdown complete");
        report
    }
}
