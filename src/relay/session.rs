//! # Session Identity and Context
//!
//! A [`Session`] is the relay-side record of one live interview connection. The
//! running `SessionRelay` owns it and is the only code that mutates it; the
//! registry sees it through a `watch` channel of [`SessionStatus`] updates and
//! hands out read-only [`SessionSnapshot`]s.

use crate::audio::buffer::IngestDiagnostics;
use crate::relay::state::RelayState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, unique session identifier (UUID v4).
///
/// ## Rust Concepts:
/// - **Newtype pattern**: wrapping `Uuid` keeps session ids from being mixed up
///   with any other UUID in the program
/// - **#[serde(transparent)]**: serializes as the bare UUID string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One live relay instance.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user_id: Option<String>,
    pub state: RelayState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            user_id,
            state: RelayState::Connecting,
            created_at: now,
            last_activity: now,
        }
    }

    /// Record client or backend activity.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Status with empty ingest counters; the relay fills them in when it publishes.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            last_activity: self.last_activity,
            ingest: IngestDiagnostics::default(),
        }
    }
}

/// The mutable part of a session, published by the relay to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: RelayState,
    pub last_activity: DateTime<Utc>,
    pub ingest: IngestDiagnostics,
}

/// Read-only view of a session for lookups and the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub user_id: Option<String>,
    pub state: RelayState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ingest: IngestDiagnostics,
}

/// What a backend is told about the session it is serving.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user_id: Option<String>,

    /// Session audio already handed to transcription; a reopened stream's
    /// fragment spans continue from here
    pub audio_position_ms: u64,

    /// Most recent finalized utterances, oldest first
    pub recent_utterances: Vec<String>,
}

/// Bounded history of finalized utterance texts used to build [`SessionContext`].
#[derive(Debug, Clone)]
pub struct UtteranceHistory {
    limit: usize,
    entries: VecDeque<(u64, String)>,
}

impl UtteranceHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: VecDeque::with_capacity(limit),
        }
    }

    pub fn record(&mut self, utterance_id: u64, text: &str) {
        if self.limit == 0 {
            return;
        }
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back((utterance_id, text.to_string()));
    }

    /// Texts of utterances finalized before `utterance_id`.
    pub fn before(&self, utterance_id: u64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(id, _)| *id < utterance_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}
