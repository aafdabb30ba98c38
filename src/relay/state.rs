//! # Relay Lifecycle State Machine
//!
//! Every lifecycle change a session goes through is computed by the single pure
//! function [`transition`]. The relay feeds it a [`Trigger`] and either gets the
//! next [`RelayState`] back or an [`InvalidTransition`] it can log.
//!
//! ## States:
//! 1. **Connecting**: connection accepted, no audio yet
//! 2. **Active**: ingesting, aggregating, suggesting, emitting
//! 3. **Erroring**: a non-fatal failure is being reported; returns to Active
//! 4. **Draining**: no new audio, in-flight work gets a bounded grace period
//! 5. **Closed**: terminal, repeated close requests are no-ops

use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of one session relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Connecting,
    Active,
    Erroring,
    Draining,
    Closed,
}

impl RelayState {
    /// The state as the client sees it. `Erroring` is internal and reads as `active`.
    pub fn wire(&self) -> WireState {
        match self {
            RelayState::Connecting => WireState::Connecting,
            RelayState::Active | RelayState::Erroring => WireState::Active,
            RelayState::Draining => WireState::Draining,
            RelayState::Closed => WireState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Connecting => "connecting",
            RelayState::Active => "active",
            RelayState::Erroring => "erroring",
            RelayState::Draining => "draining",
            RelayState::Closed => "closed",
        }
    }

    /// Whether new audio may still be ingested.
    pub fn accepts_audio(&self) -> bool {
        matches!(
            self,
            RelayState::Connecting | RelayState::Active | RelayState::Erroring
        )
    }
}

/// Externally visible state carried by `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireState {
    Connecting,
    Active,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    NonFatal,
    Fatal,
}

/// Something that happened to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Client sent an explicit `start`
    Start,
    /// A chunk passed the ingest buffer
    AudioAccepted,
    /// A component failed
    Fault(Severity),
    /// The non-fatal failure has been reported
    Recovered,
    /// Client sent `stop`
    Stop,
    /// Client connection went away
    Disconnect,
    /// No audio and no outstanding suggestion for too long
    IdleTimeout,
    /// Process-wide shutdown
    Shutdown,
    /// Draining finished
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {from:?} on {trigger:?}")]
pub struct InvalidTransition {
    pub from: RelayState,
    pub trigger: Trigger,
}

/// Compute the next state.
///
/// ## Rules:
/// - Any close-like trigger (stop, disconnect, idle, shutdown, fatal fault) moves a
///   live session to `Draining`
/// - `Draining` only leaves on `Drained` and absorbs further close-like triggers
/// - `Closed` absorbs every close-like trigger so closing twice is harmless
pub fn transition(from: RelayState, trigger: Trigger) -> Result<RelayState, InvalidTransition> {
    use RelayState::*;

    let closing = matches!(
        trigger,
        Trigger::Stop
            | Trigger::Disconnect
            | Trigger::IdleTimeout
            | Trigger::Shutdown
            | Trigger::Fault(Severity::Fatal)
    );

    let next = match (from, trigger) {
        (Closed, Trigger::Drained) => Closed,
        (Closed, Trigger::Fault(_)) => Closed,
        (Closed, _) if closing => Closed,

        (Draining, Trigger::Drained) => Closed,
        (Draining, Trigger::Fault(_)) => Draining,
        (Draining, _) if closing => Draining,

        (Connecting | Active | Erroring, _) if closing => Draining,

        (Connecting, Trigger::Start | Trigger::AudioAccepted) => Active,
        (Connecting, Trigger::Fault(Severity::NonFatal)) => Connecting,

        (Active | Erroring, Trigger::Start | Trigger::AudioAccepted) => Active,
        (Active | Erroring, Trigger::Fault(Severity::NonFatal)) => Erroring,
        (Erroring, Trigger::Recovered) => Active,

        _ => return Err(InvalidTransition { from, trigger }),
    };

    Ok(next)
}
