//! # Session Relay
//!
//! The stateful core of the service: one relay per live interview connection,
//! plus the process-wide registry that tracks them.
//!
//! ## Key Components:
//! - **state**: lifecycle states and the pure transition function
//! - **session**: session identity, status and suggestion context
//! - **events**: client wire messages and transport commands
//! - **pipeline**: the per-session `SessionRelay` task
//! - **registry**: admission limits, lookup and coordinated shutdown

pub mod events;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod state;

pub use events::{ClientMessage, OutboundEvent, RelayCommand};
pub use pipeline::{DroppedFrames, RelayConnection, RelayDeps, RelaySettings, SessionRelay};
pub use registry::{RegistryError, RelayRegistry, SessionRegistration, ShutdownReport};
pub use session::{Session, SessionContext, SessionId, SessionSnapshot, SessionStatus};
pub use state::{transition, RelayState, Severity, Trigger, WireState};
