//! # Interview Relay
//!
//! Real-time interview assistant backend. Each websocket session streams
//! interviewer audio in; the relay turns it into transcript events and, for every
//! finished interviewer turn, one suggested answer from a language-model backend.
//!
//! ## Module Layout:
//! - **audio**: per-session ingest buffer (ordering and overflow rules)
//! - **transcription**: speech-to-text capability, mock backend, utterance aggregation
//! - **suggestion**: answer-suggestion capability, Gemini and canned backends
//! - **relay**: the per-session state machine and the session registry
//! - **websocket**: the actix actor bridging a client connection to its relay
//! - **health**, **middleware**, **config**, **state**, **error**, **retry**: server plumbing

pub mod audio;
pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod relay;
pub mod retry;
pub mod state;
pub mod suggestion;
pub mod transcription;
pub mod websocket;
