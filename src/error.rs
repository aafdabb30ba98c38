//! # Error Handling
//!
//! Two families of errors live here:
//!
//! ### AppError (HTTP surface)
//! Returned by actix-web handlers. `ResponseError` turns each variant into a status
//! code and a consistent JSON body, so handlers can simply use `?`.
//!
//! ### RelayError (session surface)
//! Everything that can go wrong inside a running session. Each variant knows its
//! wire `code` (what the client sees in an `error` event) and whether it is fatal
//! to the session.
//!
//! ## Key Rust Concepts:
//! - **thiserror**: derives `Display` and `std::error::Error` from `#[error]` attributes
//! - **#[from]**: generates `From` impls so component errors convert with `?`
//! - **Exhaustive match**: adding an error kind forces a decision about its code
//!   and severity at compile time

use crate::audio::buffer::RejectReason;
use crate::relay::registry::RegistryError;
use crate::suggestion::SuggestionError;
use crate::transcription::TranscriptionError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal / ConfigError**: server-side problems (500)
/// - **BadRequest**: the client sent something unusable (400)
/// - **NotFound**: unknown session or resource (404)
/// - **CapacityExceeded**: the relay is full; the websocket upgrade is refused (503)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::CapacityExceeded(_) => ErrorCode::CapacityExceeded.as_str(),
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::CapacityExceeded(msg) => msg,
        }
    }
}

/// JSON error body:
///
/// ```json
/// {
///   "error": {
///     "type": "capacity_exceeded",
///     "message": "maximum concurrent sessions (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded { .. } => AppError::CapacityExceeded(err.to_string()),
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
            RegistryError::Duplicate(_) => AppError::Internal(err.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Machine-readable code carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    OutOfOrder,
    Overflow,
    BackendUnavailable,
    TransientBackendError,
    Timeout,
    CapacityExceeded,
    MalformedMessage,
    BackendError,
    SessionDraining,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::OutOfOrder => "out_of_order",
            ErrorCode::Overflow => "overflow",
            ErrorCode::BackendUnavailable => "backend_unavailable",
            ErrorCode::TransientBackendError => "transient_backend_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::CapacityExceeded => "capacity_exceeded",
            ErrorCode::MalformedMessage => "malformed_message",
            ErrorCode::BackendError => "backend_error",
            ErrorCode::SessionDraining => "session_draining",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures inside a running session relay.
///
/// ## Severity:
/// - **Fatal** (session drains and closes): transcription failures that survived
///   their retry budget, malformed client messages
/// - **Non-fatal** (session stays live): rejected chunks, suggestion failures,
///   audio sent while draining, a full inbox
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error(transparent)]
    Rejected(#[from] RejectReason),

    #[error("transcription failed: {0}")]
    Transcription(#[from] TranscriptionError),

    #[error("suggestion for utterance {utterance_id} failed: {source}")]
    Suggestion {
        utterance_id: u64,
        #[source]
        source: SuggestionError,
    },

    #[error("malformed client message: {0}")]
    MalformedMessage(String),

    #[error("session is draining; audio is no longer accepted")]
    Draining,

    #[error("relay inbox was full; {dropped} audio frame(s) dropped")]
    InboxFull { dropped: u64 },
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Rejected(RejectReason::OutOfOrder { .. }) => ErrorCode::OutOfOrder,
            RelayError::Rejected(RejectReason::Overflow { .. }) => ErrorCode::Overflow,
            RelayError::Transcription(TranscriptionError::Unavailable(_)) => ErrorCode::BackendUnavailable,
            RelayError::Transcription(TranscriptionError::Transient(_)) => ErrorCode::TransientBackendError,
            RelayError::Transcription(TranscriptionError::Timeout(_)) => ErrorCode::Timeout,
            RelayError::Suggestion { source, .. } => match source {
                SuggestionError::Timeout(_) => ErrorCode::Timeout,
                SuggestionError::Transient(_) => ErrorCode::TransientBackendError,
                SuggestionError::Unavailable(_) => ErrorCode::BackendUnavailable,
                SuggestionError::InvalidResponse(_) => ErrorCode::BackendError,
            },
            RelayError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            RelayError::Draining => ErrorCode::SessionDraining,
            RelayError::InboxFull { .. } => ErrorCode::Overflow,
        }
    }

    /// Transcription errors only reach the relay once retries are exhausted,
    /// so every one of them ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Transcription(_) | RelayError::MalformedMessage(_)
        )
    }

    /// The utterance this error concerns, if any.
    pub fn utterance_id(&self) -> Option<u64> {
        match self {
            RelayError::Suggestion { utterance_id, .. } => Some(*utterance_id),
            _ => None,
        }
    }
}
