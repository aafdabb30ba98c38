//! Wire messages exchanged with the client, and the commands the transport sends
//! into a relay.

use crate::audio::buffer::AudioChunk;
use crate::error::{ErrorCode, RelayError};
use crate::relay::state::WireState;
use crate::suggestion::Suggestion;
use crate::transcription::Utterance;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Events sent to the client as JSON text frames.
///
/// ## Wire Format:
/// - `{"type":"transcript","text":"Tell me","final":false}`
/// - `{"type":"transcript","text":"...","final":true,"utterance_id":1}`
/// - `{"type":"suggestion","text":"...","for_utterance":1,"latency_ms":840}`
/// - `{"type":"error","code":"out_of_order","message":"..."}`
/// - `{"type":"status","state":"active"}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEvent {
    Transcript {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        utterance_id: Option<u64>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        low_confidence: bool,
    },
    Suggestion {
        text: String,
        for_utterance: u64,
        latency_ms: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        utterance_id: Option<u64>,
    },
    Status {
        state: WireState,
    },
}

impl OutboundEvent {
    pub fn provisional(text: impl Into<String>) -> Self {
        OutboundEvent::Transcript {
            text: text.into(),
            is_final: false,
            utterance_id: None,
            low_confidence: false,
        }
    }

    pub fn finalized(utterance: &Utterance) -> Self {
        OutboundEvent::Transcript {
            text: utterance.text.clone(),
            is_final: true,
            utterance_id: Some(utterance.id),
            low_confidence: utterance.low_confidence,
        }
    }

    pub fn suggestion(suggestion: &Suggestion) -> Self {
        OutboundEvent::Suggestion {
            text: suggestion.text.clone(),
            for_utterance: suggestion.utterance_id,
            latency_ms: suggestion.latency.as_millis() as u64,
        }
    }

    pub fn error(error: &RelayError) -> Self {
        OutboundEvent::Error {
            code: error.code(),
            message: error.to_string(),
            utterance_id: error.utterance_id(),
        }
    }

    pub fn status(state: WireState) -> Self {
        OutboundEvent::Status { state }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Control messages the client may send as JSON text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Start,
    Stop,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Input to a session relay from its transport or the registry.
#[derive(Debug)]
pub enum RelayCommand {
    /// Explicit `start` from the client
    Start,
    /// Binary frame; the relay assigns the next sequence number
    Audio(Bytes),
    /// Frame that already carries a sequence number
    Chunk(AudioChunk),
    /// Explicit `stop` from the client
    Stop,
    /// Text frame that is not a valid control message
    Malformed(String),
    /// Client connection is gone
    Disconnected,
    /// Process-wide shutdown
    Shutdown,
}
