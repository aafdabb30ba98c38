//! # Transcription Module
//!
//! Everything between raw session audio and finalized utterances.
//!
//! ## Key Components:
//! - **TranscriptionAdapter**: capability trait over a streaming speech-to-text backend
//! - **TranscriptionStream**: the relay's handle on one open backend stream
//! - **Mock adapter**: development backend that needs no credentials
//! - **UtteranceAggregator**: turns incremental fragments into finalized utterances
//!
//! ## Stream Model:
//! `open` hands back a [`TranscriptionStream`]. Audio goes in through
//! [`TranscriptionStream::feed`], which never blocks: it either enqueues the chunk
//! or reports the stream as full. Fragments come back on the same handle in backend
//! order. Adapter implementations get the other end of the pipe, a
//! [`BackendStream`], from [`stream_pair`].

pub mod aggregator;
pub mod mock;

pub use aggregator::{AggregatorConfig, FragmentOutcome, Utterance, UtteranceAggregator};
pub use mock::MockTranscriptionAdapter;

use crate::audio::buffer::{AudioChunk, AudioFormat};
use crate::config::TranscriptionConfig;
use crate::relay::session::SessionContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A piece of recognized text.
///
/// ## Fields:
/// - **is_final**: provisional fragments may be replaced by a later fragment over
///   the same span; final fragments never change
/// - **start_ms / end_ms**: position in the session's audio timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFragment {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TranscriptFragment {
    /// Provisional fragment with a neutral confidence.
    pub fn partial(text: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: 0.5,
            start_ms,
            end_ms,
        }
    }

    /// Final fragment with full confidence.
    pub fn finished(text: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: 1.0,
            start_ms,
            end_ms,
        }
    }

    /// Override the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Whether two fragments describe the same stretch of audio.
    pub fn overlaps(&self, other: &TranscriptFragment) -> bool {
        self.start_ms == other.start_ms
            || (self.start_ms < other.end_ms && other.start_ms < self.end_ms)
    }
}

/// Failures reported by a transcription backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptionError {
    /// The backend cannot serve this session at all
    #[error("transcription backend unavailable: {0}")]
    Unavailable(String),

    /// Worth retrying: dropped connection, rate limit, 5xx
    #[error("transient transcription error: {0}")]
    Transient(String),

    #[error("transcription backend did not respond within {0:?}")]
    Timeout(Duration),
}

impl TranscriptionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranscriptionError::Transient(_) | TranscriptionError::Timeout(_)
        )
    }
}

/// Why [`TranscriptionStream::feed`] did not take a chunk.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Backend has not caught up; the chunk is handed back
    #[error("transcription stream is full")]
    Full(AudioChunk),

    /// Backend side of the stream is gone
    #[error("transcription stream is closed")]
    Closed,
}

pub type FragmentResult = Result<TranscriptFragment, TranscriptionError>;

/// The relay's handle on one open backend stream.
pub struct TranscriptionStream {
    audio: Option<mpsc::Sender<AudioChunk>>,
    fragments: mpsc::Receiver<FragmentResult>,
}

/// The adapter's end of a stream: audio to recognize, and where to report results.
pub struct BackendStream {
    pub audio: mpsc::Receiver<AudioChunk>,
    pub fragments: mpsc::Sender<FragmentResult>,
}

/// Create a connected stream handle and backend end.
///
/// `capacity` bounds both directions; a backend that falls behind shows up as
/// [`FeedError::Full`] on the relay side.
pub fn stream_pair(capacity: usize) -> (TranscriptionStream, BackendStream) {
    let (audio_tx, audio_rx) = mpsc::channel(capacity.max(1));
    let (fragment_tx, fragment_rx) = mpsc::channel(capacity.max(1));

    (
        TranscriptionStream {
            audio: Some(audio_tx),
            fragments: fragment_rx,
        },
        BackendStream {
            audio: audio_rx,
            fragments: fragment_tx,
        },
    )
}

impl TranscriptionStream {
    /// Enqueue a chunk without waiting.
    pub fn feed(&self, chunk: AudioChunk) -> Result<(), FeedError> {
        let Some(audio) = self.audio.as_ref() else {
            return Err(FeedError::Closed);
        };

        audio.try_send(chunk).map_err(|e| match e {
            TrySendError::Full(chunk) => FeedError::Full(chunk),
            TrySendError::Closed(_) => FeedError::Closed,
        })
    }

    /// Next fragment or error, `None` once the backend has finished.
    pub async fn next_fragment(&mut self) -> Option<FragmentResult> {
        self.fragments.recv().await
    }

    /// Signal end of audio. Fragments already produced can still be received.
    pub fn close(&mut self) {
        self.audio = None;
    }
}

/// Capability interface over a streaming speech-to-text backend.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: async methods behind `dyn TranscriptionAdapter`
/// - **Send + Sync**: one adapter instance is shared by every session task
#[async_trait]
pub trait TranscriptionAdapter: Send + Sync {
    /// Short provider name for logs and the health endpoint.
    fn name(&self) -> &str;

    /// Open a recognition stream for one session.
    async fn open(&self, session: &SessionContext) -> Result<TranscriptionStream, TranscriptionError>;
}

/// Build the adapter selected by `transcription.provider` for audio in `format`.
pub fn create_adapter(
    config: &TranscriptionConfig,
    format: AudioFormat,
) -> anyhow::Result<Arc<dyn TranscriptionAdapter>> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(
            MockTranscriptionAdapter::new(config.stream_capacity, config.mock_chunks_per_utterance)
                .with_format(format),
        )),
        other => Err(anyhow::anyhow!("Unknown transcription provider: {}", other)),
    }
}
