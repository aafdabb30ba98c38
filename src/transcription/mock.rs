//! Development transcription backend.
//!
//! Pretends to recognize a fixed sentence: every chunk grows a provisional
//! transcript by one word, and every `chunks_per_utterance` chunks the full
//! sentence is emitted as a final fragment spanning the audio since the previous
//! final. Spans start at the session's audio position, so a reopened stream
//! carries on where the previous one stopped.

use crate::audio::buffer::AudioFormat;
use crate::relay::session::SessionContext;
use crate::transcription::{
    stream_pair, BackendStream, TranscriptFragment, TranscriptionAdapter, TranscriptionError,
    TranscriptionStream,
};
use async_trait::async_trait;
use tracing::debug;

const MOCK_TRANSCRIPT: &str = "Mock transcript for testing";
const MOCK_CONFIDENCE: f32 = 0.85;

pub struct MockTranscriptionAdapter {
    capacity: usize,
    chunks_per_utterance: u32,
    format: AudioFormat,
}

impl MockTranscriptionAdapter {
    pub fn new(capacity: usize, chunks_per_utterance: u32) -> Self {
        Self {
            capacity,
            chunks_per_utterance: chunks_per_utterance.max(1),
            format: AudioFormat::default(),
        }
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }
}

#[async_trait]
impl TranscriptionAdapter for MockTranscriptionAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, session: &SessionContext) -> Result<TranscriptionStream, TranscriptionError> {
        let (stream, backend) = stream_pair(self.capacity);
        debug!(session_id = %session.session_id, "Opening mock transcription stream");

        tokio::spawn(recognize(
            backend,
            self.chunks_per_utterance,
            self.format,
            session.audio_position_ms,
        ));
        Ok(stream)
    }
}

async fn recognize(
    mut backend: BackendStream,
    chunks_per_utterance: u32,
    format: AudioFormat,
    position_ms: u64,
) {
    let words: Vec<&str> = MOCK_TRANSCRIPT.split_whitespace().collect();
    let mut utterance_start_ms = position_ms;
    let mut offset_ms = position_ms;
    let mut chunks_in_utterance = 0u32;

    while let Some(chunk) = backend.audio.recv().await {
        offset_ms += format.duration_ms(chunk.len());
        chunks_in_utterance += 1;

        let fragment = if chunks_in_utterance >= chunks_per_utterance {
            let fragment = TranscriptFragment::finished(MOCK_TRANSCRIPT, utterance_start_ms, offset_ms)
                .with_confidence(MOCK_CONFIDENCE);
            utterance_start_ms = offset_ms;
            chunks_in_utterance = 0;
            fragment
        } else {
            let shown = (chunks_in_utterance as usize).min(words.len());
            TranscriptFragment::partial(words[..shown].join(" "), utterance_start_ms, offset_ms)
        };

        if backend.fragments.send(Ok(fragment)).await.is_err() {
            break;
        }
    }
}
