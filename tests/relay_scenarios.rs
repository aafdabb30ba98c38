//! End-to-end behaviour of a session relay, driven through its command inbox with
//! scripted transcription and suggestion backends.
//!
//! Every test runs on a paused clock, so silence, idle and timeout paths complete
//! instantly and deterministically.

use async_trait::async_trait;
use bytes::Bytes;
use interview_relay::audio::buffer::AudioChunk;
use interview_relay::error::ErrorCode;
use interview_relay::relay::{
    OutboundEvent, RegistryError, RelayCommand, RelayConnection, RelayDeps, RelayRegistry,
    RelaySettings, RelayState, Session, SessionContext, SessionRelay, ShutdownReport, WireState,
};
use interview_relay::retry::RetryPolicy;
use interview_relay::state::RelayMetrics;
use interview_relay::suggestion::{SuggestionAdapter, SuggestionError};
use interview_relay::transcription::{
    stream_pair, BackendStream, TranscriptFragment, TranscriptionAdapter, TranscriptionError,
    TranscriptionStream, Utterance,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Instant};

const WAIT: Duration = Duration::from_secs(30);

/// Transcription backend whose streams are handed to the test to script.
struct ChannelTranscription {
    capacity: usize,
    backends: mpsc::UnboundedSender<BackendStream>,
    open_failures: Mutex<VecDeque<TranscriptionError>>,
}

impl ChannelTranscription {
    fn new(capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<BackendStream>) {
        let (backends, opened) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            capacity,
            backends,
            open_failures: Mutex::new(VecDeque::new()),
        });
        (adapter, opened)
    }

    fn fail_next_opens(&self, failures: impl IntoIterator<Item = TranscriptionError>) {
        self.open_failures.lock().unwrap().extend(failures);
    }
}

#[async_trait]
impl TranscriptionAdapter for ChannelTranscription {
    fn name(&self) -> &str {
        "channel"
    }

    async fn open(&self, _session: &SessionContext) -> Result<TranscriptionStream, TranscriptionError> {
        let failure = self.open_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let (stream, backend) = stream_pair(self.capacity);
        self.backends
            .send(backend)
            .map_err(|_| TranscriptionError::Unavailable("test harness gone".to_string()))?;
        Ok(stream)
    }
}

/// Transcription backend whose streams never finish opening.
struct StalledTranscription;

#[async_trait]
impl TranscriptionAdapter for StalledTranscription {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn open(&self, _session: &SessionContext) -> Result<TranscriptionStream, TranscriptionError> {
        std::future::pending::<Result<TranscriptionStream, TranscriptionError>>().await
    }
}

/// Suggestion backend that answers only when the test releases a permit.
struct GatedSuggestions {
    gate: Semaphore,
    calls: Mutex<Vec<(u64, Vec<String>)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GatedSuggestions {
    fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    /// Answers immediately.
    fn open() -> Arc<Self> {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    /// Answers nothing until `release` is called.
    fn closed() -> Arc<Self> {
        Self::with_permits(0)
    }

    fn release(&self, answers: usize) {
        self.gate.add_permits(answers);
    }

    fn call_ids(&self) -> Vec<u64> {
        self.calls.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    fn context_for(&self, utterance_id: u64) -> Option<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == utterance_id)
            .map(|(_, context)| context.clone())
    }
}

#[async_trait]
impl SuggestionAdapter for GatedSuggestions {
    fn name(&self) -> &str {
        "gated"
    }

    async fn generate(
        &self,
        utterance: &Utterance,
        context: &SessionContext,
    ) -> Result<String, SuggestionError> {
        self.calls
            .lock()
            .unwrap()
            .push((utterance.id, context.recent_utterances.clone()));

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SuggestionError::Unavailable("gate closed".to_string()))?;
        permit.forget();

        Ok(format!("Answer for utterance {}", utterance.id))
    }
}

struct Harness {
    connection: RelayConnection,
    backends: mpsc::UnboundedReceiver<BackendStream>,
    suggestions: Arc<GatedSuggestions>,
    deps: RelayDeps,
}

impl Harness {
    async fn start(settings: RelaySettings, suggestions: Arc<GatedSuggestions>) -> Self {
        Self::start_with(settings, suggestions, 16, |_| {}).await
    }

    async fn start_with(
        settings: RelaySettings,
        suggestions: Arc<GatedSuggestions>,
        stream_capacity: usize,
        prepare: impl FnOnce(&ChannelTranscription),
    ) -> Self {
        let (transcription, backends) = ChannelTranscription::new(stream_capacity);
        prepare(&transcription);

        let deps = RelayDeps {
            transcription: transcription.clone(),
            suggestion: suggestions.clone(),
            registry: Arc::new(RelayRegistry::new(4)),
            metrics: Arc::new(RelayMetrics::default()),
        };
        let connection = SessionRelay::start(Session::new(Some("candidate".to_string())), settings, deps.clone())
            .await
            .unwrap();

        Self {
            connection,
            backends,
            suggestions,
            deps,
        }
    }

    async fn send(&self, command: RelayCommand) {
        self.connection.commands.send(command).await.unwrap();
    }

    async fn next_event(&mut self) -> OutboundEvent {
        timeout(WAIT, self.connection.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("relay closed its event stream")
    }

    async fn expect_stream_end(&mut self) {
        let end = timeout(WAIT, self.connection.events.recv())
            .await
            .expect("timed out waiting for the event stream to end");
        assert!(end.is_none(), "unexpected event {:?}", end);
    }

    async fn next_backend(&mut self) -> BackendStream {
        timeout(WAIT, self.backends.recv())
            .await
            .expect("timed out waiting for a transcription stream")
            .expect("transcription adapter dropped")
    }

    /// Send `start` and consume the connecting/active status pair.
    async fn activate(&mut self) -> BackendStream {
        assert_eq!(self.next_event().await, OutboundEvent::status(WireState::Connecting));
        self.send(RelayCommand::Start).await;
        assert_eq!(self.next_event().await, OutboundEvent::status(WireState::Active));
        self.next_backend().await
    }

    async fn state(&self) -> RelayState {
        self.deps
            .registry
            .lookup(self.connection.session_id)
            .await
            .unwrap()
            .state
    }
}

fn audio(bytes: usize) -> RelayCommand {
    RelayCommand::Audio(Bytes::from(vec![0u8; bytes]))
}

fn expect_final(event: OutboundEvent) -> (u64, String, bool) {
    match event {
        OutboundEvent::Transcript {
            text,
            is_final: true,
            utterance_id: Some(id),
            low_confidence,
        } => (id, text, low_confidence),
        other => panic!("expected a final transcript, got {:?}", other),
    }
}

fn expect_suggestion(event: OutboundEvent) -> (u64, String) {
    match event {
        OutboundEvent::Suggestion {
            for_utterance, text, ..
        } => (for_utterance, text),
        other => panic!("expected a suggestion, got {:?}", other),
    }
}

fn expect_error(event: OutboundEvent) -> (ErrorCode, Option<u64>) {
    match event {
        OutboundEvent::Error {
            code, utterance_id, ..
        } => (code, utterance_id),
        other => panic!("expected an error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn interviewer_question_becomes_transcript_then_suggestion() {
    let mut h = Harness::start(RelaySettings::default(), GatedSuggestions::open()).await;
    let mut backend = h.activate().await;

    for _ in 0..3 {
        h.send(audio(320)).await;
    }
    for expected in 0..3 {
        assert_eq!(backend.audio.recv().await.unwrap().sequence(), expected);
    }

    for fragment in [
        TranscriptFragment::partial("Tell", 0, 300),
        TranscriptFragment::partial("Tell me about", 0, 900),
        TranscriptFragment::finished("Tell me about a challenge.", 0, 1500),
    ] {
        backend.fragments.send(Ok(fragment)).await.unwrap();
    }

    assert_eq!(h.next_event().await, OutboundEvent::provisional("Tell"));
    assert_eq!(h.next_event().await, OutboundEvent::provisional("Tell me about"));
    assert_eq!(
        expect_final(h.next_event().await),
        (1, "Tell me about a challenge.".to_string(), false)
    );
    assert_eq!(
        expect_suggestion(h.next_event().await),
        (1, "Answer for utterance 1".to_string())
    );

    assert_eq!(h.suggestions.call_ids(), vec![1]);
    assert_eq!(h.deps.metrics.utterances_finalized.get(), 1);
    assert_eq!(h.deps.metrics.suggestions_delivered.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_chunk_is_rejected_and_session_stays_active() {
    let mut h = Harness::start(RelaySettings::default(), GatedSuggestions::open()).await;
    let mut backend = h.activate().await;

    for sequence in [0, 1, 2, 3, 5, 4] {
        h.send(RelayCommand::Chunk(AudioChunk::new(sequence, vec![1u8; 320]))).await;
    }

    // seq 5 jumps the gap, and the late seq 4 is refused as well
    assert_eq!(expect_error(h.next_event().await), (ErrorCode::OutOfOrder, None));
    assert_eq!(expect_error(h.next_event().await), (ErrorCode::OutOfOrder, None));
    assert_eq!(h.state().await, RelayState::Active);

    // Audio resumes past the gap; neither 4 nor 5 ever reaches the backend
    h.send(RelayCommand::Chunk(AudioChunk::new(6, vec![1u8; 320]))).await;
    let mut forwarded = Vec::new();
    for _ in 0..5 {
        forwarded.push(backend.audio.recv().await.unwrap().sequence());
    }
    assert_eq!(forwarded, vec![0, 1, 2, 3, 6]);
    assert_eq!(h.deps.metrics.chunks_rejected.get(), 2);

    let snapshot = h.deps.registry.lookup(h.connection.session_id).await.unwrap();
    assert_eq!(snapshot.ingest.accepted, 5);
    assert_eq!(snapshot.ingest.rejected_out_of_order, 2);
    assert_eq!(snapshot.ingest.rejected_through, Some(5));
}

#[tokio::test(start_paused = true)]
async fn one_suggestion_in_flight_and_newest_queued_utterance_wins() {
    let suggestions = GatedSuggestions::closed();
    let mut h = Harness::start(RelaySettings::default(), suggestions.clone()).await;
    let backend = h.activate().await;

    for (text, start, end) in [
        ("First question?", 0, 1000),
        ("Second question?", 1000, 2000),
        ("Third question?", 2000, 3000),
    ] {
        backend
            .fragments
            .send(Ok(TranscriptFragment::finished(text, start, end)))
            .await
            .unwrap();
    }

    for expected in 1..=3 {
        assert_eq!(expect_final(h.next_event().await).0, expected);
    }

    suggestions.release(2);
    assert_eq!(expect_suggestion(h.next_event().await).0, 1);
    assert_eq!(expect_suggestion(h.next_event().await).0, 3);

    assert_eq!(suggestions.call_ids(), vec![1, 3]);
    assert_eq!(suggestions.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(h.deps.metrics.utterances_superseded.get(), 1);
    assert!(suggestions
        .context_for(3)
        .unwrap()
        .contains(&"Second question?".to_string()));
}

#[tokio::test(start_paused = true)]
async fn silence_forces_a_low_confidence_utterance() {
    let mut h = Harness::start(RelaySettings::default(), GatedSuggestions::open()).await;
    let backend = h.activate().await;
    let started = Instant::now();

    backend
        .fragments
        .send(Ok(TranscriptFragment::partial("So tell me", 0, 500).with_confidence(0.6)))
        .await
        .unwrap();

    assert_eq!(h.next_event().await, OutboundEvent::provisional("So tell me"));
    assert_eq!(
        expect_final(h.next_event().await),
        (1, "So tell me".to_string(), true)
    );
    assert!(started.elapsed() >= RelaySettings::default().aggregator.silence_threshold);
    assert_eq!(expect_suggestion(h.next_event().await).0, 1);
}

#[tokio::test(start_paused = true)]
async fn unavailable_transcription_closes_the_session() {
    let mut h = Harness::start_with(RelaySettings::default(), GatedSuggestions::open(), 16, |t| {
        t.fail_next_opens([TranscriptionError::Unavailable("no credentials".to_string())])
    })
    .await;

    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Connecting));
    h.send(RelayCommand::Start).await;
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Active));
    assert_eq!(
        expect_error(h.next_event().await),
        (ErrorCode::BackendUnavailable, None)
    );
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;

    assert_eq!(h.deps.registry.session_count().await, 0);
    assert_eq!(h.deps.metrics.sessions_closed.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_open_failures_are_retried() {
    let mut h = Harness::start_with(RelaySettings::default(), GatedSuggestions::open(), 16, |t| {
        t.fail_next_opens([
            TranscriptionError::Transient("connection reset".to_string()),
            TranscriptionError::Transient("connection reset".to_string()),
        ])
    })
    .await;

    let mut backend = h.activate().await;
    h.send(audio(320)).await;
    assert_eq!(backend.audio.recv().await.unwrap().sequence(), 0);
    assert_eq!(h.deps.metrics.errors_reported.get(), 0);
    assert_eq!(h.state().await, RelayState::Active);
}

#[tokio::test(start_paused = true)]
async fn suggestion_timeout_is_reported_but_not_fatal() {
    let mut settings = RelaySettings::default();
    settings.suggestion_timeout = Duration::from_secs(2);
    settings.suggestion_retry = RetryPolicy::none();

    let suggestions = GatedSuggestions::closed();
    let mut h = Harness::start(settings, suggestions.clone()).await;
    let backend = h.activate().await;

    backend
        .fragments
        .send(Ok(TranscriptFragment::finished("Why this company?", 0, 1200)))
        .await
        .unwrap();
    assert_eq!(expect_final(h.next_event().await).0, 1);
    assert_eq!(
        expect_error(h.next_event().await),
        (ErrorCode::Timeout, Some(1))
    );
    assert_eq!(h.state().await, RelayState::Active);

    // The pipeline keeps going for the next question
    suggestions.release(1);
    backend
        .fragments
        .send(Ok(TranscriptFragment::finished("Where do you see yourself?", 1200, 2500)))
        .await
        .unwrap();
    assert_eq!(expect_final(h.next_event().await).0, 2);
    assert_eq!(expect_suggestion(h.next_event().await).0, 2);
    assert_eq!(h.deps.metrics.suggestion_failures.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_control_message_closes_the_session() {
    let mut h = Harness::start(RelaySettings::default(), GatedSuggestions::open()).await;
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Connecting));

    h.send(RelayCommand::Malformed("unknown variant `pause`".to_string())).await;

    assert_eq!(
        expect_error(h.next_event().await),
        (ErrorCode::MalformedMessage, None)
    );
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_drained_after_timeout() {
    let mut settings = RelaySettings::default();
    settings.idle_timeout = Duration::from_secs(10);

    let started = Instant::now();
    let mut h = Harness::start(settings, GatedSuggestions::open()).await;
    let _backend = h.activate().await;

    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(h.deps.registry.session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_outstanding_suggestion() {
    let suggestions = GatedSuggestions::closed();
    let mut h = Harness::start(RelaySettings::default(), suggestions.clone()).await;
    let backend = h.activate().await;

    backend
        .fragments
        .send(Ok(TranscriptFragment::finished("Tell me about yourself.", 0, 1500)))
        .await
        .unwrap();
    assert_eq!(expect_final(h.next_event().await).0, 1);

    h.send(RelayCommand::Stop).await;
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;

    assert_eq!(h.deps.metrics.suggestions_delivered.get(), 0);
    assert!(suggestions.call_ids().len() <= 1);
}

#[tokio::test(start_paused = true)]
async fn replayed_fragments_after_reopen_are_not_finalized_twice() {
    let mut h = Harness::start(RelaySettings::default(), GatedSuggestions::open()).await;
    let first = h.activate().await;

    let question = TranscriptFragment::finished("Tell me about a challenge.", 0, 1500);
    first.fragments.send(Ok(question.clone())).await.unwrap();
    drop(first);

    // The relay reopens the stream and the backend replays what it already sent
    let second = h.next_backend().await;
    for fragment in [
        question,
        TranscriptFragment::partial("What", 1500, 2000),
        TranscriptFragment::finished("What went wrong?", 1500, 2600),
    ] {
        second.fragments.send(Ok(fragment)).await.unwrap();
    }

    let mut finals = Vec::new();
    while finals.len() < 2 {
        let event = h.next_event().await;
        if let OutboundEvent::Transcript { is_final: true, .. } = event {
            let (id, text, _) = expect_final(event);
            finals.push((id, text));
        }
    }

    assert_eq!(
        finals,
        vec![
            (1, "Tell me about a challenge.".to_string()),
            (2, "What went wrong?".to_string()),
        ]
    );
    assert_eq!(h.deps.metrics.transcription_reopens.get(), 1);
    assert_eq!(h.state().await, RelayState::Active);
}

#[tokio::test(start_paused = true)]
async fn buffer_ceiling_rejects_audio_as_overflow() {
    let mut settings = RelaySettings::default();
    // 16 kHz mono 16-bit: 1600 bytes is 50 ms
    settings.buffer.max_buffered_ms = 100;

    let mut h = Harness::start_with(settings, GatedSuggestions::open(), 1, |_| {}).await;
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Connecting));

    // First chunk activates the session and reaches the backend once the stream is open
    h.send(audio(1600)).await;
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Active));
    let mut backend = h.next_backend().await;
    assert_eq!(backend.audio.recv().await.unwrap().sequence(), 0);

    // One more fills the one-slot stream, two wait under the ceiling, the fifth does not fit
    for _ in 0..4 {
        h.send(audio(1600)).await;
    }
    assert_eq!(expect_error(h.next_event().await), (ErrorCode::Overflow, None));
    assert_eq!(h.state().await, RelayState::Active);
    assert_eq!(h.deps.metrics.chunks_accepted.get(), 4);
    assert_eq!(h.deps.metrics.chunks_rejected.get(), 1);

    // Buffered audio moves on once the backend catches up
    assert_eq!(backend.audio.recv().await.unwrap().sequence(), 1);
    backend
        .fragments
        .send(Ok(TranscriptFragment::partial("Um", 0, 50)))
        .await
        .unwrap();
    assert_eq!(h.next_event().await, OutboundEvent::provisional("Um"));
    assert_eq!(backend.audio.recv().await.unwrap().sequence(), 2);
}

#[tokio::test(start_paused = true)]
async fn sessions_beyond_capacity_are_refused() {
    let (transcription, _backends) = ChannelTranscription::new(4);
    let deps = RelayDeps {
        transcription,
        suggestion: GatedSuggestions::open(),
        registry: Arc::new(RelayRegistry::new(1)),
        metrics: Arc::new(RelayMetrics::default()),
    };

    let first = SessionRelay::start(Session::new(None), RelaySettings::default(), deps.clone())
        .await
        .unwrap();
    let refused = SessionRelay::start(Session::new(None), RelaySettings::default(), deps.clone()).await;

    assert!(matches!(refused, Err(RegistryError::CapacityExceeded { limit: 1 })));
    assert_eq!(deps.metrics.sessions_refused.get(), 1);
    assert_eq!(deps.registry.session_count().await, 1);
    assert_eq!(
        deps.registry.lookup(first.session_id).await.unwrap().state,
        RelayState::Connecting
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_live_sessions() {
    let mut h = Harness::start(RelaySettings::default(), GatedSuggestions::open()).await;
    let _backend = h.activate().await;

    let report = h.deps.registry.shutdown_all(Duration::from_secs(5)).await;
    assert_eq!(report, ShutdownReport { drained: 1, forced: 0 });

    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;
    assert_eq!(h.deps.registry.session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_is_handled_while_the_transcription_stream_is_still_opening() {
    let settings = RelaySettings::default();
    let deps = RelayDeps {
        transcription: Arc::new(StalledTranscription),
        suggestion: GatedSuggestions::open(),
        registry: Arc::new(RelayRegistry::new(1)),
        metrics: Arc::new(RelayMetrics::default()),
    };
    let mut connection = SessionRelay::start(Session::new(None), settings.clone(), deps.clone())
        .await
        .unwrap();
    let started = Instant::now();

    connection.commands.send(RelayCommand::Start).await.unwrap();
    for _ in 0..3 {
        connection.commands.send(audio(320)).await.unwrap();
    }
    connection.commands.send(RelayCommand::Stop).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = timeout(WAIT, connection.events.recv()).await.unwrap() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            OutboundEvent::status(WireState::Connecting),
            OutboundEvent::status(WireState::Active),
            OutboundEvent::status(WireState::Draining),
            OutboundEvent::status(WireState::Closed),
        ]
    );
    assert!(started.elapsed() < settings.transcription_open_timeout);
    assert_eq!(deps.metrics.chunks_accepted.get(), 3);
    assert_eq!(deps.registry.session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_the_outstanding_suggestion_finish() {
    let suggestions = GatedSuggestions::closed();
    let mut h = Harness::start(RelaySettings::default(), suggestions.clone()).await;
    let backend = h.activate().await;

    backend
        .fragments
        .send(Ok(TranscriptFragment::finished("Why should we hire you?", 0, 1500)))
        .await
        .unwrap();
    assert_eq!(expect_final(h.next_event().await).0, 1);

    h.send(RelayCommand::Shutdown).await;
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));

    // Audio sent while draining is refused
    h.send(audio(320)).await;
    assert_eq!(
        expect_error(h.next_event().await),
        (ErrorCode::SessionDraining, None)
    );
    assert_eq!(h.state().await, RelayState::Draining);

    suggestions.release(1);
    assert_eq!(
        expect_suggestion(h.next_event().await),
        (1, "Answer for utterance 1".to_string())
    );
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;

    assert_eq!(h.deps.metrics.suggestions_delivered.get(), 1);
    assert_eq!(h.deps.metrics.chunks_accepted.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn drain_grace_expiry_reports_the_unanswered_utterance() {
    let mut settings = RelaySettings::default();
    settings.drain_grace = Duration::from_secs(1);
    settings.suggestion_timeout = Duration::from_secs(30);
    settings.suggestion_retry = RetryPolicy::none();

    let mut h = Harness::start(settings, GatedSuggestions::closed()).await;
    let backend = h.activate().await;

    backend
        .fragments
        .send(Ok(TranscriptFragment::finished("Describe a conflict.", 0, 1500)))
        .await
        .unwrap();
    assert_eq!(expect_final(h.next_event().await).0, 1);

    let draining_at = Instant::now();
    h.send(RelayCommand::Shutdown).await;
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(expect_error(h.next_event().await), (ErrorCode::Timeout, Some(1)));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;

    assert!(draining_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(h.deps.metrics.suggestions_delivered.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_the_outstanding_suggestion() {
    let settings = RelaySettings::default();
    let suggestions = GatedSuggestions::closed();
    let mut h = Harness::start(settings.clone(), suggestions.clone()).await;
    let backend = h.activate().await;

    backend
        .fragments
        .send(Ok(TranscriptFragment::finished("What are your weaknesses?", 0, 1500)))
        .await
        .unwrap();
    assert_eq!(expect_final(h.next_event().await).0, 1);

    let disconnected_at = Instant::now();
    h.send(RelayCommand::Disconnected).await;

    // No grace period and no timeout error: the request is simply dropped
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;

    assert!(disconnected_at.elapsed() < settings.drain_grace);
    assert_eq!(h.deps.metrics.suggestions_delivered.get(), 0);
    assert_eq!(h.deps.metrics.suggestion_failures.get(), 0);
    assert!(suggestions.call_ids().len() <= 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_mid_stream_failures_end_the_session() {
    let mut settings = RelaySettings::default();
    settings.transcription_retry = RetryPolicy::new(1, Duration::from_millis(100));

    let mut h = Harness::start(settings, GatedSuggestions::open()).await;
    let first = h.activate().await;

    first
        .fragments
        .send(Err(TranscriptionError::Transient("stream reset".to_string())))
        .await
        .unwrap();

    // One reopen is within budget
    let second = h.next_backend().await;
    second
        .fragments
        .send(Err(TranscriptionError::Transient("stream reset again".to_string())))
        .await
        .unwrap();

    assert_eq!(
        expect_error(h.next_event().await),
        (ErrorCode::TransientBackendError, None)
    );
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Draining));
    assert_eq!(h.next_event().await, OutboundEvent::status(WireState::Closed));
    h.expect_stream_end().await;

    assert_eq!(h.deps.metrics.transcription_reopens.get(), 1);
    assert_eq!(h.deps.registry.session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn frames_dropped_by_the_transport_are_reported_by_the_relay() {
    let mut h = Harness::start(RelaySettings::default(), GatedSuggestions::open()).await;
    let _backend = h.activate().await;

    h.connection.dropped.record();
    h.connection.dropped.record();

    match h.next_event().await {
        OutboundEvent::Error { code, message, .. } => {
            assert_eq!(code, ErrorCode::Overflow);
            assert!(message.contains("2 audio frame(s)"), "{}", message);
        }
        other => panic!("expected an overflow error, got {:?}", other),
    }
    assert_eq!(h.state().await, RelayState::Active);
    assert_eq!(h.deps.metrics.chunks_rejected.get(), 1);
}
