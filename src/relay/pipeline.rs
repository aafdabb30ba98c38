//! # Session Relay
//!
//! One `SessionRelay` runs per connected client, as its own tokio task. It owns
//! the session's ingest buffer, transcription stream, utterance aggregator and the
//! single outstanding suggestion request, and it is the only writer of the
//! session's outbound event channel.
//!
//! ## Event Loop:
//! Everything happens inside one `tokio::select!` loop, so the per-session
//! pipeline is single-threaded and needs no locks:
//!
//! ```text
//! inbox (transport)      ──┐
//! dropped-frame signal   ──┤
//! transcription open     ──┤
//! transcription fragments ─┼─> select! ─> state machine ─> outbound events
//! suggestion completion  ──┤
//! silence / idle timers  ──┘
//! ```
//!
//! Anything that can take a while (opening the transcription stream with its
//! retries, a suggestion request) runs as a separate task the loop only joins,
//! so `stop` and disconnects are always handled as soon as they arrive.
//!
//! ## Ordering Guarantees:
//! - `transcript` (final) for an utterance is sent before its suggestion is even
//!   requested, so it always precedes the `suggestion` event
//! - at most one suggestion request is in flight; one newer utterance may wait in
//!   a single queue slot and a still newer one replaces it
//! - `status` is emitted whenever the client-visible state changes

use crate::audio::buffer::{AudioBufferConfig, AudioChunk, AudioIngestBuffer};
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::relay::events::{OutboundEvent, RelayCommand};
use crate::relay::registry::{RegistryError, RelayRegistry, SessionRegistration};
use crate::relay::session::{Session, SessionContext, SessionId, SessionStatus, UtteranceHistory};
use crate::relay::state::{transition, RelayState, Severity, Trigger};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::state::RelayMetrics;
use crate::suggestion::{request_suggestion, Suggestion, SuggestionAdapter, SuggestionError};
use crate::transcription::{
    AggregatorConfig, FeedError, FragmentOutcome, FragmentResult, TranscriptionAdapter,
    TranscriptionError, TranscriptionStream, Utterance, UtteranceAggregator,
};
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Per-session tuning, derived from `AppConfig`.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub buffer: AudioBufferConfig,
    pub aggregator: AggregatorConfig,
    pub inbox_capacity: usize,
    pub outbound_capacity: usize,
    pub idle_timeout: Duration,
    pub drain_grace: Duration,
    pub context_utterances: usize,
    pub transcription_open_timeout: Duration,
    pub transcription_retry: RetryPolicy,
    pub suggestion_timeout: Duration,
    pub suggestion_retry: RetryPolicy,
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            buffer: config.audio.to_buffer_config(),
            aggregator: config.aggregator.to_aggregator_config(),
            inbox_capacity: config.relay.inbox_capacity,
            outbound_capacity: config.relay.outbound_capacity,
            idle_timeout: Duration::from_millis(config.relay.idle_timeout_ms),
            drain_grace: Duration::from_millis(config.relay.drain_grace_ms),
            context_utterances: config.relay.context_utterances,
            transcription_open_timeout: Duration::from_millis(config.transcription.open_timeout_ms),
            transcription_retry: RetryPolicy::new(
                config.transcription.max_retries,
                Duration::from_millis(config.transcription.retry_backoff_ms),
            ),
            suggestion_timeout: Duration::from_millis(config.suggestion.timeout_ms),
            suggestion_retry: RetryPolicy::new(
                config.suggestion.max_retries,
                Duration::from_millis(config.suggestion.retry_backoff_ms),
            ),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Shared collaborators every relay needs.
#[derive(Clone)]
pub struct RelayDeps {
    pub transcription: Arc<dyn TranscriptionAdapter>,
    pub suggestion: Arc<dyn SuggestionAdapter>,
    pub registry: Arc<RelayRegistry>,
    pub metrics: Arc<RelayMetrics>,
}

/// Audio frames the transport could not hand over because the relay inbox was full.
///
/// The transport only counts them. The relay picks the count up and reports it
/// as an `overflow` error on its own outbound channel.
#[derive(Debug, Default)]
pub struct DroppedFrames {
    count: AtomicU64,
    notify: Notify,
}

impl DroppedFrames {
    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn take(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }
}

/// The transport's end of a running relay.
pub struct RelayConnection {
    pub session_id: SessionId,
    pub commands: mpsc::Sender<RelayCommand>,
    pub events: mpsc::Receiver<OutboundEvent>,
    pub dropped: Arc<DroppedFrames>,
}

type OpenResult = Result<TranscriptionStream, TranscriptionError>;

struct InFlight {
    utterance_id: u64,
    handle: JoinHandle<Result<Suggestion, SuggestionError>>,
}

pub struct SessionRelay {
    session: Session,
    settings: RelaySettings,
    deps: RelayDeps,

    inbox: mpsc::Receiver<RelayCommand>,
    dropped: Arc<DroppedFrames>,
    outbound: mpsc::Sender<OutboundEvent>,
    status: watch::Sender<SessionStatus>,

    buffer: AudioIngestBuffer,
    aggregator: UtteranceAggregator,
    history: UtteranceHistory,
    stream: Option<TranscriptionStream>,
    opening: Option<JoinHandle<OpenResult>>,
    stream_failures: u32,

    in_flight: Option<InFlight>,
    queued: Option<Utterance>,

    /// Last audio or suggestion completion, for the idle timeout
    idle_since: Instant,
    client_gone: bool,
}

impl SessionRelay {
    /// Register a session and spawn its relay task.
    ///
    /// ## Returns:
    /// - **Ok(RelayConnection)**: channels for the transport to drive the relay
    /// - **Err(CapacityExceeded)**: the registry is full; nothing was spawned
    pub async fn start(
        session: Session,
        settings: RelaySettings,
        deps: RelayDeps,
    ) -> Result<RelayConnection, RegistryError> {
        let (commands, inbox) = mpsc::channel(settings.inbox_capacity.max(1));
        let (outbound, events) = mpsc::channel(settings.outbound_capacity.max(1));
        let (status, status_rx) = watch::channel(session.status());
        let dropped = Arc::new(DroppedFrames::default());
        let session_id = session.id;

        let registration = SessionRegistration::new(&session, status_rx, commands.downgrade());
        if let Err(err) = deps.registry.register(registration).await {
            deps.metrics.sessions_refused.inc();
            warn!(session_id = %session_id, error = %err, "Session refused");
            return Err(err);
        }
        deps.metrics.sessions_started.inc();

        let registry = deps.registry.clone();
        let relay = SessionRelay {
            buffer: AudioIngestBuffer::new(settings.buffer.clone()),
            aggregator: UtteranceAggregator::new(settings.aggregator.clone()),
            history: UtteranceHistory::new(settings.context_utterances),
            stream: None,
            opening: None,
            stream_failures: 0,
            in_flight: None,
            queued: None,
            idle_since: Instant::now(),
            client_gone: false,
            session,
            settings,
            deps,
            inbox,
            dropped: dropped.clone(),
            outbound,
            status,
        };

        let handle = tokio::spawn(relay.run());
        if registry.attach_task(session_id, handle.abort_handle()).await.is_err() {
            debug!(session_id = %session_id, "Relay finished before its task could be attached");
        }

        Ok(RelayConnection {
            session_id,
            commands,
            events,
            dropped,
        })
    }

    async fn run(mut self) {
        info!(
            session_id = %self.session.id,
            user_id = ?self.session.user_id,
            "Session relay started"
        );
        self.emit(OutboundEvent::status(self.session.state.wire())).await;

        while self.session.state != RelayState::Closed {
            if self.session.state == RelayState::Draining {
                self.drain().await;
                continue;
            }

            let silence_deadline = self.aggregator.silence_deadline();
            let idle_deadline = self.idle_deadline();

            tokio::select! {
                command = self.inbox.recv() => {
                    self.handle_command(command.unwrap_or(RelayCommand::Disconnected)).await;
                }
                _ = self.dropped.notify.notified() => {
                    self.report_dropped_frames().await;
                }
                opened = join_task(&mut self.opening) => {
                    self.handle_opened(opened).await;
                }
                fragment = next_fragment(&mut self.stream) => {
                    self.handle_fragment(fragment).await;
                }
                joined = join_suggestion(&mut self.in_flight) => {
                    self.handle_suggestion(joined).await;
                }
                _ = sleep_until_some(silence_deadline) => {
                    if let Some(utterance) = self.aggregator.poll_silence(Instant::now()) {
                        self.on_utterance(utterance).await;
                    }
                }
                _ = sleep_until_some(idle_deadline) => {
                    info!(session_id = %self.session.id, "Session idle, draining");
                    self.apply(Trigger::IdleTimeout).await;
                }
            }
        }

        info!(session_id = %self.session.id, "Session relay finished");
    }

    async fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Start => {
                self.touch();
                if self.session.state == RelayState::Connecting {
                    self.apply(Trigger::Start).await;
                    self.ensure_stream();
                } else {
                    debug!(session_id = %self.session.id, "Ignoring start on a running session");
                }
            }
            RelayCommand::Audio(data) => {
                let chunk = AudioChunk::new(self.buffer.next_sequence(), data);
                self.ingest(chunk).await;
            }
            RelayCommand::Chunk(chunk) => self.ingest(chunk).await,
            RelayCommand::Stop => {
                info!(session_id = %self.session.id, "Client requested stop");
                self.cancel_suggestions();
                self.apply(Trigger::Stop).await;
            }
            RelayCommand::Disconnected => {
                info!(session_id = %self.session.id, "Client disconnected");
                self.cancel_suggestions();
                self.apply(Trigger::Disconnect).await;
            }
            RelayCommand::Malformed(reason) => {
                self.report(RelayError::MalformedMessage(reason)).await;
            }
            RelayCommand::Shutdown => {
                info!(session_id = %self.session.id, "Shutdown requested");
                self.apply(Trigger::Shutdown).await;
            }
        }
    }

    async fn ingest(&mut self, chunk: AudioChunk) {
        if !self.session.state.accepts_audio() {
            self.report(RelayError::Draining).await;
            return;
        }
        self.touch();

        let sequence = chunk.sequence();
        if let Err(reason) = self.buffer.accept(chunk) {
            self.deps.metrics.chunks_rejected.inc();
            debug!(session_id = %self.session.id, sequence, reason = %reason, "Audio chunk rejected");
            self.publish_status();
            self.report(RelayError::Rejected(reason)).await;
            return;
        }
        self.deps.metrics.chunks_accepted.inc();

        if self.session.state == RelayState::Connecting {
            self.apply(Trigger::AudioAccepted).await;
        }
        self.ensure_stream();
        self.forward_pending();
    }

    async fn report_dropped_frames(&mut self) {
        let dropped = self.dropped.take();
        if dropped == 0 {
            return;
        }
        self.deps.metrics.chunks_rejected.inc();
        self.report(RelayError::InboxFull { dropped }).await;
    }

    /// Hand pending chunks to the transcription stream until it is full.
    fn forward_pending(&mut self) {
        if let Some(stream) = self.stream.as_ref() {
            while let Some(chunk) = self.buffer.front() {
                match stream.feed(chunk.clone()) {
                    Ok(()) => {
                        self.buffer.pop_front();
                    }
                    Err(FeedError::Full(_)) => break,
                    Err(FeedError::Closed) => {
                        debug!(session_id = %self.session.id, "Transcription stream stopped taking audio");
                        break;
                    }
                }
            }
        }
        self.publish_status();
    }

    /// Start opening the transcription stream unless it is open or already opening.
    fn ensure_stream(&mut self) {
        if self.stream.is_none() && self.opening.is_none() {
            self.begin_open(Duration::ZERO);
        }
    }

    /// Open the stream on a separate task after `delay`.
    ///
    /// Transient failures and timeouts are retried with backoff inside the task;
    /// a failure that survives the retry budget comes back through
    /// [`handle_opened`](Self::handle_opened) and is fatal to the session.
    fn begin_open(&mut self, delay: Duration) {
        let adapter = self.deps.transcription.clone();
        let context = self.context_for(self.aggregator.next_utterance_id());
        let open_timeout = self.settings.transcription_open_timeout;
        let retry = self.settings.transcription_retry;

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            retry_with_backoff(
                &retry,
                "transcription open",
                || {
                    let adapter = adapter.clone();
                    let context = context.clone();
                    async move {
                        match tokio::time::timeout(open_timeout, adapter.open(&context)).await {
                            Ok(result) => result,
                            Err(_) => Err(TranscriptionError::Timeout(open_timeout)),
                        }
                    }
                },
                TranscriptionError::is_retryable,
            )
            .await
        });

        if let Some(previous) = self.opening.replace(task) {
            previous.abort();
        }
    }

    async fn handle_opened(&mut self, opened: Result<OpenResult, JoinError>) {
        self.opening = None;

        match opened {
            Ok(Ok(stream)) => {
                debug!(
                    session_id = %self.session.id,
                    provider = self.deps.transcription.name(),
                    "Transcription stream open"
                );
                self.stream = Some(stream);
                self.forward_pending();
            }
            Ok(Err(err)) => self.report(RelayError::Transcription(err)).await,
            Err(join_error) if join_error.is_cancelled() => {
                debug!(session_id = %self.session.id, "Transcription open cancelled");
            }
            Err(join_error) => {
                error!(session_id = %self.session.id, error = %join_error, "Transcription open task failed");
                self.report(RelayError::Transcription(TranscriptionError::Unavailable(format!(
                    "transcription open failed: {}",
                    join_error
                ))))
                .await;
            }
        }
    }

    async fn reopen_stream(&mut self, cause: TranscriptionError) {
        self.stream = None;
        self.stream_failures += 1;

        if self.stream_failures > self.settings.transcription_retry.max_retries {
            self.report(RelayError::Transcription(cause)).await;
            return;
        }

        warn!(
            session_id = %self.session.id,
            failures = self.stream_failures,
            error = %cause,
            "Reopening transcription stream"
        );
        self.deps.metrics.transcription_reopens.inc();
        self.begin_open(self.settings.transcription_retry.delay_for(self.stream_failures - 1));
    }

    fn cancel_open(&mut self) {
        if let Some(opening) = self.opening.take() {
            debug!(session_id = %self.session.id, "Abandoning transcription open");
            opening.abort();
        }
    }

    async fn handle_fragment(&mut self, fragment: Option<FragmentResult>) {
        match fragment {
            Some(Ok(fragment)) => {
                self.stream_failures = 0;
                match self.aggregator.push(fragment, Instant::now()) {
                    FragmentOutcome::Provisional(text) => {
                        self.emit(OutboundEvent::provisional(text)).await;
                    }
                    FragmentOutcome::Finalized(utterance) => self.on_utterance(utterance).await,
                    FragmentOutcome::Ignored(reason) => {
                        debug!(session_id = %self.session.id, ?reason, "Transcript fragment ignored");
                    }
                }
                self.forward_pending();
            }
            Some(Err(err)) if err.is_retryable() => self.reopen_stream(err).await,
            Some(Err(err)) => self.report(RelayError::Transcription(err)).await,
            None => {
                self.reopen_stream(TranscriptionError::Transient(
                    "transcription stream ended unexpectedly".to_string(),
                ))
                .await;
            }
        }
    }

    async fn on_utterance(&mut self, utterance: Utterance) {
        self.deps.metrics.utterances_finalized.inc();
        info!(
            session_id = %self.session.id,
            utterance_id = utterance.id,
            forced = utterance.forced,
            low_confidence = utterance.low_confidence,
            "Utterance finalized"
        );

        self.emit(OutboundEvent::finalized(&utterance)).await;
        self.history.record(utterance.id, &utterance.text);

        if self.in_flight.is_none() {
            self.dispatch(utterance);
        } else if let Some(superseded) = self.queued.replace(utterance) {
            self.deps.metrics.utterances_superseded.inc();
            debug!(
                session_id = %self.session.id,
                utterance_id = superseded.id,
                "Queued utterance superseded by a newer one"
            );
        }
    }

    fn dispatch(&mut self, utterance: Utterance) {
        let adapter = self.deps.suggestion.clone();
        let context = self.context_for(utterance.id);
        let timeout = self.settings.suggestion_timeout;
        let retry = self.settings.suggestion_retry;
        let utterance_id = utterance.id;

        debug!(session_id = %self.session.id, utterance_id, "Requesting suggestion");
        let handle = tokio::spawn(async move {
            request_suggestion(adapter.as_ref(), &utterance, &context, timeout, &retry).await
        });
        self.in_flight = Some(InFlight { utterance_id, handle });
    }

    async fn handle_suggestion(&mut self, joined: Result<Result<Suggestion, SuggestionError>, JoinError>) {
        let Some(finished) = self.in_flight.take() else {
            return;
        };
        self.touch();
        self.deliver(finished.utterance_id, joined).await;

        if let Some(next) = self.queued.take() {
            self.dispatch(next);
        }
    }

    async fn deliver(
        &mut self,
        utterance_id: u64,
        joined: Result<Result<Suggestion, SuggestionError>, JoinError>,
    ) {
        match joined {
            Ok(Ok(suggestion)) => {
                self.deps.metrics.suggestions_delivered.inc();
                info!(
                    session_id = %self.session.id,
                    utterance_id,
                    latency_ms = suggestion.latency.as_millis() as u64,
                    "Suggestion ready"
                );
                self.emit(OutboundEvent::suggestion(&suggestion)).await;
            }
            Ok(Err(source)) => {
                self.deps.metrics.suggestion_failures.inc();
                self.report(RelayError::Suggestion { utterance_id, source }).await;
            }
            Err(join_error) if join_error.is_cancelled() => {
                debug!(session_id = %self.session.id, utterance_id, "Suggestion request cancelled");
            }
            Err(join_error) => {
                error!(session_id = %self.session.id, utterance_id, error = %join_error, "Suggestion task failed");
                self.deps.metrics.suggestion_failures.inc();
                self.report(RelayError::Suggestion {
                    utterance_id,
                    source: SuggestionError::Unavailable(format!("suggestion task failed: {}", join_error)),
                })
                .await;
            }
        }
    }

    /// Abort the outstanding request and forget the queued utterance.
    fn cancel_suggestions(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            debug!(
                session_id = %self.session.id,
                utterance_id = in_flight.utterance_id,
                "Cancelling outstanding suggestion"
            );
            in_flight.handle.abort();
        }
        self.queued = None;
    }

    /// Stop taking audio, give the outstanding suggestion a bounded grace period,
    /// then close.
    async fn drain(&mut self) {
        info!(session_id = %self.session.id, "Draining session");

        self.cancel_open();
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        let discarded = self.buffer.clear();
        if discarded > 0 {
            debug!(session_id = %self.session.id, discarded, "Discarding audio that was never forwarded");
        }
        if let Some(queued) = self.queued.take() {
            debug!(session_id = %self.session.id, utterance_id = queued.id, "Dropping queued utterance");
        }

        if let Some(mut in_flight) = self.in_flight.take() {
            let grace = tokio::time::sleep(self.settings.drain_grace);
            tokio::pin!(grace);

            loop {
                tokio::select! {
                    joined = &mut in_flight.handle => {
                        self.deliver(in_flight.utterance_id, joined).await;
                        break;
                    }
                    _ = &mut grace => {
                        in_flight.handle.abort();
                        self.report(RelayError::Suggestion {
                            utterance_id: in_flight.utterance_id,
                            source: SuggestionError::Timeout(self.settings.drain_grace),
                        })
                        .await;
                        break;
                    }
                    command = self.inbox.recv() => match command {
                        Some(command @ (RelayCommand::Audio(_) | RelayCommand::Chunk(_))) => {
                            self.handle_command(command).await;
                        }
                        Some(RelayCommand::Stop) | Some(RelayCommand::Disconnected) | None => {
                            in_flight.handle.abort();
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }
        }

        self.apply(Trigger::Drained).await;
        self.deps.registry.unregister(self.session.id).await;
        self.deps.metrics.sessions_closed.inc();
        info!(session_id = %self.session.id, "Session closed");
    }

    /// Emit an `error` event and run the fault through the state machine.
    async fn report(&mut self, err: RelayError) {
        let fatal = err.is_fatal();
        if fatal {
            error!(session_id = %self.session.id, code = %err.code(), error = %err, "Fatal session error");
        } else {
            warn!(session_id = %self.session.id, code = %err.code(), error = %err, "Session error");
        }

        self.deps.metrics.errors_reported.inc();
        self.emit(OutboundEvent::error(&err)).await;

        let severity = if fatal { Severity::Fatal } else { Severity::NonFatal };
        self.apply(Trigger::Fault(severity)).await;
        if self.session.state == RelayState::Erroring {
            self.apply(Trigger::Recovered).await;
        }
    }

    async fn apply(&mut self, trigger: Trigger) {
        let from = self.session.state;
        match transition(from, trigger) {
            Ok(to) if to != from => {
                debug!(
                    session_id = %self.session.id,
                    from = from.as_str(),
                    to = to.as_str(),
                    ?trigger,
                    "State change"
                );
                self.session.state = to;
                self.publish_status();

                if to.wire() != from.wire() {
                    self.emit(OutboundEvent::status(to.wire())).await;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(session_id = %self.session.id, error = %err, "Ignoring invalid state transition");
            }
        }
    }

    async fn emit(&mut self, event: OutboundEvent) {
        if self.client_gone {
            return;
        }
        if self.outbound.send(event).await.is_err() {
            debug!(session_id = %self.session.id, "Client connection gone, discarding further events");
            self.client_gone = true;
        }
    }

    fn touch(&mut self) {
        self.session.touch();
        self.idle_since = Instant::now();
        self.publish_status();
    }

    /// Let the registry see the current state, activity and ingest counters.
    fn publish_status(&self) {
        self.status.send_replace(SessionStatus {
            ingest: self.buffer.diagnostics(),
            ..self.session.status()
        });
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if self.in_flight.is_some() || self.queued.is_some() {
            return None;
        }
        Some(self.idle_since + self.settings.idle_timeout)
    }

    fn context_for(&self, utterance_id: u64) -> SessionContext {
        SessionContext {
            session_id: self.session.id,
            user_id: self.session.user_id.clone(),
            audio_position_ms: self.buffer.forwarded_ms(),
            recent_utterances: self.history.before(utterance_id),
        }
    }
}

impl Drop for SessionRelay {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
        }
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
    }
}

async fn next_fragment(stream: &mut Option<TranscriptionStream>) -> Option<FragmentResult> {
    match stream {
        Some(stream) => stream.next_fragment().await,
        None => pending().await,
    }
}

async fn join_task<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => pending().await,
    }
}

async fn join_suggestion(
    in_flight: &mut Option<InFlight>,
) -> Result<Result<Suggestion, SuggestionError>, JoinError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
