//! # Application State
//!
//! Shared state handed to every actix-web handler through `web::Data<AppState>`.
//!
//! ## What is shared:
//! - **config**: loaded once at startup, read-only afterwards
//! - **registry**: the live session table (internally locked)
//! - **adapters**: one transcription and one suggestion backend, shared by all sessions
//! - **metrics**: lock-free counters updated by every relay
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<dyn Trait>
//! - **Arc**: every worker thread and every session task holds a cheap clone
//! - **dyn Trait**: the concrete backend is chosen from config at runtime
//!
//! ### Atomics instead of RwLock
//! Counters only ever go up and are read independently, so `AtomicU64` with
//! relaxed ordering is enough. No request ever waits on a metrics lock.

use crate::config::AppConfig;
use crate::relay::{RelayDeps, RelayRegistry, RelaySettings};
use crate::suggestion::{self, SuggestionAdapter};
use crate::transcription::{self, TranscriptionAdapter};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<RelayRegistry>,
    pub transcription: Arc<dyn TranscriptionAdapter>,
    pub suggestion: Arc<dyn SuggestionAdapter>,
    pub metrics: Arc<RelayMetrics>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

impl AppState {
    /// Build the state and the backends named in `config`.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let transcription = transcription::create_adapter(&config.transcription, config.audio.format())?;
        let suggestion = suggestion::create_adapter(&config.suggestion)?;
        Ok(Self::with_adapters(config, transcription, suggestion))
    }

    /// Build the state around already constructed backends.
    pub fn with_adapters(
        config: AppConfig,
        transcription: Arc<dyn TranscriptionAdapter>,
        suggestion: Arc<dyn SuggestionAdapter>,
    ) -> Self {
        Self {
            registry: Arc::new(RelayRegistry::new(config.relay.max_concurrent_sessions)),
            config: Arc::new(config),
            transcription,
            suggestion,
            metrics: Arc::new(RelayMetrics::default()),
            start_time: Instant::now(),
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings::from_config(&self.config)
    }

    pub fn relay_deps(&self) -> RelayDeps {
        RelayDeps {
            transcription: self.transcription.clone(),
            suggestion: self.suggestion.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Relay activity since server start.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub http_requests: Counter,
    pub http_errors: Counter,
    pub sessions_started: Counter,
    pub sessions_refused: Counter,
    pub sessions_closed: Counter,
    pub chunks_accepted: Counter,
    pub chunks_rejected: Counter,
    pub utterances_finalized: Counter,
    pub utterances_superseded: Counter,
    pub suggestions_delivered: Counter,
    pub suggestion_failures: Counter,
    pub transcription_reopens: Counter,
    pub errors_reported: Counter,
}

/// Point-in-time copy of [`RelayMetrics`] for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_refused: u64,
    pub sessions_closed: u64,
    pub chunks_accepted: u64,
    pub chunks_rejected: u64,
    pub utterances_finalized: u64,
    pub utterances_superseded: u64,
    pub suggestions_delivered: u64,
    pub suggestion_failures: u64,
    pub transcription_reopens: u64,
    pub errors_reported: u64,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.get(),
            sessions_refused: self.sessions_refused.get(),
            sessions_closed: self.sessions_closed.get(),
            chunks_accepted: self.chunks_accepted.get(),
            chunks_rejected: self.chunks_rejected.get(),
            utterances_finalized: self.utterances_finalized.get(),
            utterances_superseded: self.utterances_superseded.get(),
            suggestions_delivered: self.suggestions_delivered.get(),
            suggestion_failures: self.suggestion_failures.get(),
            transcription_reopens: self.transcription_reopens.get(),
            errors_reported: self.errors_reported.get(),
        }
    }
}
