//! # Configuration Management
//!
//! This module loads the relay's configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: every section derives `Serialize` and `Deserialize`, so the defaults can be
//!   fed to the `config` crate as a source and the merged result read back into structs
//! - **Nested structs**: one struct per concern (server, relay, audio, ...) keeps each
//!   group of knobs next to the code that uses it
//! - **Result<T, E>**: loading and validation both return `anyhow::Result`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms) and `GOOGLE_API_KEY`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_RELAY__IDLE_TIMEOUT_MS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! ## Why a double underscore:
//! Field names such as `idle_timeout_ms` already contain underscores, so `__` separates
//! the section from the field: `APP_RELAY__IDLE_TIMEOUT_MS` becomes `relay.idle_timeout_ms`.

use crate::audio::buffer::{AudioBufferConfig, AudioFormat};
use crate::transcription::AggregatorConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: `Serialize` turns the defaults into a config source,
///   `Deserialize` reads the merged result back
/// - **#[serde(default)]**: a config file only has to mention the sections it changes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub audio: AudioConfig,
    pub aggregator: UtteranceConfig,
    pub transcription: TranscriptionConfig,
    pub suggestion: SuggestionConfig,
}

/// HTTP listener and websocket keep-alive settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// How often the server pings each websocket client
    pub heartbeat_interval_secs: u64,

    /// Close a websocket that has not answered a ping for this long
    pub client_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            heartbeat_interval_secs: 15,
            client_timeout_secs: 45,
        }
    }
}

/// Session lifecycle and back-pressure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Sessions beyond this limit are refused at connect time
    pub max_concurrent_sessions: usize,

    /// A session with no inbound audio or control message for this long is drained
    pub idle_timeout_ms: u64,

    /// Time a draining session waits for in-flight work before closing
    pub drain_grace_ms: u64,

    /// Time the process waits for all sessions to drain on shutdown
    pub shutdown_grace_ms: u64,

    /// Commands queued from the transport into a relay
    pub inbox_capacity: usize,

    /// Events queued from a relay to the transport
    pub outbound_capacity: usize,

    /// Finalized utterances passed to the suggestion backend as context
    pub context_utterances: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            idle_timeout_ms: 120_000,
            drain_grace_ms: 5_000,
            shutdown_grace_ms: 10_000,
            inbox_capacity: 64,
            outbound_capacity: 64,
            context_utterances: 2,
        }
    }
}

/// Declared client audio format and ingest limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,

    /// Ceiling on audio waiting for the transcription stream
    pub max_buffered_ms: u64,

    /// Forwarded chunks kept for diagnostics
    pub diagnostic_window: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let buffer = AudioBufferConfig::default();
        Self {
            sample_rate: buffer.format.sample_rate,
            channels: buffer.format.channels,
            bit_depth: buffer.format.bit_depth,
            max_buffered_ms: buffer.max_buffered_ms,
            diagnostic_window: buffer.diagnostic_window,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
        }
    }

    pub fn to_buffer_config(&self) -> AudioBufferConfig {
        AudioBufferConfig {
            format: self.format(),
            max_buffered_ms: self.max_buffered_ms,
            diagnostic_window: self.diagnostic_window,
        }
    }
}

/// Utterance boundary detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtteranceConfig {
    /// Silence after the last fragment that closes an open utterance
    pub silence_threshold_ms: u64,
}

impl Default for UtteranceConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 1_500,
        }
    }
}

impl UtteranceConfig {
    pub fn to_aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            silence_threshold: Duration::from_millis(self.silence_threshold_ms),
        }
    }
}

/// Speech-to-text backend selection.
///
/// ## Providers:
/// - `mock`: scripted transcripts, no network access (the only built-in backend)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub provider: String,

    /// Time allowed for a recognition stream to open
    pub open_timeout_ms: u64,

    /// Retries when opening a stream fails with a transient error
    pub max_retries: u32,
    pub retry_backoff_ms: u64,

    /// Audio chunks queued towards the backend before `feed` pushes back
    pub stream_capacity: usize,

    /// Mock backend: audio chunks per scripted utterance
    pub mock_chunks_per_utterance: u32,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            open_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 250,
            stream_capacity: 32,
            mock_chunks_per_utterance: 20,
        }
    }
}

/// Suggestion backend selection.
///
/// ## Providers:
/// - `canned`: fixed coaching hints, no network access
/// - `gemini`: Google Generative Language API (requires `api_key`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionConfig {
    pub provider: String,
    pub model: String,
    pub api_base: String,

    /// Falls back to the `GOOGLE_API_KEY` environment variable
    pub api_key: Option<String>,

    /// Upper bound on one suggestion request, retries included
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            provider: "canned".to_string(),
            model: "gemini-1.5-flash".to_string(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: None,
            timeout_ms: 8_000,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and GOOGLE_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_RELAY__MAX_CONCURRENT_SESSIONS=50`: Raise the session limit
    /// - `APP_SUGGESTION__PROVIDER=gemini`: Use the Gemini backend
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        if config.suggestion.api_key.is_none() {
            config.suggestion.api_key = env::var("GOOGLE_API_KEY").ok().filter(|key| !key.is_empty());
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port and session limit are non-zero
    /// - The audio format can be turned into a byte rate
    /// - Every queue and timeout is non-zero
    /// - The Gemini backend has an API key
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0
            || self.server.client_timeout_secs <= self.server.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.inbox_capacity == 0 || self.relay.outbound_capacity == 0 {
            return Err(anyhow::anyhow!("Relay queue capacities must be greater than 0"));
        }

        if self.relay.idle_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channels must be greater than 0"));
        }

        if self.audio.bit_depth == 0 || self.audio.bit_depth % 8 != 0 {
            return Err(anyhow::anyhow!(
                "Audio bit depth must be a non-zero multiple of 8, got {}",
                self.audio.bit_depth
            ));
        }

        if self.audio.max_buffered_ms == 0 {
            return Err(anyhow::anyhow!("Audio buffer ceiling must be greater than 0"));
        }

        if self.aggregator.silence_threshold_ms == 0 {
            return Err(anyhow::anyhow!("Silence threshold must be greater than 0"));
        }

        if self.transcription.stream_capacity == 0 || self.transcription.open_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "Transcription stream capacity and open timeout must be greater than 0"
            ));
        }

        if self.suggestion.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Suggestion timeout must be greater than 0"));
        }

        if self.suggestion.provider == "gemini" && self.suggestion.api_key.is_none() {
            return Err(anyhow::anyhow!(
                "The gemini suggestion provider needs suggestion.api_key or GOOGLE_API_KEY"
            ));
        }

        Ok(())
    }
}
