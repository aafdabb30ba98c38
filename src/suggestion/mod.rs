//! # Suggestion Module
//!
//! Produces answer suggestions for finalized utterances.
//!
//! ## Key Components:
//! - **SuggestionAdapter**: capability trait over an LLM-style backend
//! - **request_suggestion**: per-call timeout, bounded retries, latency measurement
//! - **CredentialProvider**: resolves the API key for the session's user
//! - **Adapters**: `gemini` (Google Generative Language REST) and `canned` (offline)

pub mod canned;
pub mod gemini;

pub use canned::CannedSuggestionAdapter;
pub use gemini::GeminiSuggestionAdapter;

use crate::config::SuggestionConfig;
use crate::relay::session::SessionContext;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transcription::Utterance;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Suggestion text produced for one utterance. Never mutated after emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub utterance_id: u64,
    pub text: String,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuggestionError {
    #[error("suggestion backend did not respond within {0:?}")]
    Timeout(Duration),

    /// Rate limit, 5xx, dropped connection
    #[error("transient suggestion backend error: {0}")]
    Transient(String),

    #[error("suggestion backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but the answer could not be used
    #[error("malformed suggestion response: {0}")]
    InvalidResponse(String),
}

impl SuggestionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SuggestionError::Timeout(_) | SuggestionError::Transient(_))
    }
}

/// Capability interface over a suggestion backend.
#[async_trait]
pub trait SuggestionAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Suggestion text for `utterance`, given what else is known about the session.
    async fn generate(
        &self,
        utterance: &Utterance,
        context: &SessionContext,
    ) -> Result<String, SuggestionError>;
}

/// Resolves backend credentials per user. Credential storage lives outside the relay.
pub trait CredentialProvider: Send + Sync {
    fn api_key(&self, user_id: Option<&str>) -> Option<String>;
}

/// Hands out the same configured key for every user.
pub struct StaticCredentials {
    api_key: Option<String>,
}

impl StaticCredentials {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn api_key(&self, _user_id: Option<&str>) -> Option<String> {
        self.api_key.clone()
    }
}

/// Generate a suggestion with a per-call timeout and bounded retries.
///
/// Latency covers every attempt, including backoff.
pub async fn request_suggestion(
    adapter: &dyn SuggestionAdapter,
    utterance: &Utterance,
    context: &SessionContext,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<Suggestion, SuggestionError> {
    let started = Instant::now();

    let text = retry_with_backoff(
        retry,
        "suggestion",
        move || async move {
            match tokio::time::timeout(timeout, adapter.generate(utterance, context)).await {
                Ok(result) => result,
                Err(_) => Err(SuggestionError::Timeout(timeout)),
            }
        },
        SuggestionError::is_retryable,
    )
    .await?;

    Ok(Suggestion {
        utterance_id: utterance.id,
        text,
        latency: started.elapsed(),
    })
}

/// Build the adapter selected by `suggestion.provider`.
pub fn create_adapter(config: &SuggestionConfig) -> anyhow::Result<Arc<dyn SuggestionAdapter>> {
    match config.provider.as_str() {
        "canned" => Ok(Arc::new(CannedSuggestionAdapter::new())),
        "gemini" => {
            let credentials = Arc::new(StaticCredentials::new(config.api_key.clone()));
            Ok(Arc::new(GeminiSuggestionAdapter::new(
                config.api_base.clone(),
                config.model.clone(),
                credentials,
            )?))
        }
        other => Err(anyhow::anyhow!("Unknown suggestion provider: {}", other)),
    }
}
