//! # Gemini Suggestion Adapter
//!
//! Calls the Google Generative Language REST API (`models/{model}:generateContent`)
//! and returns the first candidate's text.
//!
//! ## Error Mapping:
//! - **429 / 5xx / network failures**: `Transient`, retried by the caller
//! - **401 / 403 / missing key**: `Unavailable`
//! - **other 4xx, unparseable or empty body**: `InvalidResponse`
//!
//! The per-call deadline is enforced by `request_suggestion`, not by reqwest.

use crate::relay::session::SessionContext;
use crate::suggestion::{CredentialProvider, SuggestionAdapter, SuggestionError};
use crate::transcription::Utterance;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct GeminiSuggestionAdapter {
    client: reqwest::Client,
    api_base: String,
    model: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GeminiSuggestionAdapter {
    pub fn new(
        api_base: String,
        model: String,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("interview-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
            credentials,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }
}

/// Prompt asking for brief, actionable advice on answering the interviewer.
pub fn build_prompt(utterance: &Utterance, context: &SessionContext) -> String {
    let mut prompt = format!("The user is being asked: \"{}\"\n", utterance.text);

    if !context.recent_utterances.is_empty() {
        prompt.push_str("\nEarlier in this interview they were asked:\n");
        for earlier in &context.recent_utterances {
            prompt.push_str(&format!("- {}\n", earlier));
        }
    }

    if utterance.low_confidence {
        prompt.push_str("\nThe question was transcribed with low confidence and may be incomplete.\n");
    }

    prompt.push_str(
        "\nProvide a concise, helpful suggestion for how to answer this question. Focus on:\n\
         1. Key points to cover\n\
         2. Structure for the answer\n\
         3. Specific examples if relevant\n\
         \n\
         Keep the suggestion brief (2-3 sentences) and actionable.",
    );
    prompt
}

/// Concatenate the text parts of the first candidate.
pub fn extract_text(body: &Value) -> Result<String, SuggestionError> {
    let parts = body["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| SuggestionError::InvalidResponse("response has no candidates".to_string()))?;

    let text = parts
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string();

    if text.is_empty() {
        return Err(SuggestionError::InvalidResponse(
            "candidate contains no text".to_string(),
        ));
    }
    Ok(text)
}

fn classify_status(status: StatusCode, body: &str) -> SuggestionError {
    let detail = format!("Gemini API error {}: {}", status, body.chars().take(200).collect::<String>());
    match status {
        StatusCode::TOO_MANY_REQUESTS => SuggestionError::Transient(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SuggestionError::Unavailable(detail),
        s if s.is_server_error() => SuggestionError::Transient(detail),
        _ => SuggestionError::InvalidResponse(detail),
    }
}

#[async_trait]
impl SuggestionAdapter for GeminiSuggestionAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(
        &self,
        utterance: &Utterance,
        context: &SessionContext,
    ) -> Result<String, SuggestionError> {
        let api_key = self
            .credentials
            .api_key(context.user_id.as_deref())
            .ok_or_else(|| SuggestionError::Unavailable("no API key configured for this user".to_string()))?;

        let payload = serde_json::json!({
            "contents": [{
                "parts": [{ "text": build_prompt(utterance, context) }]
            }],
            "generationConfig": {
                "temperature": 0.4,
                "maxOutputTokens": 256
            }
        });

        debug!(
            session_id = %context.session_id,
            utterance_id = utterance.id,
            model = %self.model,
            "Requesting suggestion from Gemini"
        );

        let resp = self
            .client
            .post(self.endpoint())
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| SuggestionError::Transient(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| SuggestionError::InvalidResponse(format!("response is not JSON: {}", e)))?;

        extract_text(&body)
    }
}
