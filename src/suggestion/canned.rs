//! Offline suggestion backend. Answers every utterance with generic interview advice.

use crate::relay::session::SessionContext;
use crate::suggestion::{SuggestionAdapter, SuggestionError};
use crate::transcription::Utterance;
use async_trait::async_trait;

pub const FALLBACK_SUGGESTION: &str =
    "Structure your answer with specific examples and focus on your relevant experience.";

const BEHAVIOURAL_SUGGESTION: &str =
    "Use the STAR method: describe the Situation, your Task, the Actions you took and the Result.";

#[derive(Debug, Default)]
pub struct CannedSuggestionAdapter;

impl CannedSuggestionAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SuggestionAdapter for CannedSuggestionAdapter {
    fn name(&self) -> &str {
        "canned"
    }

    async fn generate(
        &self,
        utterance: &Utterance,
        _context: &SessionContext,
    ) -> Result<String, SuggestionError> {
        let question = utterance.text.to_lowercase();
        let behavioural = ["tell me about a time", "challenge", "conflict", "describe a situation"]
            .iter()
            .any(|cue| question.contains(cue));

        Ok(if behavioural {
            BEHAVIOURAL_SUGGESTION.to_string()
        } else {
            FALLBACK_SUGGESTION.to_string()
        })
    }
}
