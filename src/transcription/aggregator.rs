//! # Utterance Aggregation
//!
//! Turns the stream of incremental [`TranscriptFragment`]s from a transcription
//! backend into finalized [`Utterance`]s, one per interviewer turn.
//!
//! ## Finalization Rules:
//! - **Final fragment**: finalizes immediately. Provisional text over the same span
//!   is superseded, never concatenated
//! - **Silence**: if nothing arrives for `silence_threshold` while provisional text
//!   is pending, the best available text is finalized and flagged low-confidence
//! - **Replays**: fragments ending at or before the last finalized span, and exact
//!   repeats of the previous final, are dropped. Backends may replay after a
//!   reconnect
//!
//! ## Time:
//! Silence is measured with `tokio::time::Instant` so tests can drive it with a
//! paused clock. The caller passes `now` in; the aggregator never sleeps.

use crate::transcription::TranscriptFragment;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// A finalized unit of speech. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    /// Monotonic per session, starting at 1
    pub id: u64,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub confidence: f32,

    /// Finalized from provisional text only
    pub low_confidence: bool,

    /// Finalized by the silence timeout rather than a final fragment
    pub forced: bool,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub silence_threshold: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_millis(1_500),
        }
    }
}

/// Why a fragment did not change the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Empty,
    Replay,
}

/// What [`UtteranceAggregator::push`] did with a fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    /// Provisional text updated; carries the text to show the client
    Provisional(String),
    Finalized(Utterance),
    Ignored(IgnoreReason),
}

pub struct UtteranceAggregator {
    config: AggregatorConfig,
    next_id: u64,

    /// Provisional fragments, at most one per distinct span
    provisional: Vec<TranscriptFragment>,
    first_fragment_at: Option<DateTime<Utc>>,
    last_fragment_at: Option<Instant>,

    /// End of the newest span that has been finalized
    finalized_until_ms: Option<u64>,
    last_final: Option<TranscriptFragment>,
}

impl UtteranceAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            next_id: 1,
            provisional: Vec::new(),
            first_fragment_at: None,
            last_fragment_at: None,
            finalized_until_ms: None,
            last_final: None,
        }
    }

    /// Feed one fragment received at `now`.
    pub fn push(&mut self, fragment: TranscriptFragment, now: Instant) -> FragmentOutcome {
        if self.is_replay(&fragment) {
            return FragmentOutcome::Ignored(IgnoreReason::Replay);
        }

        if fragment.text.trim().is_empty() {
            if fragment.is_final {
                // An empty final retracts whatever was provisionally heard over its span
                self.provisional.retain(|p| !p.overlaps(&fragment) && p.start_ms >= fragment.end_ms);
                self.finalized_until_ms = Some(self.finalized_until_ms.unwrap_or(0).max(fragment.end_ms));
                self.reset_timing_if_idle();
            }
            return FragmentOutcome::Ignored(IgnoreReason::Empty);
        }

        self.first_fragment_at.get_or_insert_with(Utc::now);
        self.last_fragment_at = Some(now);

        if fragment.is_final {
            return FragmentOutcome::Finalized(self.finalize_final(fragment));
        }

        let text = fragment.text.trim().to_string();
        match self.provisional.iter_mut().find(|p| p.overlaps(&fragment)) {
            Some(existing) => *existing = fragment,
            None => {
                self.provisional.push(fragment);
                self.provisional.sort_by_key(|p| p.start_ms);
            }
        }
        FragmentOutcome::Provisional(text)
    }

    /// When the silence timeout will force finalization, if anything is pending.
    pub fn silence_deadline(&self) -> Option<Instant> {
        if !self.has_pending() {
            return None;
        }
        self.last_fragment_at
            .map(|last| last + self.config.silence_threshold)
    }

    /// Force-finalize pending text if the silence deadline has passed.
    pub fn poll_silence(&mut self, now: Instant) -> Option<Utterance> {
        match self.silence_deadline() {
            Some(deadline) if deadline <= now => self.force_finalize(),
            _ => None,
        }
    }

    /// Finalize whatever provisional text is pending, flagged low-confidence.
    pub fn force_finalize(&mut self) -> Option<Utterance> {
        if !self.has_pending() {
            return None;
        }

        let pending = std::mem::take(&mut self.provisional);
        let text = pending
            .iter()
            .map(|p| p.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        let confidence = pending
            .iter()
            .map(|p| p.confidence)
            .fold(1.0f32, f32::min);
        let end_ms = pending.iter().map(|p| p.end_ms).max().unwrap_or(0);

        self.finalized_until_ms = Some(self.finalized_until_ms.unwrap_or(0).max(end_ms));
        Some(self.build_utterance(text, confidence, true))
    }

    /// Whether provisional text is waiting to be finalized.
    pub fn has_pending(&self) -> bool {
        !self.provisional.is_empty()
    }

    /// Id the next utterance will get.
    pub fn next_utterance_id(&self) -> u64 {
        self.next_id
    }

    fn is_replay(&self, fragment: &TranscriptFragment) -> bool {
        if fragment.is_final && self.last_final.as_ref() == Some(fragment) {
            return true;
        }
        match self.finalized_until_ms {
            Some(until) if until > 0 => fragment.end_ms <= until,
            _ => false,
        }
    }

    fn finalize_final(&mut self, fragment: TranscriptFragment) -> Utterance {
        // Provisional text up to the end of this span is superseded
        self.provisional
            .retain(|p| !p.overlaps(&fragment) && p.start_ms >= fragment.end_ms);
        self.finalized_until_ms = Some(self.finalized_until_ms.unwrap_or(0).max(fragment.end_ms));

        let text = fragment.text.trim().to_string();
        let confidence = fragment.confidence;
        self.last_final = Some(fragment);
        self.build_utterance(text, confidence, false)
    }

    fn build_utterance(&mut self, text: String, confidence: f32, forced: bool) -> Utterance {
        let id = self.next_id;
        self.next_id += 1;

        let ended_at = Utc::now();
        let started_at = self.first_fragment_at.take().unwrap_or(ended_at);
        self.reset_timing_if_idle();

        Utterance {
            id,
            text,
            started_at,
            ended_at,
            confidence,
            low_confidence: forced,
            forced,
        }
    }

    fn reset_timing_if_idle(&mut self) {
        if self.provisional.is_empty() {
            self.first_fragment_at = None;
            self.last_fragment_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> UtteranceAggregator {
        UtteranceAggregator::new(AggregatorConfig {
            silence_threshold: Duration::from_millis(1_000),
        })
    }

    #[test]
    fn test_partials_then_final_make_one_utterance() {
        let mut agg = aggregator();
        let now = Instant::now();

        assert_eq!(
            agg.push(TranscriptFragment::partial("Tell", 0, 300), now),
            FragmentOutcome::Provisional("Tell".to_string())
        );
        assert_eq!(
            agg.push(TranscriptFragment::partial("Tell me about", 0, 900), now),
            FragmentOutcome::Provisional("Tell me about".to_string())
        );

        let outcome = agg.push(TranscriptFragment::finished("Tell me about a challenge.", 0, 1500), now);
        let FragmentOutcome::Finalized(utterance) = outcome else {
            panic!("expected a finalized utterance, got {:?}", outcome);
        };
        assert_eq!(utterance.id, 1);
        assert_eq!(utterance.text, "Tell me about a challenge.");
        assert!(!utterance.low_confidence);
        assert!(!utterance.forced);
        assert!(!agg.has_pending());
        assert!(agg.silence_deadline().is_none());
    }

    #[test]
    fn test_one_utterance_per_final_boundary() {
        let mut agg = aggregator();
        let now = Instant::now();
        let fragments = vec![
            TranscriptFragment::partial("What", 0, 200),
            TranscriptFragment::finished("What is Rust?", 0, 800),
            TranscriptFragment::partial("Why", 800, 1000),
            TranscriptFragment::partial("Why do you", 800, 1300),
            TranscriptFragment::finished("Why do you want this job?", 800, 2000),
        ];

        let utterances: Vec<Utterance> = fragments
            .into_iter()
            .filter_map(|f| match agg.push(f, now) {
                FragmentOutcome::Finalized(u) => Some(u),
                _ => None,
            })
            .collect();

        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0].id, 1);
        assert_eq!(utterances[1].id, 2);
        assert_eq!(utterances[1].text, "Why do you want this job?");
    }

    #[test]
    fn test_replayed_fragments_are_dropped() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.push(TranscriptFragment::finished("First question.", 0, 1000), now);

        // A reconnected backend replays audio it had already recognized
        assert_eq!(
            agg.push(TranscriptFragment::partial("First", 0, 400), now),
            FragmentOutcome::Ignored(IgnoreReason::Replay)
        );
        assert_eq!(
            agg.push(TranscriptFragment::finished("First question.", 0, 1000), now),
            FragmentOutcome::Ignored(IgnoreReason::Replay)
        );
        assert!(matches!(
            agg.push(TranscriptFragment::finished("Second question.", 1000, 2000), now),
            FragmentOutcome::Finalized(Utterance { id: 2, .. })
        ));
    }

    #[test]
    fn test_empty_fragments_never_finalize() {
        let mut agg = aggregator();
        let now = Instant::now();
        assert_eq!(
            agg.push(TranscriptFragment::partial("   ", 0, 100), now),
            FragmentOutcome::Ignored(IgnoreReason::Empty)
        );
        assert_eq!(
            agg.push(TranscriptFragment::finished("", 0, 200), now),
            FragmentOutcome::Ignored(IgnoreReason::Empty)
        );
        assert_eq!(agg.next_utterance_id(), 1);
    }

    #[test]
    fn test_silence_forces_low_confidence_utterance() {
        let mut agg = aggregator();
        let start = Instant::now();
        agg.push(TranscriptFragment::partial("So tell me", 0, 600).with_confidence(0.4), start);
        agg.push(
            TranscriptFragment::partial("So tell me about yourself", 0, 1200).with_confidence(0.6),
            start + Duration::from_millis(200),
        );

        let deadline = agg.silence_deadline().unwrap();
        assert_eq!(deadline, start + Duration::from_millis(1_200));
        assert!(agg.poll_silence(start + Duration::from_millis(1_100)).is_none());

        let utterance = agg.poll_silence(deadline).unwrap();
        assert_eq!(utterance.text, "So tell me about yourself");
        assert!(utterance.low_confidence);
        assert!(utterance.forced);
        assert_eq!(utterance.confidence, 0.6);
        assert!(agg.poll_silence(deadline + Duration::from_secs(5)).is_none());

        // The late final for the same span is a replay now
        assert_eq!(
            agg.push(TranscriptFragment::finished("So tell me about yourself.", 0, 1200), deadline),
            FragmentOutcome::Ignored(IgnoreReason::Replay)
        );
    }

    #[test]
    fn test_provisional_after_final_span_survives() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.push(TranscriptFragment::partial("Next", 1000, 1200), now);
        agg.push(TranscriptFragment::finished("Done.", 0, 1000), now);

        assert!(agg.has_pending());
        let forced = agg.force_finalize().unwrap();
        assert_eq!(forced.text, "Next");
        assert_eq!(forced.id, 2);
    }
}
