//! Session metrics
//!
//! Token usage, response latency and the model in use. Replies that carry an
//! explicit token count are trusted; the rest get a character-class estimate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::router::AssistantReply;
use crate::store::StateField;

/// Estimates never go below this.
pub const MIN_ESTIMATED_TOKENS: u64 = 3;

// Per-character weights in hundredths of a token.
const ALNUM_WEIGHT: u64 = 25;
const WHITESPACE_WEIGHT: u64 = 15;
const PUNCTUATION_WEIGHT: u64 = 50;
const OTHER_WEIGHT: u64 = 100;

/// Rough token count for `text`: 0.25 per alphanumeric character, 0.15 per
/// whitespace, 0.5 per ASCII punctuation mark and 1.0 for anything else,
/// rounded up, never below [`MIN_ESTIMATED_TOKENS`].
pub fn estimate_tokens(text: &str) -> u64 {
    let hundredths: u64 = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                ALNUM_WEIGHT
            } else if c.is_whitespace() {
                WHITESPACE_WEIGHT
            } else if c.is_ascii_punctuation() {
                PUNCTUATION_WEIGHT
            } else {
                OTHER_WEIGHT
            }
        })
        .fold(0u64, u64::saturating_add);
    hundredths.div_ceil(100).max(MIN_ESTIMATED_TOKENS)
}

/// Point-in-time view of the aggregated metrics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_tokens: u64,
    pub completed_turns: u64,
    pub failed_turns: u64,
    /// Replies whose token count was estimated.
    pub estimated_replies: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_model: Option<String>,
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    total_tokens: u64,
    completed_turns: u64,
    failed_turns: u64,
    estimated_replies: u64,
    last_latency: Option<Duration>,
    current_model: Option<String>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one reply. `latency` is set when the reply completed a
    /// turn. Returns the store fields to apply and the tokens counted.
    pub fn record_reply(
        &mut self,
        reply: &AssistantReply,
        latency: Option<Duration>,
    ) -> (u64, Vec<StateField>) {
        let tokens = match reply.tokens {
            Some(tokens) => tokens,
            None => {
                self.estimated_replies += 1;
                estimate_tokens(&reply.text)
            }
        };
        self.total_tokens = self.total_tokens.saturating_add(tokens);

        let mut fields = vec![StateField::AddTokens(tokens)];
        if let Some(model) = &reply.model {
            self.current_model = Some(model.clone());
            fields.push(StateField::CurrentModel(model.clone()));
        }
        if let Some(latency) = latency {
            self.completed_turns += 1;
            self.last_latency = Some(latency);
            fields.push(StateField::LastLatencyMs(latency.as_millis() as u64));
        }

        debug!(
            tokens,
            estimated = reply.tokens.is_none(),
            total = self.total_tokens,
            "reply recorded"
        );
        (tokens, fields)
    }

    /// Account for a failed turn. Latency is known for failures that came
    /// back from the backend.
    pub fn record_failure(&mut self, latency: Option<Duration>) -> Vec<StateField> {
        self.failed_turns += 1;
        match latency {
            Some(latency) => {
                self.last_latency = Some(latency);
                vec![StateField::LastLatencyMs(latency.as_millis() as u64)]
            }
            None => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_tokens: self.total_tokens,
            completed_turns: self.completed_turns,
            failed_turns: self.failed_turns,
            estimated_replies: self.estimated_replies,
            last_latency_ms: self.last_latency.map(|d| d.as_millis() as u64),
            current_model: self.current_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_floor() {
        assert_eq!(estimate_tokens(""), MIN_ESTIMATED_TOKENS);
        assert_eq!(estimate_tokens("hi"), MIN_ESTIMATED_TOKENS);
    }

    #[test]
    fn test_estimate_weights() {
        // 16 alphanumerics = 4.0
        assert_eq!(estimate_tokens("abcdefghijklmnop"), 4);
        // 17 alphanumerics = 4.25, rounded up
        assert_eq!(estimate_tokens("abcdefghijklmnopq"), 5);
        // 20 spaces = 3.0 exactly
        assert_eq!(estimate_tokens(&" ".repeat(20)), 3);
        // 8 punctuation marks = 4.0
        assert_eq!(estimate_tokens("!?.,;:()"), 4);
        // 4 emoji = 4.0
        assert_eq!(estimate_tokens("🦀🦀🦀🦀"), 4);
    }

    #[test]
    fn test_explicit_tokens_trusted() {
        let mut metrics = MetricsAggregator::new();
        let reply = AssistantReply {
            text: "a very long reply that would estimate higher".into(),
            tokens: Some(2),
            model: Some("gpt-4o".into()),
        };
        let (tokens, fields) = metrics.record_reply(&reply, Some(Duration::from_millis(250)));
        assert_eq!(tokens, 2);
        assert!(fields.contains(&StateField::AddTokens(2)));
        assert!(fields.contains(&StateField::CurrentModel("gpt-4o".into())));
        assert!(fields.contains(&StateField::LastLatencyMs(250)));

        let snap = metrics.snapshot();
        assert_eq!(snap.total_tokens, 2);
        assert_eq!(snap.completed_turns, 1);
        assert_eq!(snap.estimated_replies, 0);
    }

    #[test]
    fn test_estimated_reply_keeps_model() {
        let mut metrics = MetricsAggregator::new();
        metrics.record_reply(
            &AssistantReply {
                text: "x".into(),
                tokens: Some(5),
                model: Some("claude".into()),
            },
            None,
        );
        let (tokens, fields) = metrics.record_reply(&AssistantReply::plain("hello world"), None);
        assert_eq!(tokens, MIN_ESTIMATED_TOKENS);
        assert_eq!(fields, vec![StateField::AddTokens(MIN_ESTIMATED_TOKENS)]);

        let snap = metrics.snapshot();
        assert_eq!(snap.current_model.as_deref(), Some("claude"));
        assert_eq!(snap.estimated_replies, 1);
        assert_eq!(snap.completed_turns, 0);
    }

    #[test]
    fn test_failures() {
        let mut metrics = MetricsAggregator::new();
        assert!(metrics.record_failure(None).is_empty());
        let fields = metrics.record_failure(Some(Duration::from_millis(40)));
        assert_eq!(fields, vec![StateField::LastLatencyMs(40)]);
        let snap = metrics.snapshot();
        assert_eq!(snap.failed_turns, 2);
        assert_eq!(snap.last_latency_ms, Some(40));
    }
}
