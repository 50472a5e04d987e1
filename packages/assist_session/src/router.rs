//! Inbound frame classification
//!
//! The backend has grown several payload shapes over time (`prompt` vs
//! `message` vs `response`, progress as an object, a bare number or a string).
//! [`classify`] normalizes every one of them into a single [`Envelope`] so
//! nothing past this point inspects raw JSON. It has no side effects.
//!
//! Precedence, first match wins:
//!
//! 1. non-empty `error` → [`Envelope::ErrorNotice`]
//! 2. `learning_progress` / `progress` → [`Envelope::ProgressUpdate`]
//! 3. string `prompt` / `message` / `response` → [`Envelope::AssistantResponse`]
//! 4. string `command` / `ack` / `status` → [`Envelope::ControlAck`]
//! 5. anything else → [`Envelope::Unclassified`]
//!
//! Text that is not a JSON object is treated as a plain-text reply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::protocol::LearningProgress;

const TEXT_KEYS: [&str; 3] = ["prompt", "message", "response"];
const PROGRESS_KEYS: [&str; 3] = ["learning_progress", "learningProgress", "progress"];
const ACK_KEYS: [&str; 3] = ["command", "ack", "status"];

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    AssistantResponse,
    ProgressUpdate,
    ErrorNotice,
    ControlAck,
    Unclassified,
}

/// A reply from the assistant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantReply {
    pub text: String,
    /// Token count reported by the backend, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AssistantReply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens: None,
            model: None,
        }
    }
}

/// Acknowledgement or status frame from the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
    /// Which field carried it (`command`, `ack` or `status`).
    pub key: String,
    pub value: String,
}

/// Canonical form of an inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    AssistantResponse(AssistantReply),
    ProgressUpdate(LearningProgress),
    ErrorNotice(String),
    ControlAck(ControlAck),
    Unclassified(Value),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::AssistantResponse(_) => EnvelopeKind::AssistantResponse,
            Self::ProgressUpdate(_) => EnvelopeKind::ProgressUpdate,
            Self::ErrorNotice(_) => EnvelopeKind::ErrorNotice,
            Self::ControlAck(_) => EnvelopeKind::ControlAck,
            Self::Unclassified(_) => EnvelopeKind::Unclassified,
        }
    }
}

/// Classify one text frame.
pub fn classify(raw: &str) -> Envelope {
    if raw.trim().is_empty() {
        return Envelope::Unclassified(Value::String(raw.to_string()));
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => classify_object(map),
        Ok(Value::String(text)) => Envelope::AssistantResponse(AssistantReply::plain(text)),
        Ok(_) | Err(_) => {
            debug!(len = raw.len(), "non-object frame, treating as plain text");
            Envelope::AssistantResponse(AssistantReply::plain(raw))
        }
    }
}

fn classify_object(map: Map<String, Value>) -> Envelope {
    if let Some(message) = map.get("error").and_then(error_text) {
        return Envelope::ErrorNotice(message);
    }

    for key in PROGRESS_KEYS {
        if let Some(progress) = map.get(key).and_then(parse_progress) {
            return Envelope::ProgressUpdate(progress);
        }
    }

    for key in TEXT_KEYS {
        if let Some(Value::String(text)) = map.get(key) {
            return Envelope::AssistantResponse(AssistantReply {
                text: text.clone(),
                tokens: map.get("tokens").and_then(parse_count),
                model: map
                    .get("model")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string),
            });
        }
    }

    for key in ACK_KEYS {
        if let Some(Value::String(value)) = map.get(key) {
            return Envelope::ControlAck(ControlAck {
                key: key.to_string(),
                value: value.clone(),
            });
        }
    }

    debug!(keys = ?map.keys().collect::<Vec<_>>(), "unclassified frame");
    Envelope::Unclassified(Value::Object(map))
}

/// `null`, `false` and blank strings are not errors. Anything else is
/// returned as sent.
fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) => (!s.trim().is_empty()).then(|| s.clone()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        Value::Bool(true) => Some("unknown backend error".to_string()),
        other => Some(other.to_string()),
    }
}

fn parse_progress(value: &Value) -> Option<LearningProgress> {
    match value {
        Value::Object(obj) => Some(progress_from_object(obj)),
        Value::Number(_) => Some(LearningProgress {
            percentage: parse_percentage(value),
            ..Default::default()
        }),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            let numeric = s.strip_suffix('%').unwrap_or(s).trim();
            match numeric.parse::<f64>() {
                Ok(pct) if pct.is_finite() => Some(LearningProgress {
                    percentage: Some(pct.clamp(0.0, 100.0)),
                    ..Default::default()
                }),
                _ => Some(LearningProgress {
                    status_message: Some(s.to_string()),
                    ..Default::default()
                }),
            }
        }
        _ => None,
    }
}

fn progress_from_object(obj: &Map<String, Value>) -> LearningProgress {
    LearningProgress {
        percentage: first(obj, &["percentage", "percent"]).and_then(parse_percentage),
        repos_analyzed: first(obj, &["repos_analyzed", "reposAnalyzed"]).and_then(parse_count),
        files_processed: first(obj, &["files_processed", "filesProcessed"]).and_then(parse_count),
        lines_processed: first(obj, &["lines_processed", "linesProcessed"]).and_then(parse_count),
        current_repo: first_text(obj, &["current_repo", "currentRepo"]),
        status_message: first_text(obj, &["status_message", "statusMessage", "status", "message"]),
    }
}

fn first<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| obj.get(*n))
}

fn first_text(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    first(obj, names)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn parse_percentage(value: &Value) -> Option<f64> {
    parse_number(value).map(|p| p.clamp(0.0, 100.0))
}

/// Non-negative integer count; number or numeric string.
fn parse_count(value: &Value) -> Option<u64> {
    let n = parse_number(value)?;
    (n >= 0.0).then(|| n.round() as u64)
}
