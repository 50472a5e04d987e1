//! Error taxonomy, error codes, and user-actionable recovery hints.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::turn::TurnId;

/// What the user (or the panel on their behalf) can do about an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Nothing to do; the session reconnects on its own.
    Reconnect,
    /// Manual retry of the connection is required.
    Retry,
    /// The action is not valid in the current mode.
    SwitchMode,
    /// Fix the input or send it again.
    Resubmit,
    None,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Transient transport failure. Reconnect is scheduled automatically.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("max reconnect attempts reached ({attempts})")]
    MaxAttemptsReached { attempts: u32 },

    /// Malformed or unrecognized frame. Recovered locally, never user-facing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Explicit `error` from the backend or a non-2xx HTTP status.
    #[error("{0}")]
    Backend(String),

    #[error("{0}")]
    Validation(String),

    /// The action is not allowed in the current mode.
    #[error("{0}")]
    ModeConflict(String),

    #[error("no response within {:?}", .0)]
    Timeout(Duration),

    #[error("failed to persist preferences: {0}")]
    Persistence(String),

    /// The session task has shut down.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::MaxAttemptsReached { .. } => "max_attempts_reached",
            Self::Protocol(_) => "protocol_error",
            Self::Backend(_) => "backend_error",
            Self::Validation(_) => "validation",
            Self::ModeConflict(_) => "mode_conflict",
            Self::Timeout(_) => "timeout",
            Self::Persistence(_) => "persistence_error",
            Self::Closed => "session_closed",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::Connection(_) => RecoveryAction::Reconnect,
            Self::MaxAttemptsReached { .. } => RecoveryAction::Retry,
            Self::Protocol(_) => RecoveryAction::None,
            Self::Backend(_) | Self::Timeout(_) => RecoveryAction::Resubmit,
            Self::Validation(_) => RecoveryAction::Resubmit,
            Self::ModeConflict(_) => RecoveryAction::SwitchMode,
            Self::Persistence(_) => RecoveryAction::None,
            Self::Closed => RecoveryAction::None,
        }
    }
}

/// Rejections from [`TurnController::start_turn`](crate::turn::TurnController::start_turn).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    #[error("a response is already pending")]
    AlreadyPending { pending: TurnId },

    #[error("message could not be delivered: not connected")]
    DeliveryFailed { turn: TurnId },
}

impl TurnError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AlreadyPending { .. } => "turn_pending",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read preferences: {0}")]
    Load(String),

    #[error("failed to write preferences: {0}")]
    Save(String),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SessionError::Connection(format!("request timed out: {err}"))
        } else {
            SessionError::Connection(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SessionError::Backend("rate limited".into()).error_code(),
            "backend_error"
        );
        assert_eq!(
            SessionError::MaxAttemptsReached { attempts: 10 }.error_code(),
            "max_attempts_reached"
        );
        assert_eq!(
            TurnError::AlreadyPending {
                pending: TurnId::new()
            }
            .error_code(),
            "turn_pending"
        );
    }

    #[test]
    fn test_backend_error_displays_verbatim() {
        let err = SessionError::Backend("rate limited".into());
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn test_recovery_actions() {
        assert_eq!(
            SessionError::MaxAttemptsReached { attempts: 3 }.recovery(),
            RecoveryAction::Retry
        );
        assert_eq!(
            SessionError::Connection("reset".into()).recovery(),
            RecoveryAction::Reconnect
        );
        assert_eq!(
            SessionError::Validation("goal is required".into()).recovery(),
            RecoveryAction::Resubmit
        );
    }

    #[test]
    fn test_protocol_errors_stay_local() {
        let err = SessionError::Protocol("bad frame".into());
        assert_eq!(err.error_code(), "protocol_error");
        assert_eq!(err.recovery(), RecoveryAction::None);
    }

    #[test]
    fn test_timeout_display() {
        let err = SessionError::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "no response within 300s");
    }

    #[test]
    fn test_recovery_serde() {
        let json = serde_json::to_string(&RecoveryAction::SwitchMode).unwrap();
        assert_eq!(json, r#"{"action":"switch_mode"}"#);
    }
}
