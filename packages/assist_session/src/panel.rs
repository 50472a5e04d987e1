//! Messages between the session and the presentation surface.
//!
//! Both directions are JSON objects tagged by `type`, so a panel living in
//! another process can speak the same protocol over any byte channel.

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryAction, SessionError, TurnError};
use crate::protocol::{LearningProgress, Mode};
use crate::router::ControlAck;
use crate::store::StateSnapshot;
use crate::turn::TurnId;

/// User intents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PanelCommand {
    SendMessage {
        text: String,
    },
    StartWork {
        goal: String,
        project: String,
        codebase_path: String,
    },
    SetMode {
        mode: Mode,
    },
    RetryConnection,
    /// Ask for the current snapshot, e.g. after the panel reloads.
    RequestState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// User-facing message with a stable code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub code: String,
    pub level: NoticeLevel,
    pub message: String,
    pub recovery: RecoveryAction,
}

impl Notice {
    pub fn new(
        code: impl Into<String>,
        level: NoticeLevel,
        message: impl Into<String>,
        recovery: RecoveryAction,
    ) -> Self {
        Self {
            code: code.into(),
            level,
            message: message.into(),
            recovery,
        }
    }

    pub fn info(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, NoticeLevel::Info, message, RecoveryAction::None)
    }

    /// The socket dropped mid-turn. Kept apart from backend errors.
    pub fn connection_lost() -> Self {
        Self::new(
            "connection_lost",
            NoticeLevel::Warning,
            "connection lost before the response arrived",
            RecoveryAction::Resubmit,
        )
    }
}

impl From<&SessionError> for Notice {
    fn from(err: &SessionError) -> Self {
        let level = match err {
            SessionError::Validation(_) | SessionError::ModeConflict(_) => NoticeLevel::Warning,
            SessionError::Connection(_) | SessionError::Protocol(_) => NoticeLevel::Warning,
            _ => NoticeLevel::Error,
        };
        Self::new(err.error_code(), level, err.to_string(), err.recovery())
    }
}

impl From<&TurnError> for Notice {
    fn from(err: &TurnError) -> Self {
        match err {
            TurnError::AlreadyPending { .. } => Self::new(
                err.error_code(),
                NoticeLevel::Warning,
                err.to_string(),
                RecoveryAction::None,
            ),
            TurnError::DeliveryFailed { .. } => Self::new(
                err.error_code(),
                NoticeLevel::Error,
                err.to_string(),
                RecoveryAction::Resubmit,
            ),
        }
    }
}

/// Pushes to the presentation surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PanelEvent {
    /// Full state; sent after every store update and on request.
    State { snapshot: StateSnapshot },
    Assistant {
        text: String,
        /// Tokens counted for this reply (explicit or estimated).
        tokens: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Turn this reply completed, if one was awaiting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn: Option<TurnId>,
    },
    Progress { progress: LearningProgress },
    Ack { ack: ControlAck },
    Notice { notice: Notice },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd: PanelCommand =
            serde_json::from_str(r#"{"type": "set_mode", "mode": "git_learning"}"#).unwrap();
        assert_eq!(
            cmd,
            PanelCommand::SetMode {
                mode: Mode::GitLearning
            }
        );

        let cmd: PanelCommand = serde_json::from_str(r#"{"type": "retry_connection"}"#).unwrap();
        assert_eq!(cmd, PanelCommand::RetryConnection);
    }

    #[test]
    fn test_notice_from_backend_error() {
        let notice = Notice::from(&SessionError::Backend("rate limited".into()));
        assert_eq!(notice.code, "backend_error");
        assert_eq!(notice.message, "rate limited");
        assert_eq!(notice.level, NoticeLevel::Error);

        let json = serde_json::to_value(PanelEvent::Notice { notice }).unwrap();
        assert_eq!(json["type"], "notice");
        assert_eq!(json["notice"]["recovery"]["action"], "resubmit");
    }

    #[test]
    fn test_notice_from_turn_error() {
        let notice = Notice::from(&TurnError::AlreadyPending {
            pending: TurnId::new(),
        });
        assert_eq!(notice.code, "turn_pending");
        assert_eq!(notice.level, NoticeLevel::Warning);
    }

    #[test]
    fn test_assistant_event_shape() {
        let json = serde_json::to_value(PanelEvent::Assistant {
            text: "hi".into(),
            tokens: 3,
            model: None,
            turn: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "assistant", "text": "hi", "tokens": 3}));
    }
}
