//! ModeController: switching between project work and GitHub learning.
//!
//! The local mode always reflects what the user asked for. The backend is told
//! best-effort; if the control frame cannot be delivered it is sent again on
//! the next connect.

use tracing::{debug, info, warn};

use crate::SessionError;
use crate::connection::ConnectionManager;
use crate::error::StoreError;
use crate::protocol::{ControlCommand, ControlFrame, Mode};
use crate::store::{StateField, StateStore};

/// Result of [`ModeController::set_mode`].
#[derive(Debug)]
pub struct ModeSwitch {
    pub mode: Mode,
    /// False when the requested mode was already active.
    pub changed: bool,
    /// Whether the control frame reached the socket.
    pub delivered: bool,
    pub persist_error: Option<StoreError>,
}

#[derive(Debug, Default)]
pub struct ModeController {
    /// Control command that has not reached the backend yet.
    unsent: Option<ControlCommand>,
}

impl ModeController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to `mode`. Mode and persisted preference change in one store
    /// update; the control frame is best-effort and never rolls the switch
    /// back.
    pub fn set_mode(
        &mut self,
        mode: Mode,
        store: &mut StateStore,
        connection: &ConnectionManager,
    ) -> ModeSwitch {
        if store.mode() == mode {
            debug!(%mode, "mode unchanged");
            return ModeSwitch {
                mode,
                changed: false,
                delivered: false,
                persist_error: None,
            };
        }

        let mut fields = vec![
            StateField::Mode(mode),
            StateField::GitLearningPreference(mode.is_git_learning()),
        ];
        if !mode.is_git_learning() {
            fields.push(StateField::ClearProgress);
        }
        let persist_error = store.update_all(fields).err();

        let frame = ControlFrame::for_mode(mode);
        let delivered = connection.send(&frame);
        if delivered {
            self.unsent = None;
        } else {
            warn!(%mode, "mode control frame not delivered, will resend on reconnect");
            self.unsent = Some(frame.command);
        }

        info!(%mode, delivered, "mode switched");
        ModeSwitch {
            mode,
            changed: true,
            delivered,
            persist_error,
        }
    }

    /// Bring the backend in line with the local mode after a (re)connect.
    /// Returns whether a control frame was sent.
    pub fn resync(&mut self, mode: Mode, connection: &ConnectionManager) -> bool {
        let command = match (mode, self.unsent) {
            (Mode::GitLearning, _) => ControlCommand::StartLearning,
            (Mode::ProjectWorking, Some(ControlCommand::StopLearning)) => {
                ControlCommand::StopLearning
            }
            (Mode::ProjectWorking, _) => {
                self.unsent = None;
                return false;
            }
        };

        let sent = connection.send(&ControlFrame::new(command));
        if sent {
            debug!(?command, "mode resynced with backend");
            self.unsent = None;
        }
        sent
    }

    /// Starting a unit of work is only allowed in project mode.
    pub fn validate_start(&self, mode: Mode) -> Result<(), SessionError> {
        match mode {
            Mode::ProjectWorking => Ok(()),
            Mode::GitLearning => Err(SessionError::ModeConflict(
                "switch to project mode before starting work".into(),
            )),
        }
    }

    pub fn has_unsent(&self) -> bool {
        self.unsent.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::store::{MemoryPreferences, Preferences};

    fn store_with(git_learning: bool) -> (StateStore, MemoryPreferences) {
        let prefs = MemoryPreferences::new(Preferences {
            is_git_learning_mode: git_learning,
        });
        (StateStore::new(Box::new(prefs.clone())), prefs)
    }

    #[tokio::test]
    async fn test_same_mode_is_noop() {
        let (mut store, prefs) = store_with(false);
        let (connection, _events) = ConnectionManager::new(ReconnectPolicy::default());
        let mut modes = ModeController::new();

        let switch = modes.set_mode(Mode::ProjectWorking, &mut store, &connection);
        assert!(!switch.changed);
        assert_eq!(prefs.save_count(), 0);
        assert!(!modes.has_unsent());
    }

    #[tokio::test]
    async fn test_switch_persists_without_connection() {
        let (mut store, prefs) = store_with(false);
        let (connection, _events) = ConnectionManager::new(ReconnectPolicy::default());
        let mut modes = ModeController::new();

        let switch = modes.set_mode(Mode::GitLearning, &mut store, &connection);
        assert!(switch.changed);
        assert!(!switch.delivered);
        assert!(switch.persist_error.is_none());

        // No rollback.
        assert_eq!(store.mode(), Mode::GitLearning);
        assert!(prefs.current().is_git_learning_mode);
        assert_eq!(prefs.save_count(), 1);
        assert!(modes.has_unsent());
    }

    #[tokio::test]
    async fn test_resync_needs_connection() {
        let (connection, _events) = ConnectionManager::new(ReconnectPolicy::default());
        let mut modes = ModeController::new();
        assert!(!modes.resync(Mode::GitLearning, &connection));
        assert!(!modes.resync(Mode::ProjectWorking, &connection));
    }

    #[test]
    fn test_validate_start() {
        let modes = ModeController::new();
        assert!(modes.validate_start(Mode::ProjectWorking).is_ok());
        let err = modes.validate_start(Mode::GitLearning).unwrap_err();
        assert!(matches!(err, SessionError::ModeConflict(_)));
        assert_eq!(err.recovery(), crate::RecoveryAction::SwitchMode);
    }
}
