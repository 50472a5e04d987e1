//! Turn tracking
//!
//! A turn is one user-initiated request and its single response. The
//! WebSocket protocol carries no correlation id, so at most one turn may be
//! awaiting a response at any time; the next reply on the socket is taken to
//! answer it. HTTP turns carry their [`TurnId`] through the spawned request
//! and complete only when that request reports back.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TurnError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Free-form chat message over the WebSocket.
    Chat,
    /// `POST /start` unit of work.
    StartWork,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnChannel {
    WebSocket,
    Http,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Idle,
    AwaitingResponse,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct Turn {
    pub id: TurnId,
    pub kind: TurnKind,
    pub channel: TurnChannel,
    pub status: TurnStatus,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
}

impl Turn {
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Why a turn failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// Explicit error from the backend, surfaced verbatim.
    Backend(String),
    /// The socket dropped while a WebSocket turn was waiting.
    ConnectionLost,
    /// The HTTP request never reached the backend.
    Transport(String),
    Timeout(Duration),
}

/// How a turn ended. The controller is back to Idle once this is returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed {
        turn: TurnId,
        kind: TurnKind,
        latency: Duration,
    },
    Failed {
        turn: TurnId,
        kind: TurnKind,
        latency: Duration,
        reason: FailureReason,
    },
}

impl TurnOutcome {
    pub fn turn(&self) -> TurnId {
        match self {
            Self::Completed { turn, .. } | Self::Failed { turn, .. } => *turn,
        }
    }

    pub fn latency(&self) -> Duration {
        match self {
            Self::Completed { latency, .. } | Self::Failed { latency, .. } => *latency,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Presentation view of the active turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnInfo {
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TurnId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TurnKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Owns the (single) active turn.
pub struct TurnController {
    timeout: Option<Duration>,
    active: Option<Turn>,
}

impl TurnController {
    /// `timeout` of `None` lets a turn wait forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            active: None,
        }
    }

    pub fn status(&self) -> TurnStatus {
        self.active
            .as_ref()
            .map(|t| t.status)
            .unwrap_or(TurnStatus::Idle)
    }

    pub fn is_awaiting(&self) -> bool {
        self.status() == TurnStatus::AwaitingResponse
    }

    pub fn pending(&self) -> Option<&Turn> {
        self.active.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Instant at which the awaiting turn times out, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        self.active.as_ref().map(|t| t.started_at + timeout)
    }

    pub fn info(&self) -> TurnInfo {
        match &self.active {
            Some(turn) => TurnInfo {
                status: turn.status,
                id: Some(turn.id),
                kind: Some(turn.kind),
                started_at: Some(turn.started_wall),
            },
            None => TurnInfo::default(),
        }
    }

    /// Begin a turn and hand its id to `dispatch`, which performs the actual
    /// send and reports whether it went out.
    ///
    /// Rejected without calling `dispatch` if a turn is already awaiting; the
    /// existing turn is left untouched.
    pub fn start_turn<F>(
        &mut self,
        kind: TurnKind,
        channel: TurnChannel,
        dispatch: F,
    ) -> Result<TurnId, TurnError>
    where
        F: FnOnce(TurnId) -> bool,
    {
        if let Some(pending) = &self.active {
            debug!(pending = %pending.id, "turn rejected: response already pending");
            return Err(TurnError::AlreadyPending {
                pending: pending.id,
            });
        }

        let id = TurnId::new();
        self.active = Some(Turn {
            id,
            kind,
            channel,
            status: TurnStatus::AwaitingResponse,
            started_at: Instant::now(),
            started_wall: Utc::now(),
        });

        if !dispatch(id) {
            // Failed, then straight back to Idle.
            self.active = None;
            warn!(turn = %id, "turn dispatch failed");
            return Err(TurnError::DeliveryFailed { turn: id });
        }

        info!(turn = %id, ?kind, ?channel, "turn started");
        Ok(id)
    }

    /// A reply arrived on the WebSocket.
    pub fn on_socket_response(&mut self, now: Instant) -> Option<TurnOutcome> {
        self.take_socket_turn()
            .map(|turn| Self::complete(turn, now))
    }

    /// An error frame arrived on the WebSocket.
    pub fn on_socket_error(&mut self, message: &str, now: Instant) -> Option<TurnOutcome> {
        self.take_socket_turn()
            .map(|turn| Self::fail(turn, now, FailureReason::Backend(message.to_string())))
    }

    /// The socket closed. HTTP turns are unaffected.
    pub fn on_disconnected(&mut self, now: Instant) -> Option<TurnOutcome> {
        self.take_socket_turn()
            .map(|turn| Self::fail(turn, now, FailureReason::ConnectionLost))
    }

    /// Completion of the HTTP request started for `turn_id`. Completions for
    /// any other turn are stale and ignored.
    pub fn on_http_result(
        &mut self,
        turn_id: TurnId,
        result: Result<(), FailureReason>,
        now: Instant,
    ) -> Option<TurnOutcome> {
        let matches = self
            .active
            .as_ref()
            .is_some_and(|t| t.id == turn_id && t.channel == TurnChannel::Http);
        if !matches {
            debug!(turn = %turn_id, "ignoring stale HTTP completion");
            return None;
        }
        let turn = self.active.take()?;
        Some(match result {
            Ok(()) => Self::complete(turn, now),
            Err(reason) => Self::fail(turn, now, reason),
        })
    }

    /// Fail the awaiting turn if it is past its deadline.
    pub fn check_timeout(&mut self, now: Instant) -> Option<TurnOutcome> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let timeout = self.timeout?;
        let turn = self.active.take()?;
        warn!(turn = %turn.id, timeout_secs = timeout.as_secs(), "turn timed out");
        Some(Self::fail(turn, now, FailureReason::Timeout(timeout)))
    }

    fn take_socket_turn(&mut self) -> Option<Turn> {
        match &self.active {
            Some(turn) if turn.channel == TurnChannel::WebSocket => self.active.take(),
            _ => None,
        }
    }

    fn complete(turn: Turn, now: Instant) -> TurnOutcome {
        let latency = turn.elapsed(now);
        info!(turn = %turn.id, latency_ms = latency.as_millis() as u64, "turn completed");
        TurnOutcome::Completed {
            turn: turn.id,
            kind: turn.kind,
            latency,
        }
    }

    fn fail(turn: Turn, now: Instant, reason: FailureReason) -> TurnOutcome {
        let latency = turn.elapsed(now);
        info!(turn = %turn.id, ?reason, "turn failed");
        TurnOutcome::Failed {
            turn: turn.id,
            kind: turn.kind,
            latency,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(controller: &mut TurnController) -> TurnId {
        controller
            .start_turn(TurnKind::Chat, TurnChannel::WebSocket, |_| true)
            .unwrap()
    }

    #[test]
    fn test_start_and_complete() {
        let mut turns = TurnController::new(None);
        assert_eq!(turns.status(), TurnStatus::Idle);

        let id = chat(&mut turns);
        assert_eq!(turns.status(), TurnStatus::AwaitingResponse);
        assert_eq!(turns.info().id, Some(id));

        let outcome = turns.on_socket_response(Instant::now()).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.turn(), id);
        assert_eq!(turns.status(), TurnStatus::Idle);
        assert_eq!(turns.info(), TurnInfo::default());
    }

    #[test]
    fn test_second_turn_rejected() {
        let mut turns = TurnController::new(None);
        let first = chat(&mut turns);

        let mut dispatched = false;
        let err = turns
            .start_turn(TurnKind::Chat, TurnChannel::WebSocket, |_| {
                dispatched = true;
                true
            })
            .unwrap_err();

        assert_eq!(err, TurnError::AlreadyPending { pending: first });
        assert!(!dispatched);
        assert_eq!(turns.pending().map(|t| t.id), Some(first));
        assert_eq!(turns.status(), TurnStatus::AwaitingResponse);
    }

    #[test]
    fn test_failed_dispatch_returns_to_idle() {
        let mut turns = TurnController::new(None);
        let err = turns
            .start_turn(TurnKind::Chat, TurnChannel::WebSocket, |_| false)
            .unwrap_err();
        assert!(matches!(err, TurnError::DeliveryFailed { .. }));
        assert_eq!(turns.status(), TurnStatus::Idle);

        // Controller is usable again.
        chat(&mut turns);
    }

    #[test]
    fn test_error_frame_fails_turn_verbatim() {
        let mut turns = TurnController::new(None);
        chat(&mut turns);

        let outcome = turns.on_socket_error("rate limited", Instant::now()).unwrap();
        match outcome {
            TurnOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::Backend("rate limited".into()));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(turns.status(), TurnStatus::Idle);
    }

    #[test]
    fn test_socket_events_without_turn_are_noops() {
        let mut turns = TurnController::new(None);
        assert!(turns.on_socket_response(Instant::now()).is_none());
        assert!(turns.on_socket_error("x", Instant::now()).is_none());
        assert!(turns.on_disconnected(Instant::now()).is_none());
    }

    #[test]
    fn test_disconnect_fails_only_socket_turns() {
        let mut turns = TurnController::new(None);
        chat(&mut turns);
        let outcome = turns.on_disconnected(Instant::now()).unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                reason: FailureReason::ConnectionLost,
                ..
            }
        ));

        let http = turns
            .start_turn(TurnKind::StartWork, TurnChannel::Http, |_| true)
            .unwrap();
        assert!(turns.on_disconnected(Instant::now()).is_none());
        assert!(turns.on_socket_response(Instant::now()).is_none());
        assert_eq!(turns.pending().map(|t| t.id), Some(http));
    }

    #[test]
    fn test_http_completion_matched_by_id() {
        let mut turns = TurnController::new(None);
        let id = turns
            .start_turn(TurnKind::StartWork, TurnChannel::Http, |_| true)
            .unwrap();

        assert!(turns.on_http_result(TurnId::new(), Ok(()), Instant::now()).is_none());
        assert!(turns.is_awaiting());

        let outcome = turns.on_http_result(id, Ok(()), Instant::now()).unwrap();
        assert!(outcome.is_completed());

        // A duplicate completion is stale now.
        assert!(turns.on_http_result(id, Ok(()), Instant::now()).is_none());
    }

    #[test]
    fn test_http_failure() {
        let mut turns = TurnController::new(None);
        let id = turns
            .start_turn(TurnKind::StartWork, TurnChannel::Http, |_| true)
            .unwrap();
        let outcome = turns
            .on_http_result(id, Err(FailureReason::Backend("bad goal".into())), Instant::now())
            .unwrap();
        assert!(!outcome.is_completed());
        assert_eq!(turns.status(), TurnStatus::Idle);
    }

    #[test]
    fn test_timeout() {
        let mut turns = TurnController::new(Some(Duration::from_secs(5)));
        assert!(turns.deadline().is_none());

        chat(&mut turns);
        let deadline = turns.deadline().unwrap();
        assert!(turns.check_timeout(deadline - Duration::from_millis(1)).is_none());

        let outcome = turns.check_timeout(deadline).unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                reason: FailureReason::Timeout(_),
                ..
            }
        ));
        assert_eq!(turns.status(), TurnStatus::Idle);
    }

    #[test]
    fn test_no_timeout_when_disabled() {
        let mut turns = TurnController::new(None);
        chat(&mut turns);
        assert!(turns.deadline().is_none());
        assert!(
            turns
                .check_timeout(Instant::now() + Duration::from_secs(86_400))
                .is_none()
        );
        assert!(turns.is_awaiting());
    }
}
