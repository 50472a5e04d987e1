//! Session event loop
//!
//! One task owns every component. It selects over panel commands, socket
//! events, HTTP completions, the turn deadline and cancellation, so no
//! component is ever touched from two places at once. Socket I/O, backoff
//! timers and HTTP requests run in their own tasks and only post events back.

use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SessionError;
use crate::backend::{BackendClient, DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT};
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionStatus, DEFAULT_WS_URL, ReconnectPolicy,
    SocketEvent, SocketEvents,
};
use crate::metrics::MetricsAggregator;
use crate::mode::ModeController;
use crate::panel::{Notice, PanelCommand, PanelEvent};
use crate::protocol::{ChatFrame, Mode, StartRequest};
use crate::router::{self, AssistantReply, Envelope};
use crate::store::{ConnectionInfo, ProjectInfo, StateField, StateStore};
use crate::turn::{FailureReason, TurnChannel, TurnController, TurnId, TurnKind, TurnOutcome};

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ws_url: String,
    pub base_url: String,
    /// `None` disables the HTTP request timeout.
    pub request_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    /// `None` lets a turn wait forever.
    pub turn_timeout: Option<Duration>,
    /// Panel events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            reconnect: ReconnectPolicy::default(),
            turn_timeout: Some(DEFAULT_TURN_TIMEOUT),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Result of a spawned `/start` request.
struct HttpCompletion {
    turn: TurnId,
    result: Result<AssistantReply, SessionError>,
}

struct SessionCore {
    ws_url: String,
    connection: ConnectionManager,
    turns: TurnController,
    metrics: MetricsAggregator,
    modes: ModeController,
    store: StateStore,
    backend: BackendClient,
    http_tx: mpsc::UnboundedSender<HttpCompletion>,
    events: broadcast::Sender<PanelEvent>,
    connection_error: Option<String>,
}

impl SessionCore {
    fn start(&mut self) {
        info!(ws_url = %self.ws_url, base_url = %self.backend.base_url(), mode = %self.store.mode(), "session starting");
        let events = self.connection.connect(self.ws_url.clone());
        self.on_connection_events(events);
    }

    fn shutdown(&mut self) {
        let _ = self.connection.disconnect();
    }

    fn handle_command(&mut self, command: PanelCommand) {
        debug!(?command, "panel command");
        match command {
            PanelCommand::SendMessage { text } => self.send_message(text),
            PanelCommand::StartWork {
                goal,
                project,
                codebase_path,
            } => self.start_work(&goal, &project, &codebase_path),
            PanelCommand::SetMode { mode } => self.set_mode(mode),
            PanelCommand::RetryConnection => match self.connection.retry() {
                Ok(events) => self.on_connection_events(events),
                Err(e) => self.notice(Notice::from(&e)),
            },
            PanelCommand::RequestState => self.emit(PanelEvent::State {
                snapshot: self.store.snapshot(),
            }),
        }
    }

    fn send_message(&mut self, text: String) {
        if text.trim().is_empty() {
            self.notice(Notice::from(&SessionError::Validation(
                "message is empty".into(),
            )));
            return;
        }

        let frame = ChatFrame {
            message: text,
            git_learning_mode: self.store.mode().is_git_learning(),
        };
        let connection = &self.connection;
        let started = self
            .turns
            .start_turn(TurnKind::Chat, TurnChannel::WebSocket, |_| {
                connection.send(&frame)
            });
        self.after_start(started);
    }

    fn start_work(&mut self, goal: &str, project: &str, codebase_path: &str) {
        let validated = self
            .modes
            .validate_start(self.store.mode())
            .and_then(|()| StartRequest::validated(goal, project, codebase_path));
        let mut request = match validated {
            Ok(request) => request,
            Err(e) => {
                self.notice(Notice::from(&e));
                return;
            }
        };
        request.git_learning_mode = Some(self.store.mode().is_git_learning());

        let project_info = ProjectInfo {
            goal: request.goal.clone(),
            project: request.project.clone(),
            codebase_path: request.codebase_path.clone(),
            started_at: chrono::Utc::now(),
        };
        let backend = self.backend.clone();
        let http_tx = self.http_tx.clone();
        let started = self
            .turns
            .start_turn(TurnKind::StartWork, TurnChannel::Http, move |turn| {
                tokio::spawn(async move {
                    let result = backend.start(&request).await;
                    let _ = http_tx.send(HttpCompletion { turn, result });
                });
                true
            });

        if started.is_ok() {
            self.apply(vec![StateField::Project(Some(project_info))]);
        }
        self.after_start(started);
    }

    fn after_start(&mut self, started: Result<TurnId, crate::TurnError>) {
        match started {
            Ok(_) => self.apply(vec![StateField::Turn(self.turns.info())]),
            Err(e) => {
                if matches!(e, crate::TurnError::DeliveryFailed { .. }) {
                    let fields = self.metrics.record_failure(None);
                    self.apply(fields);
                }
                self.notice(Notice::from(&e));
            }
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        let switch = self.modes.set_mode(mode, &mut self.store, &self.connection);
        if !switch.changed {
            return;
        }
        if let Some(e) = switch.persist_error {
            self.notice(Notice::from(&SessionError::from(e)));
        }
        if !switch.delivered {
            self.notice(Notice::info(
                "mode_pending",
                format!("switched to {mode} mode; the backend will be updated once connected"),
            ));
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        let events = self.connection.handle(event);
        self.on_connection_events(events);
    }

    fn on_connection_events(&mut self, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::Status(status) => {
                    self.connection_error = status.error.clone();
                    let mut fields = vec![StateField::Connection(ConnectionInfo {
                        status: status.status,
                        retry_count: status.retry_count,
                        next_retry_ms: None,
                        error: status.error,
                    })];
                    match status.status {
                        ConnectionStatus::Connected => {
                            if self.modes.has_unsent() {
                                info!("resending undelivered mode command");
                            }
                            self.modes.resync(self.store.mode(), &self.connection);
                        }
                        ConnectionStatus::Disconnected => {
                            if self.turns.on_disconnected(Instant::now()).is_some() {
                                fields.extend(self.metrics.record_failure(None));
                                fields.push(StateField::Turn(self.turns.info()));
                                self.notice(Notice::connection_lost());
                            }
                        }
                        ConnectionStatus::Connecting => {}
                    }
                    self.apply(fields);
                }
                ConnectionEvent::Message(text) => self.on_frame(&text),
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    self.apply(vec![StateField::Connection(ConnectionInfo {
                        status: self.connection.status(),
                        retry_count: attempt,
                        next_retry_ms: Some(delay.as_millis() as u64),
                        error: self.connection_error.clone(),
                    })]);
                }
                ConnectionEvent::MaxAttemptsReached { attempts } => {
                    self.notice(Notice::from(&SessionError::MaxAttemptsReached { attempts }));
                }
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        match router::classify(text) {
            Envelope::AssistantResponse(reply) => {
                let outcome = self.turns.on_socket_response(Instant::now());
                self.deliver_reply(reply, outcome);
            }
            Envelope::ErrorNotice(message) => {
                if let Some(outcome) = self.turns.on_socket_error(&message, Instant::now()) {
                    let mut fields = self.metrics.record_failure(Some(outcome.latency()));
                    fields.push(StateField::Turn(self.turns.info()));
                    self.apply(fields);
                }
                self.notice(Notice::from(&SessionError::Backend(message)));
            }
            Envelope::ProgressUpdate(progress) => {
                if !self.store.mode().is_git_learning() {
                    debug!("ignoring learning progress outside learning mode");
                    return;
                }
                self.apply(vec![StateField::Progress(progress)]);
                self.emit(PanelEvent::Progress {
                    progress: self.store.state().session.progress.clone(),
                });
            }
            Envelope::ControlAck(ack) => {
                debug!(key = %ack.key, value = %ack.value, "control ack");
                self.emit(PanelEvent::Ack { ack });
            }
            Envelope::Unclassified(value) => {
                let err = SessionError::Protocol(format!("unclassified frame: {value}"));
                debug!(code = err.error_code(), "dropping frame: {}", err);
            }
        }
    }

    fn handle_http_completion(&mut self, done: HttpCompletion) {
        let result = match &done.result {
            Ok(_) => Ok(()),
            Err(SessionError::Backend(message)) => Err(FailureReason::Backend(message.clone())),
            Err(e) => Err(FailureReason::Transport(e.to_string())),
        };
        let Some(outcome) = self.turns.on_http_result(done.turn, result, Instant::now()) else {
            return;
        };

        match done.result {
            Ok(reply) => self.deliver_reply(reply, Some(outcome)),
            Err(e) => {
                let mut fields = self.metrics.record_failure(Some(outcome.latency()));
                fields.push(StateField::Turn(self.turns.info()));
                self.apply(fields);
                self.notice(Notice::from(&e));
            }
        }
    }

    fn handle_turn_timeout(&mut self, now: Instant) {
        let Some(outcome) = self.turns.check_timeout(now) else {
            return;
        };
        let mut fields = self.metrics.record_failure(None);
        fields.push(StateField::Turn(self.turns.info()));
        self.apply(fields);

        if let TurnOutcome::Failed {
            reason: FailureReason::Timeout(timeout),
            ..
        } = outcome
        {
            self.notice(Notice::from(&SessionError::Timeout(timeout)));
        }
    }

    /// Count a reply, close out the turn it answered (if any) and push it to
    /// the panel.
    fn deliver_reply(&mut self, reply: AssistantReply, outcome: Option<TurnOutcome>) {
        let latency = outcome.as_ref().map(TurnOutcome::latency);
        let (tokens, mut fields) = self.metrics.record_reply(&reply, latency);
        fields.push(StateField::Turn(self.turns.info()));
        self.apply(fields);

        self.emit(PanelEvent::Assistant {
            text: reply.text,
            tokens,
            model: reply.model,
            turn: outcome.map(|o| o.turn()),
        });
    }

    fn apply(&mut self, fields: Vec<StateField>) {
        if let Err(e) = self.store.update_all(fields) {
            self.notice(Notice::from(&SessionError::from(e)));
        }
    }

    fn notice(&self, notice: Notice) {
        debug!(code = %notice.code, "notice: {}", notice.message);
        self.emit(PanelEvent::Notice { notice });
    }

    fn emit(&self, event: PanelEvent) {
        // No receivers is fine; the panel may not be attached yet.
        let _ = self.events.send(event);
    }
}

async fn run_session(
    mut core: SessionCore,
    mut socket_events: SocketEvents,
    mut commands: mpsc::UnboundedReceiver<PanelCommand>,
    mut http_rx: mpsc::UnboundedReceiver<HttpCompletion>,
    cancel: CancellationToken,
) {
    let events = core.events.clone();
    let _state_push = core.store.subscribe(move |snapshot| {
        let _ = events.send(PanelEvent::State {
            snapshot: snapshot.clone(),
        });
        Ok(())
    });

    core.start();

    loop {
        let deadline = core.turns.deadline();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("session cancelled");
                break;
            }
            command = commands.recv() => match command {
                Some(command) => core.handle_command(command),
                None => {
                    debug!("all session handles dropped");
                    break;
                }
            },
            Some(event) = socket_events.recv() => core.handle_socket_event(event),
            Some(done) = http_rx.recv() => core.handle_http_completion(done),
            _ = sleep_until(deadline) => core.handle_turn_timeout(Instant::now()),
        }
    }

    core.shutdown();
    info!("session stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Handle to a running session task.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<PanelCommand>,
    events: broadcast::Sender<PanelEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn send(&self, command: PanelCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }

    /// Receive every [`PanelEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the session and wait for its task to finish. The socket is
    /// closed and no reconnect follows.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("session task ended abnormally: {}", e);
        }
    }
}

/// Start the session task and connect to the backend.
pub fn spawn_session(config: SessionConfig, store: StateStore) -> Result<SessionHandle, SessionError> {
    let backend = BackendClient::new(&config.base_url, config.request_timeout)?;
    let (connection, socket_events) = ConnectionManager::new(config.reconnect.clone());
    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (http_tx, http_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let core = SessionCore {
        ws_url: config.ws_url,
        connection,
        turns: TurnController::new(config.turn_timeout),
        metrics: MetricsAggregator::new(),
        modes: ModeController::new(),
        store,
        backend,
        http_tx,
        events: events.clone(),
        connection_error: None,
    };

    let task = tokio::spawn(run_session(
        core,
        socket_events,
        command_rx,
        http_rx,
        cancel.clone(),
    ));

    Ok(SessionHandle {
        commands,
        events,
        cancel,
        task,
    })
}
