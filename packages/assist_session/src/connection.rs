//! ConnectionManager: the single WebSocket to the backend.
//!
//! The manager never blocks. Socket I/O and backoff timers run in spawned
//! tasks that post [`SocketEvent`]s back through the [`SocketEvents`]
//! receiver handed out by [`ConnectionManager::new`]. The owner feeds those
//! events into [`ConnectionManager::handle`], which applies the transition and
//! returns the resulting [`ConnectionEvent`]s (subscribers see the same events).
//!
//! Every socket and timer is tagged with a generation number. Calling
//! `connect`, `disconnect` or opening a reconnect attempt bumps the
//! generation, so late events from a superseded socket are dropped.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SessionError;
use crate::observer::{Observers, Subscription};

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:9999/ws";

const BACKOFF_FACTOR: f64 = 1.5;

/// Backoff parameters for automatic reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect scheduled when `retry_count` attempts have
    /// already been made: `min(max_delay, base_delay * 1.5^retry_count)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        // 1.5^64 is already far beyond any sane cap.
        let factor = BACKOFF_FACTOR.powi(retry_count.min(64) as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// `{status, error?}` emitted on every transition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Everything the manager reports to its owner and subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Status(StatusEvent),
    /// A text frame from the backend, unparsed.
    Message(String),
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Automatic reconnects are exhausted. Emitted once per cycle; only a
    /// manual [`ConnectionManager::retry`] starts a new one.
    MaxAttemptsReached { attempts: u32 },
}

#[derive(Debug)]
pub(crate) enum SocketEventKind {
    Opened,
    Frame(String),
    Error(String),
    Closed { reason: Option<String> },
    RetryDue,
}

/// Notification from a socket or timer task, tagged with its generation.
#[derive(Debug)]
pub struct SocketEvent {
    generation: u64,
    kind: SocketEventKind,
}

/// Receiving side of the manager's socket/timer notifications.
pub struct SocketEvents {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketEvents {
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.rx.recv().await
    }
}

struct ActiveSocket {
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
}

pub struct ConnectionManager {
    policy: ReconnectPolicy,
    status: ConnectionStatus,
    retry_count: u32,
    next_delay: Option<Duration>,
    url: Option<String>,
    generation: u64,
    socket: Option<ActiveSocket>,
    retry_timer: Option<CancellationToken>,
    last_error: Option<String>,
    exhausted: bool,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    observers: Observers<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> (Self, SocketEvents) {
        let (events_tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            policy,
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            next_delay: None,
            url: None,
            generation: 0,
            socket: None,
            retry_timer: None,
            last_error: None,
            exhausted: false,
            events_tx,
            observers: Observers::new("connection"),
        };
        (manager, SocketEvents { rx })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Delay of the currently scheduled reconnect, if any.
    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Register a listener for every [`ConnectionEvent`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    /// Open a socket to `url`, closing any previous one first. Starts a fresh
    /// reconnect cycle.
    pub fn connect(&mut self, url: impl Into<String>) -> Vec<ConnectionEvent> {
        let url = url.into();
        let was_live = self.status != ConnectionStatus::Disconnected;
        if was_live {
            info!(status = %self.status, "closing previous socket before reconnecting");
        }
        self.close_socket();
        self.cancel_retry_timer();

        self.url = Some(url);
        self.retry_count = 0;
        self.next_delay = None;
        self.exhausted = false;
        self.last_error = None;

        let mut out = Vec::new();
        // The cancelled socket task never reports Closed.
        if was_live {
            self.set_status(ConnectionStatus::Disconnected, None, &mut out);
        }
        self.open_socket(&mut out);
        out
    }

    /// Manual retry after the reconnect cycle gave up (or at any other time).
    pub fn retry(&mut self) -> Result<Vec<ConnectionEvent>, SessionError> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| SessionError::Connection("no endpoint to retry".into()))?;
        info!(url = %url, "manual reconnect requested");
        Ok(self.connect(url))
    }

    /// Close the socket and cancel any pending reconnect. Nothing reconnects
    /// until `connect` or `retry` is called again.
    pub fn disconnect(&mut self) -> Vec<ConnectionEvent> {
        self.close_socket();
        self.cancel_retry_timer();
        self.generation += 1;
        self.retry_count = 0;
        self.next_delay = None;
        self.exhausted = false;
        self.last_error = None;

        let mut out = Vec::new();
        if self.status != ConnectionStatus::Disconnected {
            info!("disconnected from backend");
            self.set_status(ConnectionStatus::Disconnected, None, &mut out);
        }
        out
    }

    /// Serialize and write `frame`. Only succeeds while Connected; nothing is
    /// ever queued for later.
    pub fn send<T: Serialize>(&self, frame: &T) -> bool {
        if self.status != ConnectionStatus::Connected {
            debug!(status = %self.status, "send rejected: not connected");
            return false;
        }
        let Some(socket) = &self.socket else {
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(json) => socket.outbound.send(json).is_ok(),
            Err(e) => {
                warn!("failed to serialize outbound frame: {}", e);
                false
            }
        }
    }

    /// Apply a socket/timer notification.
    pub fn handle(&mut self, event: SocketEvent) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        if event.generation != self.generation {
            debug!(
                event_generation = event.generation,
                current = self.generation,
                "ignoring event from superseded socket"
            );
            return out;
        }

        match event.kind {
            SocketEventKind::Opened => {
                info!(url = ?self.url, "connected to backend");
                self.retry_count = 0;
                self.next_delay = None;
                self.exhausted = false;
                self.last_error = None;
                self.set_status(ConnectionStatus::Connected, None, &mut out);
            }
            SocketEventKind::Frame(text) => {
                self.emit(ConnectionEvent::Message(text), &mut out);
            }
            SocketEventKind::Error(error) => {
                warn!("websocket error: {}", error);
                self.last_error = Some(error);
            }
            SocketEventKind::Closed { reason } => {
                self.socket = None;
                let error = self.last_error.take().or(reason);
                info!(error = ?error, "websocket closed");
                self.set_status(ConnectionStatus::Disconnected, error, &mut out);
                self.schedule_reconnect(&mut out);
            }
            SocketEventKind::RetryDue => {
                self.retry_timer = None;
                self.next_delay = None;
                if self.status == ConnectionStatus::Disconnected {
                    debug!(attempt = self.retry_count, "reconnect attempt");
                    self.open_socket(&mut out);
                }
            }
        }
        out
    }

    fn schedule_reconnect(&mut self, out: &mut Vec<ConnectionEvent>) {
        if self.retry_count >= self.policy.max_attempts {
            if !self.exhausted {
                self.exhausted = true;
                warn!(
                    attempts = self.retry_count,
                    "max reconnect attempts reached, waiting for manual retry"
                );
                self.emit(
                    ConnectionEvent::MaxAttemptsReached {
                        attempts: self.retry_count,
                    },
                    out,
                );
            }
            return;
        }

        let delay = self.policy.delay_for(self.retry_count);
        self.retry_count += 1;
        self.next_delay = Some(delay);

        let cancel = CancellationToken::new();
        self.retry_timer = Some(cancel.clone());
        let tx = self.events_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(SocketEvent { generation, kind: SocketEventKind::RetryDue });
                }
            }
        });

        info!(attempt = self.retry_count, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.emit(
            ConnectionEvent::ReconnectScheduled {
                attempt: self.retry_count,
                delay,
            },
            out,
        );
    }

    fn open_socket(&mut self, out: &mut Vec<ConnectionEvent>) {
        let Some(url) = self.url.clone() else {
            return;
        };
        self.generation += 1;

        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.socket = Some(ActiveSocket {
            cancel: cancel.clone(),
            outbound,
        });
        tokio::spawn(run_socket(
            url,
            self.generation,
            outbound_rx,
            self.events_tx.clone(),
            cancel,
        ));

        self.set_status(ConnectionStatus::Connecting, None, out);
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.cancel.cancel();
        }
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }
    }

    fn set_status(
        &mut self,
        status: ConnectionStatus,
        error: Option<String>,
        out: &mut Vec<ConnectionEvent>,
    ) {
        self.status = status;
        let event = ConnectionEvent::Status(StatusEvent {
            status,
            error,
            retry_count: self.retry_count,
        });
        self.emit(event, out);
    }

    fn emit(&self, event: ConnectionEvent, out: &mut Vec<ConnectionEvent>) {
        self.observers.notify(&event);
        out.push(event);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close_socket();
        self.cancel_retry_timer();
    }
}

/// Own one WebSocket until it closes or `cancel` fires.
///
/// Always reports `Closed` after `Opened` or a connect failure, unless
/// cancelled (a cancelled socket has already been superseded).
async fn run_socket(
    url: String,
    generation: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SocketEvent>,
    cancel: CancellationToken,
) {
    let report = |kind: SocketEventKind| {
        let _ = events.send(SocketEvent { generation, kind });
    };

    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            report(SocketEventKind::Error(format!("connect: {e}")));
            report(SocketEventKind::Closed { reason: None });
            return;
        }
    };

    report(SocketEventKind::Opened);
    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        report(SocketEventKind::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => report(SocketEventKind::Frame(text)),
                        Err(_) => debug!("dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_owned())
                            .filter(|r| !r.is_empty());
                    }
                    Some(Ok(_)) => {} // Ping/Pong handled by tungstenite.
                    Some(Err(e)) => {
                        report(SocketEventKind::Error(format!("read: {e}")));
                        break None;
                    }
                    None => break None,
                }
            }
            Some(json) = outbound_rx.recv() => {
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    report(SocketEventKind::Error(format!("send: {e}")));
                    break None;
                }
            }
        }
    };

    report(SocketEventKind::Closed { reason });
}
