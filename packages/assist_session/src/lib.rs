//! Assist session
//!
//! Session and connection manager that sits between an assistant panel (the
//! presentation surface), its host process and a remote AI backend.
//!
//! - [`connection`]: the single WebSocket, with capped exponential-backoff
//!   reconnects
//! - [`router`]: normalizes every inbound frame shape into an [`Envelope`]
//! - [`turn`]: enforces at most one outstanding request
//! - [`metrics`]: token accounting (explicit or estimated), latency, model
//! - [`mode`]: project work vs. GitHub learning
//! - [`store`]: persistent and session state, pushed to the panel as snapshots
//! - [`backend`]: `POST /start`
//! - [`session`]: the event loop that owns all of the above
//!
//! Most callers only need [`spawn_session`]:
//!
//! ```no_run
//! use assist_session::{PanelCommand, SessionConfig, StateStore, spawn_session};
//!
//! # async fn run() -> Result<(), assist_session::SessionError> {
//! let session = spawn_session(SessionConfig::default(), StateStore::in_memory())?;
//! let mut events = session.subscribe();
//! session.send(PanelCommand::SendMessage { text: "hello".into() })?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod mode;
pub mod observer;
pub mod panel;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;
pub mod turn;

pub use backend::BackendClient;
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionStatus, ReconnectPolicy, SocketEvents,
    StatusEvent,
};
pub use error::{RecoveryAction, SessionError, StoreError, TurnError};
pub use metrics::{MetricsAggregator, MetricsSnapshot, estimate_tokens};
pub use mode::ModeController;
pub use observer::{Observers, Subscription};
pub use panel::{Notice, NoticeLevel, PanelCommand, PanelEvent};
pub use protocol::{LearningProgress, Mode, StartRequest};
pub use router::{AssistantReply, Envelope, EnvelopeKind, classify};
pub use session::{SessionConfig, SessionHandle, spawn_session};
pub use store::{
    JsonFilePreferences, MemoryPreferences, PreferenceStore, Preferences, StateField,
    StateSnapshot, StateStore,
};
pub use turn::{TurnController, TurnId, TurnStatus};
