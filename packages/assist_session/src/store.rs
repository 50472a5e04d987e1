//! StateStore: the one mutable state object shared with the panel.
//!
//! State lives in two tiers. The persistent tier holds user preferences and is
//! written through a [`PreferenceStore`] whenever it changes. The session tier
//! (token totals, model, progress, connection and turn info) starts fresh on
//! every run.
//!
//! All mutation goes through [`StateStore::update`] / [`StateStore::update_all`]
//! with typed [`StateField`]s. Each call fires exactly one notification
//! carrying the full [`StateSnapshot`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::ConnectionStatus;
use crate::error::StoreError;
use crate::observer::{Observers, Subscription};
use crate::protocol::{LearningProgress, Mode};
use crate::turn::TurnInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Survives restarts; written by the host.
    Persistent,
    /// Reset every run.
    Session,
}

/// Persistent preferences, stored as `{"isGitLearningMode": bool}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(rename = "isGitLearningMode", default)]
    pub is_git_learning_mode: bool,
}

/// The unit of work most recently started through `/start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub goal: String,
    pub project: String,
    pub codebase_path: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub mode: Mode,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_model: Option<String>,
    pub progress: LearningProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectInfo>,
    pub turn: TurnInfo,
    pub connection: ConnectionInfo,
}

/// Full merged state as seen by the panel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub preferences: Preferences,
    pub session: SessionState,
}

impl StateSnapshot {
    pub fn mode(&self) -> Mode {
        self.session.mode
    }
}

/// One typed mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum StateField {
    GitLearningPreference(bool),
    Mode(Mode),
    /// Added to the running total; the total never decreases.
    AddTokens(u64),
    CurrentModel(String),
    /// Merged field by field into the current progress.
    Progress(LearningProgress),
    ClearProgress,
    LastLatencyMs(u64),
    Project(Option<ProjectInfo>),
    Turn(TurnInfo),
    Connection(ConnectionInfo),
}

impl StateField {
    pub fn tier(&self) -> Tier {
        match self {
            Self::GitLearningPreference(_) => Tier::Persistent,
            _ => Tier::Session,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::GitLearningPreference(_) => "isGitLearningMode",
            Self::Mode(_) => "mode",
            Self::AddTokens(_) => "totalTokens",
            Self::CurrentModel(_) => "currentModel",
            Self::Progress(_) | Self::ClearProgress => "learningProgress",
            Self::LastLatencyMs(_) => "lastLatencyMs",
            Self::Project(_) => "project",
            Self::Turn(_) => "turn",
            Self::Connection(_) => "connection",
        }
    }
}

/// Durable storage for the persistent tier.
pub trait PreferenceStore: Send {
    fn load(&self) -> Result<Preferences, StoreError>;
    fn save(&self, preferences: &Preferences) -> Result<(), StoreError>;
}

/// Preferences in a JSON file. A missing file means defaults.
#[derive(Debug, Clone)]
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn load(&self) -> Result<Preferences, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no preferences file, using defaults");
                return Ok(Preferences::default());
            }
            Err(e) => return Err(StoreError::Load(format!("{}: {e}", self.path.display()))),
        };
        serde_json::from_str(&content)
            .map_err(|e| StoreError::Load(format!("{}: {e}", self.path.display())))
    }

    fn save(&self, preferences: &Preferences) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Save(format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(preferences)
            .map_err(|e| StoreError::Save(e.to_string()))?;

        // Write then rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| StoreError::Save(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| StoreError::Save(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

/// In-memory preferences. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    inner: Arc<Mutex<Preferences>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryPreferences {
    pub fn new(preferences: Preferences) -> Self {
        Self {
            inner: Arc::new(Mutex::new(preferences)),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn current(&self) -> Preferences {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl PreferenceStore for MemoryPreferences {
    fn load(&self) -> Result<Preferences, StoreError> {
        Ok(self.current())
    }

    fn save(&self, preferences: &Preferences) -> Result<(), StoreError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| StoreError::Save("preference lock poisoned".into()))?;
        *guard = preferences.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct StateStore {
    backend: Box<dyn PreferenceStore>,
    state: StateSnapshot,
    observers: Observers<StateSnapshot>,
}

impl StateStore {
    /// Load preferences from `backend`. Unreadable preferences fall back to
    /// defaults so a corrupt file never blocks startup.
    pub fn new(backend: Box<dyn PreferenceStore>) -> Self {
        let preferences = backend.load().unwrap_or_else(|e| {
            warn!("{e}; using default preferences");
            Preferences::default()
        });
        let session = SessionState {
            mode: Mode::from_git_learning(preferences.is_git_learning_mode),
            ..Default::default()
        };
        info!(mode = %session.mode, "state store initialized");
        Self {
            backend,
            state: StateSnapshot {
                preferences,
                session,
            },
            observers: Observers::new("state"),
        }
    }

    /// Ephemeral store backed by [`MemoryPreferences`].
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryPreferences::default()))
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.clone()
    }

    pub fn state(&self) -> &StateSnapshot {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.state.session.mode
    }

    /// Listener receives the full snapshot after every update.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StateSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn update(&mut self, field: StateField) -> Result<(), StoreError> {
        self.update_all([field])
    }

    /// Apply every field, persist once if the persistent tier changed, then
    /// notify once. In-memory state is updated even when persisting fails.
    pub fn update_all<I>(&mut self, fields: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = StateField>,
    {
        let mut persist = false;
        let mut any = false;
        for field in fields {
            any = true;
            debug!(key = field.key(), tier = ?field.tier(), "state update");
            persist |= self.apply(field);
        }
        if !any {
            return Ok(());
        }

        let saved = if persist {
            self.backend.save(&self.state.preferences)
        } else {
            Ok(())
        };
        if let Err(e) = &saved {
            warn!("{e}");
        }

        self.observers.notify(&self.state);
        saved
    }

    /// Returns true when the persistent tier changed.
    fn apply(&mut self, field: StateField) -> bool {
        let session = &mut self.state.session;
        match field {
            StateField::GitLearningPreference(enabled) => {
                let changed = self.state.preferences.is_git_learning_mode != enabled;
                self.state.preferences.is_git_learning_mode = enabled;
                return changed;
            }
            StateField::Mode(mode) => session.mode = mode,
            StateField::AddTokens(tokens) => {
                session.total_tokens = session.total_tokens.saturating_add(tokens);
            }
            StateField::CurrentModel(model) => session.current_model = Some(model),
            StateField::Progress(update) => session.progress.merge(&update),
            StateField::ClearProgress => session.progress = LearningProgress::default(),
            StateField::LastLatencyMs(ms) => session.last_latency_ms = Some(ms),
            StateField::Project(project) => session.project = project,
            StateField::Turn(turn) => session.turn = turn,
            StateField::Connection(connection) => session.connection = connection,
        }
        false
    }
}
