//! Wire types exchanged with the backend.
//!
//! Outbound WebSocket frames are untagged JSON objects; the backend tells
//! them apart by field names (`command` vs `message`). Inbound frames are
//! not deserialized here: their shapes vary too much, see [`crate::router`].

use serde::{Deserialize, Serialize};

/// Mutually exclusive operating mode of the session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Ordinary work on the user's own project.
    #[default]
    ProjectWorking,
    /// Background learning/ingestion from GitHub repositories.
    GitLearning,
}

impl Mode {
    pub fn from_git_learning(enabled: bool) -> Self {
        if enabled {
            Mode::GitLearning
        } else {
            Mode::ProjectWorking
        }
    }

    pub fn is_git_learning(self) -> bool {
        matches!(self, Mode::GitLearning)
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::ProjectWorking => "project",
            Mode::GitLearning => "git-learning",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Learning control command sent when the mode changes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    StartLearning,
    StopLearning,
}

/// Source the backend should learn from. Only GitHub exists today.
pub const LEARNING_SOURCE: &str = "github";

/// `{command: "start_learning" | "stop_learning", mode: "github"}`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlFrame {
    pub command: ControlCommand,
    pub mode: String,
}

impl ControlFrame {
    pub fn new(command: ControlCommand) -> Self {
        Self {
            command,
            mode: LEARNING_SOURCE.to_string(),
        }
    }

    /// Control frame that moves the backend into `mode`.
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::GitLearning => Self::new(ControlCommand::StartLearning),
            Mode::ProjectWorking => Self::new(ControlCommand::StopLearning),
        }
    }
}

/// `{message: string, git_learning_mode: boolean}`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatFrame {
    pub message: String,
    pub git_learning_mode: bool,
}

/// Body of `POST {baseUrl}/start`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartRequest {
    pub goal: String,
    pub project: String,
    pub codebase_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_learning_mode: Option<bool>,
}

impl StartRequest {
    /// Trim every field and reject empty ones. Blocks the request before any
    /// network call.
    pub fn validated(
        goal: &str,
        project: &str,
        codebase_path: &str,
    ) -> Result<Self, crate::SessionError> {
        let fields = [
            ("goal", goal.trim()),
            ("project", project.trim()),
            ("codebase path", codebase_path.trim()),
        ];
        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(crate::SessionError::Validation(format!(
                "missing required input: {}",
                missing.join(", ")
            )));
        }
        Ok(Self {
            goal: fields[0].1.to_string(),
            project: fields[1].1.to_string(),
            codebase_path: fields[2].1.to_string(),
            git_learning_mode: None,
        })
    }
}

/// Response of `POST /start`.
///
/// `success` is optional because older backends answer with a bare
/// `{prompt}` object.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StartResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tokens: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Progress of a GitHub learning run. Every field is optional; see
/// [`LearningProgress::merge`].
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LearningProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos_analyzed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl LearningProgress {
    /// Overwrite only the fields `update` carries.
    pub fn merge(&mut self, update: &LearningProgress) {
        if update.percentage.is_some() {
            self.percentage = update.percentage;
        }
        if update.repos_analyzed.is_some() {
            self.repos_analyzed = update.repos_analyzed;
        }
        if update.files_processed.is_some() {
            self.files_processed = update.files_processed;
        }
        if update.lines_processed.is_some() {
            self.lines_processed = update.lines_processed;
        }
        if update.current_repo.is_some() {
            self.current_repo.clone_from(&update.current_repo);
        }
        if update.status_message.is_some() {
            self.status_message.clone_from(&update.status_message);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
