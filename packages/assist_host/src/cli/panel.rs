//! Line-oriented panel: turns typed lines into [`PanelCommand`]s and
//! [`PanelEvent`]s into printable lines.

use assist_session::connection::ConnectionStatus;
use assist_session::panel::{Notice, NoticeLevel};
use assist_session::turn::TurnStatus;
use assist_session::{Mode, PanelCommand, PanelEvent, StateSnapshot};

pub const HELP: &str = "\
commands:
  <text>                          send a chat message
  /start <goal> | <project> | <path>
                                  start a unit of work (project mode)
  /mode learn|project             switch operating mode
  /retry                          reconnect after giving up
  /state                          print the current state
  /help                           this text
  /quit                           leave";

/// What a typed line asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Command(PanelCommand),
    Help,
    Quit,
    Empty,
}

pub fn parse_line(line: &str) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Input::Command(PanelCommand::SendMessage {
            text: line.to_string(),
        }));
    };

    let (verb, args) = match rest.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb, args.trim()),
        None => (rest, ""),
    };

    match verb {
        "quit" | "exit" => Ok(Input::Quit),
        "help" => Ok(Input::Help),
        "retry" => Ok(Input::Command(PanelCommand::RetryConnection)),
        "state" => Ok(Input::Command(PanelCommand::RequestState)),
        "mode" => {
            let mode = match args {
                "learn" | "git" | "git_learning" => Mode::GitLearning,
                "project" | "work" | "project_working" => Mode::ProjectWorking,
                other => return Err(format!("unknown mode '{other}' (try learn or project)")),
            };
            Ok(Input::Command(PanelCommand::SetMode { mode }))
        }
        "start" => {
            // Blank fields pass through; the session rejects them with a
            // validation notice naming what is missing.
            let mut parts = args.splitn(3, '|').map(|p| p.trim().to_string());
            let goal = parts.next().unwrap_or_default();
            let project = parts.next().unwrap_or_default();
            let codebase_path = parts.next().unwrap_or_default();
            Ok(Input::Command(PanelCommand::StartWork {
                goal,
                project,
                codebase_path,
            }))
        }
        other => Err(format!("unknown command '/{other}' (try /help)")),
    }
}

/// The parts of a snapshot worth a status line.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusLine {
    pub connection: ConnectionStatus,
    pub retry_count: u32,
    pub mode: Mode,
    pub total_tokens: u64,
    pub model: Option<String>,
    pub turn: TurnStatus,
    pub progress: Option<f64>,
}

impl StatusLine {
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let session = &snapshot.session;
        Self {
            connection: session.connection.status,
            retry_count: session.connection.retry_count,
            mode: session.mode,
            total_tokens: session.total_tokens,
            model: session.current_model.clone(),
            turn: session.turn.status,
            progress: session.progress.percentage,
        }
    }

    pub fn render(&self) -> String {
        let mut line = format!("[{}", self.connection);
        if self.retry_count > 0 && self.connection != ConnectionStatus::Connected {
            line.push_str(&format!(" retry {}", self.retry_count));
        }
        line.push_str(match self.mode {
            Mode::ProjectWorking => " | project",
            Mode::GitLearning => " | learning",
        });
        if let Some(pct) = self.progress {
            line.push_str(&format!(" {pct:.0}%"));
        }
        line.push_str(&format!(" | {} tokens", self.total_tokens));
        if let Some(model) = &self.model {
            line.push_str(&format!(" | {model}"));
        }
        if self.turn == TurnStatus::AwaitingResponse {
            line.push_str(" | waiting");
        }
        line.push(']');
        line
    }
}

/// Renders events, printing the status line only when it changes.
#[derive(Default)]
pub struct Renderer {
    last_status: Option<StatusLine>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines to print for `event`. Empty when nothing visible changed.
    pub fn render(&mut self, event: &PanelEvent) -> Vec<String> {
        match event {
            PanelEvent::State { snapshot } => {
                let status = StatusLine::from_snapshot(snapshot);
                if self.last_status.as_ref() == Some(&status) {
                    return Vec::new();
                }
                let line = status.render();
                self.last_status = Some(status);
                vec![line]
            }
            PanelEvent::Assistant {
                text,
                tokens,
                model,
                ..
            } => {
                let footer = match model {
                    Some(model) => format!("  ({tokens} tokens, {model})"),
                    None => format!("  ({tokens} tokens)"),
                };
                let mut lines: Vec<String> = text.lines().map(|l| format!("assistant> {l}")).collect();
                if lines.is_empty() {
                    lines.push("assistant>".to_string());
                }
                lines.push(footer);
                lines
            }
            PanelEvent::Progress { progress } => {
                let mut line = String::from("learning:");
                if let Some(pct) = progress.percentage {
                    line.push_str(&format!(" {pct:.0}%"));
                }
                if let Some(repo) = &progress.current_repo {
                    line.push_str(&format!(" {repo}"));
                }
                if let Some(n) = progress.repos_analyzed {
                    line.push_str(&format!(" repos={n}"));
                }
                if let Some(n) = progress.files_processed {
                    line.push_str(&format!(" files={n}"));
                }
                if let Some(n) = progress.lines_processed {
                    line.push_str(&format!(" lines={n}"));
                }
                if let Some(msg) = &progress.status_message {
                    line.push_str(&format!(" ({msg})"));
                }
                vec![line]
            }
            PanelEvent::Ack { ack } => vec![format!("backend: {}", ack.value)],
            PanelEvent::Notice { notice } => vec![render_notice(notice)],
        }
    }
}

fn render_notice(notice: &Notice) -> String {
    let tag = match notice.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Warning => "warn",
        NoticeLevel::Error => "error",
    };
    format!("[{tag}] {} ({})", notice.message, notice.code)
}
