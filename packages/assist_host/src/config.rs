use anyhow::{Context, Result};
use assist_session::{ReconnectPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [reconnect]
//                    max_attempts = 20
//
//   env var:         ASSIST_RECONNECT__MAX_ATTEMPTS=20   (double underscore = nesting)
//
//   (single underscore stays within field names: ASSIST_BACKEND__BASE_URL)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub turn: TurnFileConfig,
}

/// Backend endpoints (lives under `[backend]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// 0 disables the timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Reconnect backoff (lives under `[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Turn handling (lives under `[turn]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnFileConfig {
    /// 0 lets a turn wait forever.
    #[serde(default = "default_turn_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TurnFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_turn_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    assist_session::backend::DEFAULT_BASE_URL.to_string()
}
fn default_ws_url() -> String {
    assist_session::connection::DEFAULT_WS_URL.to_string()
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_turn_timeout_secs() -> u64 {
    300
}

/// Build a figment that layers: defaults → config.toml → ASSIST_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ASSIST_BACKEND__WS_URL=ws://host:9999/ws`  →  `backend.ws_url`
///   `ASSIST_TURN__TIMEOUT_SECS=0`  →  `turn.timeout_secs = 0`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("ASSIST_").split("__"))
}

/// Endpoint overrides given on the command line. They beat every other layer.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub ws_url: Option<String>,
    pub base_url: Option<String>,
}

impl FileConfig {
    pub fn apply_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ws_url) = &overrides.ws_url {
            self.backend.ws_url = ws_url.clone();
        }
        if let Some(base_url) = &overrides.base_url {
            self.backend.base_url = base_url.clone();
        }
        self
    }
}

fn secs_or_disabled(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

// =============================================================================
// Runtime config (derived from FileConfig, handed to the session)
// =============================================================================

pub fn session_config_from_file(fc: &FileConfig) -> SessionConfig {
    SessionConfig {
        ws_url: fc.backend.ws_url.clone(),
        base_url: fc.backend.base_url.clone(),
        request_timeout: secs_or_disabled(fc.backend.request_timeout_secs),
        reconnect: ReconnectPolicy {
            max_attempts: fc.reconnect.max_attempts,
            base_delay: Duration::from_millis(fc.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(fc.reconnect.max_delay_ms.max(fc.reconnect.base_delay_ms)),
        },
        turn_timeout: secs_or_disabled(fc.turn.timeout_secs),
        ..SessionConfig::default()
    }
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct AssistConfig {
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl AssistConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".assist"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            state_dir,
        })
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.state_dir.join("preferences.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.backend.base_url, "http://127.0.0.1:8000");
        assert_eq!(fc.backend.ws_url, "ws://127.0.0.1:9999/ws");
        assert_eq!(fc.backend.request_timeout_secs, 120);
        assert_eq!(fc.reconnect.max_attempts, 10);
        assert_eq!(fc.reconnect.base_delay_ms, 1000);
        assert_eq!(fc.reconnect.max_delay_ms, 30_000);
        assert_eq!(fc.turn.timeout_secs, 300);
    }

    #[test]
    fn test_session_config_from_defaults() {
        let sc = session_config_from_file(&FileConfig::default());
        assert_eq!(sc.reconnect, ReconnectPolicy::default());
        assert_eq!(sc.turn_timeout, Some(Duration::from_secs(300)));
        assert_eq!(sc.request_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_zero_timeouts_disable() {
        let mut fc = FileConfig::default();
        fc.turn.timeout_secs = 0;
        fc.backend.request_timeout_secs = 0;
        let sc = session_config_from_file(&fc);
        assert!(sc.turn_timeout.is_none());
        assert!(sc.request_timeout.is_none());
    }

    #[test]
    fn test_cap_never_below_base() {
        let mut fc = FileConfig::default();
        fc.reconnect.base_delay_ms = 5000;
        fc.reconnect.max_delay_ms = 100;
        let sc = session_config_from_file(&fc);
        assert_eq!(sc.reconnect.max_delay, Duration::from_millis(5000));
    }

    #[test]
    fn test_cli_overrides_win() {
        let fc = FileConfig::default().apply_overrides(&CliOverrides {
            ws_url: Some("ws://10.0.0.2:9999/ws".into()),
            base_url: None,
        });
        assert_eq!(fc.backend.ws_url, "ws://10.0.0.2:9999/ws");
        assert_eq!(fc.backend.base_url, "http://127.0.0.1:8000");
    }

    #[test]
    fn test_assist_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("assist");
        let config = AssistConfig::new(Some(data_dir.clone())).unwrap();

        assert_eq!(config.data_dir, data_dir);
        assert!(config.state_dir.is_dir());
        assert_eq!(
            config.preferences_path(),
            data_dir.join("state").join("preferences.json")
        );
        assert_eq!(config.config_toml_path(), data_dir.join("config.toml"));
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.reconnect.max_attempts, 10);
        assert_eq!(fc.backend.ws_url, "ws://127.0.0.1:9999/ws");
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[backend]\nws_url = \"ws://example.test/ws\"\n\n[reconnect]\nmax_attempts = 3\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.backend.ws_url, "ws://example.test/ws");
        assert_eq!(fc.reconnect.max_attempts, 3);
        // Untouched fields keep their defaults.
        assert_eq!(fc.reconnect.base_delay_ms, 1000);
        assert_eq!(fc.backend.base_url, "http://127.0.0.1:8000");
    }

    #[test]
    fn test_resolved_config_serializes_to_toml() {
        let rendered = toml::to_string_pretty(&FileConfig::default()).unwrap();
        assert!(rendered.contains("[backend]"));
        assert!(rendered.contains("max_attempts = 10"));
        let parsed: FileConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.turn.timeout_secs, 300);
    }
}
