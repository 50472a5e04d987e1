//! HTTP client for the backend's `POST /start`.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::SessionError;
use crate::protocol::{StartRequest, StartResponse};
use crate::router::AssistantReply;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest slice of an error body quoted back to the user.
const MAX_ERROR_BODY: usize = 200;

#[derive(Clone, Debug)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// `timeout` of `None` waits as long as the backend takes.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, SessionError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| SessionError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue a unit of work. The returned reply is the backend's prompt.
    pub async fn start(&self, request: &StartRequest) -> Result<AssistantReply, SessionError> {
        let url = format!("{}/start", self.base_url);
        info!(url = %url, project = %request.project, "starting work");

        let response = self.http.post(&url).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, len = body.len(), "start response");

        interpret_start(status, &body)
    }
}

/// Map a `/start` response to a reply or a backend error.
fn interpret_start(status: StatusCode, body: &str) -> Result<AssistantReply, SessionError> {
    let parsed: Option<StartResponse> = serde_json::from_str(body).ok();

    if !status.is_success() {
        let message = parsed
            .and_then(|r| r.error)
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| {
                let body = body.trim();
                if body.is_empty() {
                    format!("backend returned {status}")
                } else {
                    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
                    format!("backend returned {status}: {snippet}")
                }
            });
        warn!(%status, "start failed: {}", message);
        return Err(SessionError::Backend(message));
    }

    let Some(response) = parsed else {
        return Err(SessionError::Backend(
            "backend sent an unreadable response".into(),
        ));
    };

    if response.success == Some(false) {
        let message = response
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "backend reported failure".into());
        warn!("start rejected: {}", message);
        return Err(SessionError::Backend(message));
    }

    // Older backends answer with a bare {prompt}.
    let Some(prompt) = response.prompt else {
        return Err(SessionError::Backend(
            response
                .error
                .unwrap_or_else(|| "backend response had no prompt".into()),
        ));
    };

    Ok(AssistantReply {
        text: prompt,
        tokens: response
            .tokens
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(|t| t.round() as u64),
        model: response.model.filter(|m| !m.trim().is_empty()),
    })
}
