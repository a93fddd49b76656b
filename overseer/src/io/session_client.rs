//! Client for the remote agent-session API.
//!
//! Every call is bounded by connect/read timeouts and retried with exponential
//! backoff on transport failures (timeouts, dropped connections, truncated
//! bodies, gateway errors). Any other non-success status is an application
//! rejection and is returned immediately as [`SessionError::Api`].

use std::env;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::session_id::normalize;
use crate::core::types::RepoId;
use crate::io::config::SessionConfig;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session API key missing: set {env}")]
    MissingApiKey { env: String },
    #[error("session API unreachable after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },
    #[error("session API rejected request ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("decode session API response: {0}")]
    Decode(String),
    #[error("build session API client: {0}")]
    Client(String),
}

impl SessionError {
    /// True for server-side rejections, as opposed to connectivity problems.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Api { .. })
    }
}

/// Server-reported lifecycle state. Read-only from this side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Queued,
    Planning,
    AwaitingPlanApproval,
    AwaitingUserFeedback,
    InProgress,
    Paused,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SessionState {
    /// A terminal session no longer accepts messages.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Session {
    /// Resource name, `sessions/<id>`.
    pub name: String,
    pub id: Option<String>,
    pub title: Option<String>,
    pub state: SessionState,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
    pub url: Option<String>,
}

impl Session {
    pub fn session_id(&self) -> &str {
        self.id.as_deref().unwrap_or_else(|| normalize(&self.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Activity {
    pub name: String,
    pub id: Option<String>,
    pub description: Option<String>,
    pub originator: Option<String>,
    pub create_time: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutomationMode {
    #[serde(rename = "AUTOMATION_MODE_UNSPECIFIED")]
    Unspecified,
    /// The agent opens a pull request when it finishes.
    #[default]
    AutoCreatePr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub prompt: String,
    pub repo: RepoId,
    pub starting_branch: String,
    pub title: Option<String>,
    pub require_plan_approval: bool,
    pub automation_mode: AutomationMode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody<'a> {
    prompt: &'a str,
    source_context: SourceContext<'a>,
    automation_mode: AutomationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    require_plan_approval: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceContext<'a> {
    source: String,
    github_repo_context: RepoContext<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepoContext<'a> {
    starting_branch: &'a str,
}

impl<'a> From<&'a CreateSessionRequest> for CreateSessionBody<'a> {
    fn from(request: &'a CreateSessionRequest) -> Self {
        Self {
            prompt: &request.prompt,
            source_context: SourceContext {
                source: format!("sources/github/{}/{}", request.repo.owner, request.repo.name),
                github_repo_context: RepoContext {
                    starting_branch: &request.starting_branch,
                },
            },
            automation_mode: request.automation_mode,
            title: request.title.as_deref(),
            require_plan_approval: request.require_plan_approval,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActivityPage {
    activities: Vec<Activity>,
}

/// Operations the control loop consumes. Implemented over HTTP by
/// [`SessionClient`] and by scripted doubles in tests.
pub trait SessionApi {
    fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, SessionError>;
    fn get_session(&self, id: &str) -> Result<Session, SessionError>;
    fn send_message(&self, id: &str, text: &str) -> Result<(), SessionError>;
    fn approve_plan(&self, id: &str) -> Result<(), SessionError>;
    /// Activities of a session, optionally only those created after an
    /// RFC 3339 timestamp.
    fn list_activities(
        &self,
        id: &str,
        created_after: Option<&str>,
    ) -> Result<Vec<Activity>, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling up to the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// One failed attempt, classified.
enum AttemptError {
    Retryable(String),
    Fatal(SessionError),
}

#[derive(Debug, Clone)]
pub struct SessionClient {
    http: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl SessionClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SessionError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|err| SessionError::Client(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry,
        })
    }

    /// Build from config, reading the API key from the configured variable.
    pub fn from_config(cfg: &SessionConfig) -> Result<Self, SessionError> {
        let api_key = env::var(&cfg.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| SessionError::MissingApiKey {
                env: cfg.api_key_env.clone(),
            })?;
        Self::new(
            &cfg.base_url,
            api_key,
            Duration::from_secs(cfg.connect_timeout_secs),
            Duration::from_secs(cfg.read_timeout_secs),
            RetryPolicy {
                max_attempts: cfg.max_attempts,
                initial_backoff: Duration::from_millis(cfg.backoff_initial_ms),
                max_backoff: Duration::from_millis(cfg.backoff_max_ms),
            },
        )
    }

    fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<String, SessionError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(method.clone(), &url, query, body) {
                Ok(text) => return Ok(text),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retryable(message)) => {
                    if attempt >= self.retry.max_attempts {
                        warn!(attempt, %method, path, %message, "session API retries exhausted");
                        return Err(SessionError::Transport {
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        %method,
                        path,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %message,
                        "transient session API failure, retrying"
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    fn attempt(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<String, AttemptError> {
        let mut request = self
            .http
            .request(method, url)
            .header("X-Goog-Api-Key", &self.api_key);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().map_err(|err| {
            if err.is_builder() {
                AttemptError::Fatal(SessionError::Client(err.to_string()))
            } else {
                AttemptError::Retryable(err.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|err| AttemptError::Retryable(format!("read response body: {err}")))?;
        if is_retryable_status(status) {
            return Err(AttemptError::Retryable(format!("{status}: {}", text.trim())));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(SessionError::Api {
                status: status.as_u16(),
                body: text,
            }));
        }
        Ok(text)
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SessionError> {
        let text = self.execute(Method::GET, path, query, None)?;
        decode(&text)
    }

    fn post(&self, path: &str, body: &Value) -> Result<String, SessionError> {
        self.execute(Method::POST, path, &[], Some(body))
    }
}

impl SessionApi for SessionClient {
    #[instrument(skip_all, fields(repo = %request.repo, branch = %request.starting_branch))]
    fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, SessionError> {
        let body = serde_json::to_value(CreateSessionBody::from(request))
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        let text = self.post("sessions", &body)?;
        let session: Session = decode(&text)?;
        debug!(session_id = session.session_id(), "session created");
        Ok(session)
    }

    #[instrument(skip_all, fields(session_id = %normalize(id)))]
    fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        self.get_json(&format!("sessions/{}", normalize(id)), &[])
    }

    #[instrument(skip_all, fields(session_id = %normalize(id)))]
    fn send_message(&self, id: &str, text: &str) -> Result<(), SessionError> {
        self.post(
            &format!("sessions/{}:sendMessage", normalize(id)),
            &json!({ "prompt": text }),
        )?;
        debug!("message sent");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %normalize(id)))]
    fn approve_plan(&self, id: &str) -> Result<(), SessionError> {
        self.post(&format!("sessions/{}:approvePlan", normalize(id)), &json!({}))?;
        debug!("plan approved");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %normalize(id)))]
    fn list_activities(
        &self,
        id: &str,
        created_after: Option<&str>,
    ) -> Result<Vec<Activity>, SessionError> {
        let query: Vec<(&str, &str)> = created_after
            .map(|after| ("createTime", after))
            .into_iter()
            .collect();
        let page: ActivityPage =
            self.get_json(&format!("sessions/{}/activities", normalize(id)), &query)?;
        Ok(page.activities)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, SessionError> {
    let text = if text.trim().is_empty() { "{}" } else { text };
    serde_json::from_str(text).map_err(|err| SessionError::Decode(err.to_string()))
}
