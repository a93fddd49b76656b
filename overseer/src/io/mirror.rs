//! Remote copy of the state file, pushed to the integration branch through the
//! GitHub contents API.
//!
//! The update is a compare-and-swap: read the current blob SHA, then `PUT`
//! with that SHA so a concurrent writer makes the request fail instead of
//! silently overwriting. Mirroring never blocks the loop; callers log and
//! continue on error.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::cycle_state::CycleState;
use crate::core::types::RepoId;
use crate::io::config::MirrorConfig;
use crate::io::state_store::{render_state, save_state};

const USER_AGENT: &str = "overseer/state-mirror";

pub trait StateMirror {
    fn mirror(&self, contents: &str, message: &str) -> Result<()>;
}

/// Contents API client bound to one file on one branch.
#[derive(Debug, Clone)]
pub struct GitHubContentsMirror {
    http: Client,
    api_base_url: String,
    token: String,
    repo: RepoId,
    branch: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

impl GitHubContentsMirror {
    pub fn new(
        api_base_url: &str,
        token: impl Into<String>,
        repo: RepoId,
        branch: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("build mirror http client")?;
        Ok(Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            repo,
            branch: branch.into(),
            path: path.into(),
        })
    }

    /// Build from config, or `None` when mirroring is disabled or no token is
    /// present in the environment.
    pub fn from_config(cfg: &MirrorConfig, repo: &RepoId, branch: &str) -> Result<Option<Self>> {
        if !cfg.enabled {
            debug!("state mirroring disabled");
            return Ok(None);
        }
        let Some(token) = env::var(&cfg.token_env).ok().filter(|t| !t.trim().is_empty()) else {
            info!(token_env = %cfg.token_env, "no token, skipping state mirroring");
            return Ok(None);
        };
        Self::new(&cfg.api_base_url, token, repo.clone(), branch, &cfg.path).map(Some)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base_url,
            self.repo.owner,
            self.repo.name,
            self.path.trim_start_matches('/')
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(&self.token)
    }

    /// SHA of the current blob on the branch; `None` if the file is absent.
    fn current_sha(&self) -> Result<Option<String>> {
        let response = self
            .authorized(self.http.get(self.endpoint()))
            .query(&[("ref", self.branch.as_str())])
            .send()
            .context("fetch mirrored file metadata")?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("contents lookup failed ({status}): {body}"));
        }
        let payload: ContentsResponse = response.json().context("decode contents response")?;
        Ok(Some(payload.sha))
    }
}

impl StateMirror for GitHubContentsMirror {
    #[instrument(skip_all, fields(repo = %self.repo, branch = %self.branch, path = %self.path))]
    fn mirror(&self, contents: &str, message: &str) -> Result<()> {
        let sha = self.current_sha()?;
        debug!(existing = sha.is_some(), "updating mirrored state");
        let payload = PutContents {
            message,
            content: STANDARD.encode(contents),
            branch: &self.branch,
            sha,
        };
        let response = self
            .authorized(self.http.put(self.endpoint()))
            .json(&payload)
            .send()
            .context("upload mirrored state")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("contents update failed ({status}): {body}"));
        }
        info!("state mirrored");
        Ok(())
    }
}

/// Save locally, then mirror. Only the local save can fail the caller.
pub fn save_and_mirror(
    path: &Path,
    state: &CycleState,
    mirror: Option<&dyn StateMirror>,
    message: &str,
) -> Result<()> {
    save_state(path, state)?;
    if let Some(mirror) = mirror {
        let contents = render_state(state)?;
        if let Err(err) = mirror.mirror(&contents, message) {
            warn!(err = format!("{err:#}"), "state mirror failed");
        }
    }
    Ok(())
}
