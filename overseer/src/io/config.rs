//! Overseer configuration stored under `.overseer/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::core::types::RepoId;

pub const DEFAULT_CONFIG_PATH: &str = ".overseer/config.toml";

/// Overseer configuration (TOML).
///
/// Edited by humans and read by every command. Missing fields fall back to
/// defaults; the result is validated before use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OverseerConfig {
    /// `owner/name`; overridden by `--repo` and `GITHUB_REPOSITORY`.
    pub repository: Option<String>,
    pub remote: String,
    pub default_branch: String,
    /// Long-lived branch agents start from and merge back into.
    pub integration_branch: String,
    /// Login whose open pull requests the feedback cycle inspects.
    pub author: String,
    pub state_path: PathBuf,
    pub gh_timeout_secs: u64,
    /// Limit for each `git` call (fetch, ls-remote, push, ...).
    pub git_timeout_secs: u64,
    pub session: SessionConfig,
    pub mirror: MirrorConfig,
    pub rotation: RotationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

/// Remote copy of the state file on the integration branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub api_base_url: String,
    pub token_env: String,
    /// Repository path of the mirrored file.
    pub path: String,
}

/// Personas taking turns on one track. Empty `personas` disables rotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RotationConfig {
    pub track: String,
    /// Rotation order.
    pub personas: Vec<String>,
    /// Holds `<persona>.md`, the prompt each persona's session starts with.
    pub prompts_dir: PathBuf,
    /// A working session older than this is abandoned and the next persona
    /// starts.
    pub session_timeout_minutes: u64,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            repository: None,
            remote: "origin".to_string(),
            default_branch: "main".to_string(),
            integration_branch: "jules".to_string(),
            author: "app/google-labs-jules".to_string(),
            state_path: PathBuf::from(".overseer/cycle_state.json"),
            gh_timeout_secs: 120,
            git_timeout_secs: 120,
            session: SessionConfig::default(),
            mirror: MirrorConfig::default(),
            rotation: RotationConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://jules.googleapis.com/v1alpha".to_string(),
            api_key_env: "JULES_API_KEY".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            max_attempts: 3,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            path: ".overseer/cycle_state.json".to_string(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            track: "cycle".to_string(),
            personas: Vec::new(),
            prompts_dir: PathBuf::from(".overseer/personas"),
            session_timeout_minutes: 30,
        }
    }
}

impl OverseerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("remote", &self.remote),
            ("default_branch", &self.default_branch),
            ("integration_branch", &self.integration_branch),
            ("author", &self.author),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must be non-empty"));
            }
        }
        if self.integration_branch == self.default_branch {
            return Err(anyhow!(
                "integration_branch must differ from default_branch ({})",
                self.default_branch
            ));
        }
        if self.state_path.as_os_str().is_empty() {
            return Err(anyhow!("state_path must be non-empty"));
        }
        if self.gh_timeout_secs == 0 {
            return Err(anyhow!("gh_timeout_secs must be > 0"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if let Some(raw) = &self.repository
            && RepoId::parse(raw).is_none()
        {
            return Err(anyhow!("repository must be owner/name, got '{raw}'"));
        }
        self.session.validate()?;
        self.mirror.validate()?;
        self.rotation.validate()
    }

    pub fn gh_timeout(&self) -> Duration {
        Duration::from_secs(self.gh_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(anyhow!("session.base_url must be non-empty"));
        }
        if self.api_key_env.trim().is_empty() {
            return Err(anyhow!("session.api_key_env must be non-empty"));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(anyhow!("session timeouts must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("session.max_attempts must be > 0"));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(anyhow!(
                "session.backoff_initial_ms must not exceed session.backoff_max_ms"
            ));
        }
        Ok(())
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.api_base_url.trim().is_empty() || self.path.trim().is_empty() {
            return Err(anyhow!("mirror.api_base_url and mirror.path must be non-empty"));
        }
        if self.token_env.trim().is_empty() {
            return Err(anyhow!("mirror.token_env must be non-empty"));
        }
        Ok(())
    }
}

impl RotationConfig {
    pub fn enabled(&self) -> bool {
        !self.personas.is_empty()
    }

    pub fn session_timeout(&self) -> TimeDelta {
        i64::try_from(self.session_timeout_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_timeout_minutes == 0 {
            return Err(anyhow!("rotation.session_timeout_minutes must be > 0"));
        }
        if !self.enabled() {
            return Ok(());
        }
        if self.track.trim().is_empty() {
            return Err(anyhow!("rotation.track must be non-empty"));
        }
        let mut seen = HashSet::new();
        for persona in &self.personas {
            if persona.trim().is_empty() || persona.contains(['/', '\\']) {
                return Err(anyhow!("rotation persona '{persona}' is not a plain name"));
            }
            if !seen.insert(persona.as_str()) {
                return Err(anyhow!("rotation persona '{persona}' is listed twice"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OverseerConfig::default()`.
pub fn load_config(path: &Path) -> Result<OverseerConfig> {
    if !path.exists() {
        let cfg = OverseerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OverseerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Repository identity: explicit flag, then environment, then config, then
/// the URL of the git remote.
pub fn resolve_repo(
    flag: Option<&str>,
    env: Option<&str>,
    cfg: &OverseerConfig,
    remote_url: Option<&str>,
) -> Result<RepoId> {
    let candidates = [
        ("--repo", flag),
        ("GITHUB_REPOSITORY", env),
        ("config repository", cfg.repository.as_deref()),
    ];
    for (source, raw) in candidates {
        let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
            continue;
        };
        return RepoId::parse(raw)
            .ok_or_else(|| anyhow!("{source} must be owner/name, got '{raw}'"));
    }
    if let Some(url) = remote_url.filter(|url| !url.trim().is_empty()) {
        return RepoId::from_remote_url(url)
            .ok_or_else(|| anyhow!("cannot derive owner/name from remote url '{url}'"));
    }
    Err(anyhow!(
        "repository identity unknown: pass --repo, set GITHUB_REPOSITORY, set repository in config, or add a git remote"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OverseerConfig::default());
    }

    #[test]
    fn full_file_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".overseer/config.toml");
        let cfg = OverseerConfig {
            repository: Some("octo/widgets".to_string()),
            git_timeout_secs: 15,
            ..OverseerConfig::default()
        };
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, toml::to_string_pretty(&cfg).expect("toml")).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.git_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "author = \"bot\"\n[session]\nmax_attempts = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.author, "bot");
        assert_eq!(cfg.session.max_attempts, 5);
        assert_eq!(cfg.session.read_timeout_secs, 60);
        assert_eq!(cfg.integration_branch, "jules");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "integration_branch = \"main\"\n").expect("write");
        assert!(load_config(&path).is_err());

        let cfg = OverseerConfig {
            repository: Some("not-a-repo".to_string()),
            ..OverseerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rotation_section_is_parsed_and_checked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[rotation]\npersonas = [\"curator\", \"docs\"]\nsession_timeout_minutes = 45\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(cfg.rotation.enabled());
        assert_eq!(cfg.rotation.track, "cycle");
        assert_eq!(cfg.rotation.session_timeout(), TimeDelta::minutes(45));
        assert!(!OverseerConfig::default().rotation.enabled());

        fs::write(&path, "[rotation]\npersonas = [\"docs\", \"docs\"]\n").expect("write");
        assert!(load_config(&path).is_err());
        fs::write(&path, "[rotation]\npersonas = [\"../escape\"]\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn repo_resolution_prefers_flag_then_env_then_config() {
        let cfg = OverseerConfig {
            repository: Some("cfg/repo".to_string()),
            ..OverseerConfig::default()
        };
        let url = Some("git@github.com:url/repo.git");
        let repo = resolve_repo(Some("flag/repo"), Some("env/repo"), &cfg, url).expect("flag");
        assert_eq!(repo.to_string(), "flag/repo");
        let repo = resolve_repo(None, Some("env/repo"), &cfg, url).expect("env");
        assert_eq!(repo.to_string(), "env/repo");
        let repo = resolve_repo(None, Some(""), &cfg, url).expect("config");
        assert_eq!(repo.to_string(), "cfg/repo");
        assert!(resolve_repo(None, None, &OverseerConfig::default(), None).is_err());
        assert!(resolve_repo(Some("bad"), None, &cfg, url).is_err());
    }

    #[test]
    fn remote_url_is_the_last_fallback() {
        let cfg = OverseerConfig::default();
        let https = resolve_repo(None, None, &cfg, Some("https://github.com/octo/widgets.git"))
            .expect("https");
        assert_eq!(https.to_string(), "octo/widgets");
        let ssh = resolve_repo(None, None, &cfg, Some("git@github.com:octo/gadgets.git"))
            .expect("ssh");
        assert_eq!(ssh.to_string(), "octo/gadgets");
        assert!(resolve_repo(None, None, &cfg, Some("../origin.git")).is_err());
    }
}
