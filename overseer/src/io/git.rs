//! Git adapter for branch lifecycle commands.
//!
//! A small, explicit wrapper around `git` subprocess calls. Nothing here
//! resets, force-pushes, or deletes remote refs.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const GIT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Wrapper for executing git commands in a working directory. Every call is
/// killed once it exceeds `timeout`.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `git fetch <remote> <branch>`.
    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    pub fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        debug!("fetching");
        self.run(&["fetch", remote, branch])?;
        Ok(())
    }

    /// SHA of `refs/heads/<branch>` as the remote reports it right now, or
    /// `None` if the remote has no such branch.
    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    pub fn remote_branch_sha(&self, remote: &str, branch: &str) -> Result<Option<String>> {
        let out = self.run(&["ls-remote", "--heads", remote, branch])?;
        let wanted = format!("refs/heads/{branch}");
        let sha = out.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let sha = fields.next()?;
            (fields.next()? == wanted).then(|| sha.to_string())
        });
        debug!(found = sha.is_some(), "remote branch lookup");
        Ok(sha)
    }

    /// True if `refs/heads/<branch>` exists on the remote.
    pub fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        Ok(self.remote_branch_sha(remote, branch)?.is_some())
    }

    /// `git branch -D <branch>`.
    pub fn delete_local_branch(&self, branch: &str) -> Result<()> {
        self.run(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Create a local branch at `start_point` without checking it out.
    pub fn create_branch_at(&self, branch: &str, start_point: &str) -> Result<()> {
        self.run(&["branch", branch, start_point])?;
        Ok(())
    }

    /// `git push -u <remote> <branch>`. Never forced.
    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    pub fn push_upstream(&self, remote: &str, branch: &str) -> Result<()> {
        debug!("pushing");
        self.run(&["push", "-u", remote, branch])?;
        Ok(())
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run(&["rev-parse", "--verify", rev])?;
        Ok(out.trim().to_string())
    }

    /// `git config --get <key>`; `None` when the key is unset.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let label = format!("git config --get {key}");
        let out = self.spawn(&["config", "--get", key], &label)?;
        // Exit status 1 means the key is not set.
        if out.status.code() == Some(1) && !out.timed_out {
            return Ok(None);
        }
        let value = out.into_success(&label)?;
        Ok(Some(value.trim().to_string()).filter(|value| !value.is_empty()))
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let label = format!("git {}", args.join(" "));
        self.spawn(args, &label)?.into_success(&label)
    }

    fn spawn(&self, args: &[&str], label: &str) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        run_command_with_timeout(cmd, None, self.timeout, GIT_OUTPUT_LIMIT_BYTES)
            .with_context(|| label.to_string())
    }
}
