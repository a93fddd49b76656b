//! Integration branch lifecycle.
//!
//! The integration branch is created from the default branch when it is
//! missing on the remote and left alone otherwise. An existing remote branch
//! may carry unmerged agent work, so this module never resets, deletes, or
//! force-pushes it.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    /// Already present on the remote; untouched.
    Existing,
    /// Created from the default branch and pushed.
    Created,
}

/// Remote operations needed to create a branch safely.
pub trait BranchRemote {
    fn fetch_default(&self) -> Result<()>;
    fn remote_branch_exists(&self, name: &str) -> Result<bool>;
    fn delete_local_branch(&self, name: &str) -> Result<()>;
    fn create_local_from_default(&self, name: &str) -> Result<()>;
    fn push_branch(&self, name: &str) -> Result<()>;
}

/// [`BranchRemote`] over a local clone.
#[derive(Debug, Clone)]
pub struct GitBranchRemote {
    git: Git,
    remote: String,
    default_branch: String,
}

impl GitBranchRemote {
    pub fn new(git: Git, remote: impl Into<String>, default_branch: impl Into<String>) -> Self {
        Self {
            git,
            remote: remote.into(),
            default_branch: default_branch.into(),
        }
    }
}

impl BranchRemote for GitBranchRemote {
    fn fetch_default(&self) -> Result<()> {
        self.git.fetch(&self.remote, &self.default_branch)
    }

    fn remote_branch_exists(&self, name: &str) -> Result<bool> {
        self.git.remote_branch_exists(&self.remote, name)
    }

    fn delete_local_branch(&self, name: &str) -> Result<()> {
        self.git.delete_local_branch(name)
    }

    fn create_local_from_default(&self, name: &str) -> Result<()> {
        let start = format!("{}/{}", self.remote, self.default_branch);
        self.git.create_branch_at(name, &start)
    }

    fn push_branch(&self, name: &str) -> Result<()> {
        self.git.push_upstream(&self.remote, name)
    }
}

/// Make sure `name` exists on the remote.
///
/// A failed existence check counts as "missing"; the following non-forced
/// push then fails instead of overwriting if the branch did exist.
#[instrument(skip_all, fields(branch = name))]
pub fn ensure_branch<R: BranchRemote + ?Sized>(remote: &R, name: &str) -> Result<BranchStatus> {
    remote.fetch_default().context("fetch default branch")?;

    let exists = remote.remote_branch_exists(name).unwrap_or_else(|err| {
        warn!(err = format!("{err:#}"), "branch existence check failed, treating as missing");
        false
    });
    if exists {
        info!("integration branch present");
        return Ok(BranchStatus::Existing);
    }

    if let Err(err) = remote.delete_local_branch(name) {
        // Usually just "branch not found".
        debug!(err = format!("{err:#}"), "no stale local branch removed");
    }
    remote
        .create_local_from_default(name)
        .with_context(|| format!("create local branch {name}"))?;
    remote
        .push_branch(name)
        .with_context(|| format!("push branch {name}"))?;
    info!("integration branch created");
    Ok(BranchStatus::Created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BranchCall, RecordingBranchRemote};

    #[test]
    fn existing_branch_is_left_alone() {
        let remote = RecordingBranchRemote::with_remote_branches(&["jules"]);
        let status = ensure_branch(&remote, "jules").expect("ensure");
        assert_eq!(status, BranchStatus::Existing);
        assert_eq!(
            remote.calls(),
            vec![BranchCall::Fetch, BranchCall::Exists("jules".to_string())]
        );
    }

    #[test]
    fn missing_branch_follows_creation_sequence() {
        let remote = RecordingBranchRemote::with_remote_branches(&[]);
        let status = ensure_branch(&remote, "jules").expect("ensure");
        assert_eq!(status, BranchStatus::Created);
        assert_eq!(
            remote.calls(),
            vec![
                BranchCall::Fetch,
                BranchCall::Exists("jules".to_string()),
                BranchCall::DeleteLocal("jules".to_string()),
                BranchCall::CreateLocal("jules".to_string()),
                BranchCall::Push("jules".to_string()),
            ]
        );
    }

    #[test]
    fn failed_existence_check_is_treated_as_missing() {
        let mut remote = RecordingBranchRemote::with_remote_branches(&["jules"]);
        remote.fail_exists = true;
        let status = ensure_branch(&remote, "jules").expect("ensure");
        assert_eq!(status, BranchStatus::Created);
        assert!(remote.calls().contains(&BranchCall::Push("jules".to_string())));
    }

    #[test]
    fn push_failure_is_fatal() {
        let mut remote = RecordingBranchRemote::with_remote_branches(&[]);
        remote.fail_push = true;
        let err = ensure_branch(&remote, "jules").expect_err("push fails");
        assert!(format!("{err:#}").contains("push branch jules"));
    }

    #[test]
    fn fetch_failure_stops_before_any_change() {
        let mut remote = RecordingBranchRemote::with_remote_branches(&[]);
        remote.fail_fetch = true;
        assert!(ensure_branch(&remote, "jules").is_err());
        assert_eq!(remote.calls(), vec![BranchCall::Fetch]);
    }
}
