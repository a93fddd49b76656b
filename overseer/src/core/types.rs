//! Shared deterministic types for pull-request evaluation.
//!
//! Everything here is a validated, tagged view of facts observed on the hosting
//! platform. Raw `gh` payloads are converted into these types once at the I/O
//! boundary (`io::github`) so decision logic never touches untyped JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `owner/name` identity of the hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    /// Parse `owner/name`. Exactly two non-empty segments are required.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('/');
        let owner = parts.next()?.trim();
        let name = parts.next()?.trim();
        if parts.next().is_some() || owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Identity from a git remote URL: `https://host/owner/name(.git)`,
    /// `ssh://git@host/owner/name(.git)`, or scp-like `git@host:owner/name(.git)`.
    /// The last two path segments are used, so proxied paths such as
    /// `http://proxy/git/owner/name` also resolve.
    pub fn from_remote_url(url: &str) -> Option<Self> {
        let url = url.trim();
        let path = match url.split_once("://") {
            Some((_, rest)) => rest.split_once('/')?.1,
            None => url.split_once(':')?.1,
        };
        let path = path.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let mut segments = path.rsplit('/').filter(|segment| !segment.is_empty());
        let name = segments.next()?;
        let owner = segments.next()?;
        Self::parse(&format!("{owner}/{name}"))
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Normalized status of a single CI check.
///
/// Check runs report `conclusion`/`status`, commit statuses report `state`;
/// both collapse into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Success,
    Failure,
    Error,
    TimedOut,
    Cancelled,
    StartupFailure,
    ActionRequired,
    Neutral,
    Skipped,
    Pending,
    Unknown,
}

impl CheckStatus {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            "ERROR" => Self::Error,
            "TIMED_OUT" => Self::TimedOut,
            "CANCELLED" => Self::Cancelled,
            "STARTUP_FAILURE" => Self::StartupFailure,
            "ACTION_REQUIRED" => Self::ActionRequired,
            "NEUTRAL" => Self::Neutral,
            "SKIPPED" | "STALE" => Self::Skipped,
            "PENDING" | "EXPECTED" | "QUEUED" | "IN_PROGRESS" | "WAITING" | "REQUESTED" => {
                Self::Pending
            }
            _ => Self::Unknown,
        }
    }

    /// Terminal statuses that mean the change is broken.
    pub fn is_failing(self) -> bool {
        matches!(
            self,
            Self::Failure | Self::Error | Self::TimedOut | Self::Cancelled | Self::StartupFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::StartupFailure => "startup_failure",
            Self::ActionRequired => "action_required",
            Self::Neutral => "neutral",
            Self::Skipped => "skipped",
            Self::Pending => "pending",
            Self::Unknown => "unknown",
        }
    }
}

/// One entry of the CI rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
    Other(String),
}

impl ReviewState {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => Self::Approved,
            "CHANGES_REQUESTED" => Self::ChangesRequested,
            "COMMENTED" => Self::Commented,
            "DISMISSED" => Self::Dismissed,
            "PENDING" => Self::Pending,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Approved => "APPROVED",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Commented => "COMMENTED",
            Self::Dismissed => "DISMISSED",
            Self::Pending => "PENDING",
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub author: String,
    pub state: ReviewState,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    pub committed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mergeable {
    Mergeable,
    Conflicting,
    Unknown,
}

impl Mergeable {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MERGEABLE" => Self::Mergeable,
            "CONFLICTING" => Self::Conflicting,
            _ => Self::Unknown,
        }
    }
}

/// Row of the open pull request listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrSummary {
    pub number: u64,
    pub title: String,
    pub head_branch: String,
    pub url: String,
    pub author: String,
    pub is_draft: bool,
}

/// Transient view of one pull request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrSnapshot {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub url: String,
    pub head_branch: String,
    pub base_branch: String,
    pub is_draft: bool,
    pub mergeable: Mergeable,
    pub checks: Vec<CheckResult>,
    /// Latest review per reviewer, oldest first.
    pub reviews: Vec<Review>,
    /// General comments, oldest first.
    pub comments: Vec<Comment>,
    /// Commits, oldest first.
    pub commits: Vec<Commit>,
    pub changed_files: Vec<String>,
    /// Agent session recovered from earlier comments, the head branch, or the body.
    pub session_id: Option<String>,
}

impl PrSnapshot {
    pub fn failing_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|check| check.status.is_failing())
    }

    pub fn has_conflicts(&self) -> bool {
        self.mergeable == Mergeable::Conflicting
    }

    pub fn changes_requested(&self) -> bool {
        self.reviews
            .iter()
            .any(|review| review.state == ReviewState::ChangesRequested)
    }

    /// Timestamp of the newest commit, if any commit carries one.
    pub fn latest_commit_at(&self) -> Option<DateTime<Utc>> {
        self.commits
            .iter()
            .filter_map(|commit| commit.committed_at)
            .max()
    }
}

/// Why a PR that needs feedback is left alone this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A feedback comment exists and the PR has no commits to compare against.
    NoCommits,
    /// The latest feedback comment is not older than the latest commit.
    AlreadyReacted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCommits => f.write_str("feedback already posted and no commits to compare"),
            Self::AlreadyReacted => f.write_str("feedback already posted for the latest commit"),
        }
    }
}

/// Output of the decision engine for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackDecision {
    pub needs_feedback: bool,
    pub skip_reason: Option<SkipReason>,
    /// Assembled feedback text; empty when no feedback is needed.
    pub feedback: String,
}

impl FeedbackDecision {
    /// True when the orchestrator should act on this PR now.
    pub fn actionable(&self) -> bool {
        self.needs_feedback && self.skip_reason.is_none()
    }
}
