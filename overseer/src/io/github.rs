//! Pull request inspection through the `gh` CLI.
//!
//! `gh` output is parsed once here into [`PrSnapshot`]/[`PrSummary`]; the
//! parsers are pure functions so payload handling is tested without a network.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use tracing::{debug, instrument, warn};

use crate::core::session_id;
use crate::core::types::{
    CheckResult, CheckStatus, Comment, Commit, Mergeable, PrSnapshot, PrSummary, RepoId, Review,
    ReviewState,
};
use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;

const LIST_FIELDS: &str = "number,title,headRefName,url,author,isDraft";
const VIEW_FIELDS: &str = "number,title,body,url,headRefName,baseRefName,isDraft,mergeable,\
statusCheckRollup,files,comments,latestReviews,commits,author";
const GH_OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Read and comment on pull requests of one repository.
pub trait PullRequests {
    /// Open pull requests by `author`.
    fn list_open(&self, author: &str) -> Result<Vec<PrSummary>>;
    fn snapshot(&self, number: u64) -> Result<PrSnapshot>;
    fn post_comment(&self, number: u64, body: &str) -> Result<()>;
    /// Current SHA of the base branch on the remote, if resolvable.
    fn base_sha(&self, base_branch: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct GhCli {
    git: Git,
    repo: RepoId,
    timeout: Duration,
    remote: String,
}

impl GhCli {
    /// `gh` runs in `git`'s working directory, which also answers base SHA
    /// lookups against `remote`.
    pub fn new(git: Git, repo: RepoId, timeout: Duration, remote: impl Into<String>) -> Self {
        Self {
            git,
            repo,
            timeout,
            remote: remote.into(),
        }
    }

    fn gh(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        let repo = self.repo.to_string();
        let mut cmd = Command::new("gh");
        cmd.args(args)
            .args(["--repo", repo.as_str()])
            .current_dir(self.git.workdir());
        let label = format!("gh {}", args.iter().take(2).copied().collect::<Vec<_>>().join(" "));
        run_command_with_timeout(cmd, stdin, self.timeout, GH_OUTPUT_LIMIT_BYTES)
            .with_context(|| label.clone())?
            .into_success(&label)
    }
}

impl PullRequests for GhCli {
    #[instrument(skip_all, fields(repo = %self.repo, author = %author))]
    fn list_open(&self, author: &str) -> Result<Vec<PrSummary>> {
        let out = self.gh(
            &[
                "pr", "list", "--author", author, "--state", "open", "--limit", "100", "--json",
                LIST_FIELDS,
            ],
            None,
        )?;
        let prs = parse_pr_list(&out)?;
        debug!(count = prs.len(), "open pull requests");
        Ok(prs)
    }

    #[instrument(skip_all, fields(repo = %self.repo, pr = number))]
    fn snapshot(&self, number: u64) -> Result<PrSnapshot> {
        let number = number.to_string();
        let out = self.gh(&["pr", "view", &number, "--json", VIEW_FIELDS], None)?;
        parse_pr_view(&out).with_context(|| format!("parse pull request #{number}"))
    }

    #[instrument(skip_all, fields(repo = %self.repo, pr = number))]
    fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.gh(
            &["pr", "comment", &number, "--body-file", "-"],
            Some(body.as_bytes()),
        )?;
        debug!("comment posted");
        Ok(())
    }

    /// Asks the remote directly, so a stale local fetch never leaks into the
    /// fix-request prompt.
    fn base_sha(&self, base_branch: &str) -> Option<String> {
        match self.git.remote_branch_sha(&self.remote, base_branch) {
            Ok(Some(sha)) => Some(sha),
            Ok(None) => {
                warn!(remote = %self.remote, branch = base_branch, "base branch missing on remote");
                None
            }
            Err(err) => {
                warn!(branch = base_branch, err = format!("{err:#}"), "base sha unavailable");
                None
            }
        }
    }
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GhAuthor {
    #[serde(deserialize_with = "nullable")]
    login: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GhListItem {
    number: u64,
    #[serde(deserialize_with = "nullable")]
    title: String,
    #[serde(deserialize_with = "nullable")]
    head_ref_name: String,
    #[serde(deserialize_with = "nullable")]
    url: String,
    #[serde(deserialize_with = "nullable")]
    author: GhAuthor,
    is_draft: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GhCheck {
    name: Option<String>,
    context: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    state: Option<String>,
    details_url: Option<String>,
    target_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GhFile {
    #[serde(deserialize_with = "nullable")]
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GhComment {
    #[serde(deserialize_with = "nullable")]
    author: GhAuthor,
    #[serde(deserialize_with = "nullable")]
    body: String,
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GhReview {
    #[serde(deserialize_with = "nullable")]
    author: GhAuthor,
    #[serde(deserialize_with = "nullable")]
    state: String,
    #[serde(deserialize_with = "nullable")]
    body: String,
    submitted_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GhCommit {
    #[serde(deserialize_with = "nullable")]
    oid: String,
    committed_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GhPrView {
    number: u64,
    #[serde(deserialize_with = "nullable")]
    title: String,
    #[serde(deserialize_with = "nullable")]
    body: String,
    #[serde(deserialize_with = "nullable")]
    url: String,
    #[serde(deserialize_with = "nullable")]
    head_ref_name: String,
    #[serde(deserialize_with = "nullable")]
    base_ref_name: String,
    is_draft: bool,
    #[serde(deserialize_with = "nullable")]
    mergeable: String,
    #[serde(deserialize_with = "nullable")]
    status_check_rollup: Vec<GhCheck>,
    #[serde(deserialize_with = "nullable")]
    files: Vec<GhFile>,
    #[serde(deserialize_with = "nullable")]
    comments: Vec<GhComment>,
    #[serde(deserialize_with = "nullable")]
    latest_reviews: Vec<GhReview>,
    #[serde(deserialize_with = "nullable")]
    commits: Vec<GhCommit>,
}

pub fn parse_pr_list(raw: &str) -> Result<Vec<PrSummary>> {
    let items: Vec<GhListItem> = serde_json::from_str(raw).context("decode gh pr list")?;
    Ok(items
        .into_iter()
        .map(|item| PrSummary {
            number: item.number,
            title: item.title,
            head_branch: item.head_ref_name,
            url: item.url,
            author: item.author.login,
            is_draft: item.is_draft,
        })
        .collect())
}

pub fn parse_pr_view(raw: &str) -> Result<PrSnapshot> {
    let view: GhPrView = serde_json::from_str(raw).context("decode gh pr view")?;

    let checks = view.status_check_rollup.into_iter().map(check_result).collect();

    let mut reviews: Vec<(Option<DateTime<Utc>>, Review)> = view
        .latest_reviews
        .into_iter()
        .map(|review| {
            (
                parse_time(review.submitted_at.as_deref()),
                Review {
                    author: review.author.login,
                    state: ReviewState::from_raw(&review.state),
                    body: review.body,
                },
            )
        })
        .collect();
    reviews.sort_by_key(|(at, _)| *at);

    let comments: Vec<Comment> = view
        .comments
        .into_iter()
        .map(|comment| Comment {
            author: comment.author.login,
            body: comment.body,
            created_at: parse_time(comment.created_at.as_deref()),
        })
        .collect();

    let commits = view
        .commits
        .into_iter()
        .map(|commit| Commit {
            sha: commit.oid,
            committed_at: parse_time(commit.committed_date.as_deref()),
        })
        .collect();

    let session_id = session_id::recover(&view.head_ref_name, &view.body, &comments);

    Ok(PrSnapshot {
        number: view.number,
        title: view.title,
        body: view.body,
        url: view.url,
        head_branch: view.head_ref_name,
        base_branch: view.base_ref_name,
        is_draft: view.is_draft,
        mergeable: Mergeable::from_raw(&view.mergeable),
        checks,
        reviews: reviews.into_iter().map(|(_, review)| review).collect(),
        comments,
        commits,
        changed_files: view
            .files
            .into_iter()
            .map(|file| file.path)
            .filter(|path| !path.is_empty())
            .collect(),
        session_id,
    })
}

/// Check runs report `conclusion` once finished and `status` before; commit
/// statuses report `state`.
fn check_result(check: GhCheck) -> CheckResult {
    let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
    let raw_status = non_empty(&check.conclusion)
        .or_else(|| non_empty(&check.state))
        .or_else(|| non_empty(&check.status))
        .unwrap_or_default();
    CheckResult {
        name: non_empty(&check.name)
            .or_else(|| non_empty(&check.context))
            .unwrap_or_else(|| "unnamed check".to_string()),
        status: CheckStatus::from_raw(&raw_status),
        link: non_empty(&check.details_url).or_else(|| non_empty(&check.target_url)),
    }
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw?)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIEW: &str = r#"{
        "number": 42,
        "title": "Refactor parser",
        "body": "Started from https://jules.google.com/task/555",
        "url": "https://github.com/octo/widgets/pull/42",
        "headRefName": "parser-refactor-123456789012345678",
        "baseRefName": "jules",
        "isDraft": false,
        "mergeable": "CONFLICTING",
        "statusCheckRollup": [
            {"__typename": "CheckRun", "name": "build", "status": "COMPLETED", "conclusion": "FAILURE", "detailsUrl": "https://ci.test/1"},
            {"__typename": "CheckRun", "name": "lint", "status": "IN_PROGRESS", "conclusion": ""},
            {"__typename": "StatusContext", "context": "deploy/preview", "state": "SUCCESS", "targetUrl": "https://deploy.test"}
        ],
        "files": [{"path": "src/parser.rs", "additions": 3, "deletions": 1}],
        "comments": [
            {"author": {"login": "alice"}, "body": "please split", "createdAt": "2024-05-01T10:00:00Z"}
        ],
        "latestReviews": [
            {"author": {"login": "bob"}, "state": "APPROVED", "body": "", "submittedAt": "2024-05-01T12:00:00Z"},
            {"author": {"login": "carol"}, "state": "CHANGES_REQUESTED", "body": "rename", "submittedAt": "2024-05-01T09:00:00Z"}
        ],
        "commits": [
            {"oid": "abc", "committedDate": "2024-05-01T08:00:00Z"},
            {"oid": "def", "committedDate": "2024-05-01T11:00:00+02:00"}
        ],
        "author": {"login": "app/google-labs-jules"}
    }"#;

    #[test]
    fn view_is_normalized() {
        let snap = parse_pr_view(VIEW).expect("parse");
        assert_eq!(snap.number, 42);
        assert_eq!(snap.base_branch, "jules");
        assert!(snap.has_conflicts());
        assert_eq!(snap.changed_files, vec!["src/parser.rs".to_string()]);
        assert_eq!(snap.session_id.as_deref(), Some("123456789012345678"));

        let statuses: Vec<_> = snap.checks.iter().map(|c| (c.name.as_str(), c.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("build", CheckStatus::Failure),
                ("lint", CheckStatus::Pending),
                ("deploy/preview", CheckStatus::Success),
            ]
        );
        assert_eq!(snap.checks[2].link.as_deref(), Some("https://deploy.test"));

        assert_eq!(snap.reviews[0].author, "carol");
        assert!(snap.changes_requested());
        assert_eq!(
            snap.latest_commit_at(),
            parse_time(Some("2024-05-01T09:00:00Z"))
        );
    }

    #[test]
    fn nulls_and_missing_fields_default() {
        let snap = parse_pr_view(
            r#"{"number": 3, "body": null, "statusCheckRollup": null, "headRefName": "feature"}"#,
        )
        .expect("parse");
        assert!(snap.body.is_empty());
        assert!(snap.checks.is_empty());
        assert_eq!(snap.mergeable, Mergeable::Unknown);
        assert_eq!(snap.session_id, None);
    }

    #[test]
    fn list_is_normalized() {
        let prs = parse_pr_list(
            r#"[{"number": 7, "title": "t", "headRefName": "b", "url": "u", "author": {"login": "bot"}, "isDraft": true}]"#,
        )
        .expect("parse");
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].author, "bot");
        assert!(prs[0].is_draft);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_pr_view("not json").is_err());
        assert!(parse_pr_list("{}").is_err());
    }
}
