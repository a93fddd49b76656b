//! Recover agent session ids from pull request metadata.
//!
//! Agents name their branches `<slug>-<session>` and link the session in the PR
//! body. Comments posted by this tool also carry the id of the session that
//! last received feedback, which supersedes the one the branch was opened by
//! once a replacement session has taken over.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Comment;

static UUID_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})$").unwrap()
});
static NUMERIC_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-(\d{15,})$").unwrap());
static TASK_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"jules\.google\.com/task/(\d+)").unwrap());
static TASK_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/task/([a-zA-Z0-9-]+)").unwrap());
static SESSION_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/sessions?/([a-zA-Z0-9-]+)").unwrap());
static COMMENT_SESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Session ID\*\*:\s*`([a-zA-Z0-9-]+)`").unwrap());

/// Strip a `sessions/` resource prefix, returning the bare id.
pub fn normalize(id: &str) -> &str {
    let id = id.trim();
    id.rsplit_once('/').map_or(id, |(_, bare)| bare)
}

/// Session id encoded as a UUID or long numeric suffix of the head branch.
pub fn from_branch(branch: &str) -> Option<String> {
    if let Some(caps) = UUID_SUFFIX.captures(branch) {
        return Some(caps[1].to_string());
    }
    NUMERIC_SUFFIX
        .captures(branch)
        .map(|caps| caps[1].to_string())
}

/// Session id linked from the PR description.
pub fn from_body(body: &str) -> Option<String> {
    [&*TASK_URL, &*TASK_PATH, &*SESSION_PATH]
        .into_iter()
        .find_map(|re| re.captures(body).map(|caps| caps[1].to_string()))
}

/// Session id from the newest comment that records one.
pub fn from_comments(comments: &[Comment]) -> Option<String> {
    comments.iter().rev().find_map(|comment| {
        COMMENT_SESSION
            .captures(&comment.body)
            .map(|caps| caps[1].to_string())
    })
}

/// Newest recorded comment first, then branch, then body.
pub fn recover(branch: &str, body: &str, comments: &[Comment]) -> Option<String> {
    from_comments(comments)
        .or_else(|| from_branch(branch))
        .or_else(|| from_body(body))
}
