//! Pure feedback decisions: does a PR need attention, and have we already
//! reacted to its current state.
//!
//! Loop prevention hinges on one comparison. Every automated comment carries
//! [`FEEDBACK_MARKER`]; a PR is skipped while its newest marker comment is at
//! least as new as its newest commit. Only a strictly newer commit re-arms
//! feedback, so re-running a cycle never posts twice for the same state.

use anyhow::Result;

use crate::core::prompt::{FeedbackInputs, render_feedback};
use crate::core::types::{Comment, FeedbackDecision, PrSnapshot, ReviewState, SkipReason};

/// Substring present in every comment this tool posts.
pub const FEEDBACK_MARKER: &str = "# Task: Fix Pull Request";

/// How many of the latest reviews are quoted back to the agent.
pub const REVIEW_WINDOW: usize = 3;
/// How many recent general comments are quoted back to the agent.
pub const COMMENT_WINDOW: usize = 5;
/// Per-comment character budget in assembled feedback.
pub const COMMENT_MAX_CHARS: usize = 500;

/// True if any check failed terminally or any reviewer requested changes.
pub fn needs_feedback(snapshot: &PrSnapshot) -> bool {
    snapshot.failing_checks().next().is_some() || snapshot.changes_requested()
}

pub fn is_feedback_comment(comment: &Comment) -> bool {
    comment.body.contains(FEEDBACK_MARKER)
}

/// Loop prevention. `comments` is oldest first; the newest marker comment is
/// compared against the newest commit.
pub fn should_skip(snapshot: &PrSnapshot, comments: &[Comment]) -> Option<SkipReason> {
    let marker = comments.iter().rev().find(|c| is_feedback_comment(c))?;
    if snapshot.commits.is_empty() {
        return Some(SkipReason::NoCommits);
    }
    let commented_at = marker.created_at?;
    let committed_at = snapshot.latest_commit_at()?;
    (commented_at >= committed_at).then_some(SkipReason::AlreadyReacted)
}

/// Assemble the feedback message from observed facts.
pub fn construct_feedback(snapshot: &PrSnapshot) -> Result<String> {
    let reviews = recent(&snapshot.reviews, REVIEW_WINDOW)
        .iter()
        .filter(|review| {
            matches!(
                review.state,
                ReviewState::ChangesRequested | ReviewState::Commented
            )
        })
        .map(|review| {
            (
                review.author.as_str(),
                review.state.as_str(),
                review.body.as_str(),
            )
        })
        .collect();

    let human_comments: Vec<&Comment> = snapshot
        .comments
        .iter()
        .filter(|comment| !is_feedback_comment(comment))
        .collect();
    let comments = recent(&human_comments, COMMENT_WINDOW)
        .iter()
        .map(|comment| {
            (
                comment.author.as_str(),
                truncate_chars(&comment.body, COMMENT_MAX_CHARS),
            )
        })
        .collect();

    render_feedback(&FeedbackInputs {
        snapshot,
        reviews,
        comments,
    })
}

/// Run the whole engine over one snapshot.
pub fn decide(snapshot: &PrSnapshot) -> Result<FeedbackDecision> {
    if !needs_feedback(snapshot) {
        return Ok(FeedbackDecision {
            needs_feedback: false,
            skip_reason: None,
            feedback: String::new(),
        });
    }
    let skip_reason = should_skip(snapshot, &snapshot.comments);
    let feedback = match skip_reason {
        Some(_) => String::new(),
        None => construct_feedback(snapshot)?,
    };
    Ok(FeedbackDecision {
        needs_feedback: true,
        skip_reason,
        feedback,
    })
}

/// Human-readable reasons a snapshot needs attention, used in PR comments.
pub fn attention_reasons(snapshot: &PrSnapshot) -> Vec<String> {
    let mut reasons: Vec<String> = snapshot
        .failing_checks()
        .map(|check| format!("check `{}` is {}", check.name, check.status.as_str()))
        .collect();
    reasons.extend(
        snapshot
            .reviews
            .iter()
            .filter(|review| review.state == ReviewState::ChangesRequested)
            .map(|review| format!("{} requested changes", review.author)),
    );
    if snapshot.has_conflicts() {
        reasons.push(format!("branch conflicts with `{}`", snapshot.base_branch));
    }
    reasons
}

fn recent<T>(items: &[T], window: usize) -> &[T] {
    &items[items.len().saturating_sub(window)..]
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CheckResult, CheckStatus, Mergeable, Review};
    use crate::test_support::{comment_at, commit_at, failing_check, snapshot, ts};

    fn review(author: &str, state: ReviewState, body: &str) -> Review {
        Review {
            author: author.to_string(),
            state,
            body: body.to_string(),
        }
    }

    #[test]
    fn healthy_snapshot_needs_nothing() {
        let mut snap = snapshot(1);
        snap.checks.push(CheckResult {
            name: "build".to_string(),
            status: CheckStatus::Success,
            link: None,
        });
        snap.checks.push(CheckResult {
            name: "deploy".to_string(),
            status: CheckStatus::Pending,
            link: None,
        });
        assert!(!needs_feedback(&snap));
        let decision = decide(&snap).expect("decide");
        assert!(!decision.needs_feedback);
        assert!(!decision.actionable());
    }

    #[test]
    fn each_terminal_failure_triggers_feedback() {
        for status in [
            CheckStatus::Failure,
            CheckStatus::Error,
            CheckStatus::TimedOut,
            CheckStatus::Cancelled,
        ] {
            let mut snap = snapshot(1);
            snap.checks.push(CheckResult {
                name: "ci".to_string(),
                status,
                link: None,
            });
            assert!(needs_feedback(&snap), "{status:?} should trigger feedback");
        }
    }

    #[test]
    fn changes_requested_triggers_feedback() {
        let mut snap = snapshot(1);
        snap.reviews.push(review("alice", ReviewState::Approved, "lgtm"));
        assert!(!needs_feedback(&snap));
        snap.reviews.push(review("bob", ReviewState::ChangesRequested, "rename this"));
        assert!(needs_feedback(&snap));
    }

    #[test]
    fn no_marker_never_skips() {
        let mut snap = snapshot(1);
        snap.commits.push(commit_at("a1", "2024-05-01T10:00:00Z"));
        let comments = vec![comment_at("human", "please fix", "2024-05-02T10:00:00Z")];
        assert_eq!(should_skip(&snap, &comments), None);
    }

    #[test]
    fn marker_without_commits_skips() {
        let snap = snapshot(1);
        let comments = vec![comment_at(
            "bot",
            "<!-- # Task: Fix Pull Request -->",
            "2024-05-02T10:00:00Z",
        )];
        assert_eq!(should_skip(&snap, &comments), Some(SkipReason::NoCommits));
    }

    #[test]
    fn marker_newer_than_commit_skips() {
        let mut snap = snapshot(1);
        snap.commits.push(commit_at("a1", "2024-05-01T10:00:00Z"));
        let comments = vec![comment_at(
            "bot",
            "sent <!-- # Task: Fix Pull Request -->",
            "2024-05-01T11:00:00Z",
        )];
        assert_eq!(
            should_skip(&snap, &comments),
            Some(SkipReason::AlreadyReacted)
        );
    }

    #[test]
    fn marker_equal_to_commit_skips() {
        let mut snap = snapshot(1);
        snap.commits.push(commit_at("a1", "2024-05-01T10:00:00Z"));
        let comments = vec![comment_at(
            "bot",
            "<!-- # Task: Fix Pull Request -->",
            "2024-05-01T10:00:00Z",
        )];
        assert_eq!(
            should_skip(&snap, &comments),
            Some(SkipReason::AlreadyReacted)
        );
    }

    #[test]
    fn strictly_newer_commit_rearms_feedback() {
        let mut snap = snapshot(1);
        snap.commits.push(commit_at("a1", "2024-05-01T10:00:00Z"));
        snap.commits.push(commit_at("a2", "2024-05-01T12:00:00Z"));
        let comments = vec![comment_at(
            "bot",
            "<!-- # Task: Fix Pull Request -->",
            "2024-05-01T11:00:00Z",
        )];
        assert_eq!(should_skip(&snap, &comments), None);
    }

    #[test]
    fn only_newest_marker_counts() {
        let mut snap = snapshot(1);
        snap.commits.push(commit_at("a1", "2024-05-01T10:00:00Z"));
        let comments = vec![
            comment_at("bot", "<!-- # Task: Fix Pull Request -->", "2024-05-01T09:00:00Z"),
            comment_at("bot", "<!-- # Task: Fix Pull Request -->", "2024-05-01T10:30:00Z"),
            comment_at("human", "thanks", "2024-05-01T11:00:00Z"),
        ];
        assert_eq!(
            should_skip(&snap, &comments),
            Some(SkipReason::AlreadyReacted)
        );
    }

    #[test]
    fn missing_timestamps_do_not_skip() {
        let mut snap = snapshot(1);
        snap.commits.push(commit_at("a1", "2024-05-01T10:00:00Z"));
        let mut marker = comment_at(
            "bot",
            "<!-- # Task: Fix Pull Request -->",
            "2024-05-01T11:00:00Z",
        );
        marker.created_at = None;
        assert_eq!(should_skip(&snap, &[marker]), None);
    }

    #[test]
    fn feedback_lists_failures_reviews_and_truncated_comments() {
        let mut snap = snapshot(42);
        snap.title = "Refactor parser".to_string();
        snap.checks.push(CheckResult {
            name: "unit-tests".to_string(),
            status: CheckStatus::Failure,
            link: Some("https://ci.test/run/1".to_string()),
        });
        snap.checks.push(failing_check("lint"));
        snap.reviews.push(review("alice", ReviewState::ChangesRequested, "Split this function."));
        snap.reviews.push(review("carol", ReviewState::Approved, "approved body"));
        snap.comments.push(comment_at("dave", &"x".repeat(600), "2024-05-01T10:00:00Z"));
        snap.comments.push(comment_at(
            "bot",
            "<!-- # Task: Fix Pull Request -->",
            "2024-05-01T11:00:00Z",
        ));

        let text = construct_feedback(&snap).expect("feedback");
        assert!(text.starts_with("# Task: Fix Pull Request #42"));
        assert!(text.contains("- **unit-tests** (failure): https://ci.test/run/1"));
        assert!(text.contains("- **lint** (failure): No URL"));
        assert!(text.contains("### Review by alice (CHANGES_REQUESTED)\nSplit this function."));
        assert!(!text.contains("approved body"));
        assert!(text.contains(&format!("**dave**: {}...", "x".repeat(500))));
        assert!(!text.contains(&"x".repeat(501)));
        assert!(!text.contains("**bot**"));
        assert!(text.contains("Full autonomy required"));
    }

    #[test]
    fn feedback_windows_reviews_and_comments() {
        let mut snap = snapshot(7);
        snap.checks.push(failing_check("ci"));
        for i in 0..5 {
            snap.reviews.push(review(
                &format!("r{i}"),
                ReviewState::Commented,
                &format!("review {i}"),
            ));
        }
        for i in 0..8 {
            snap.comments.push(comment_at(
                &format!("c{i}"),
                &format!("comment {i}"),
                "2024-05-01T10:00:00Z",
            ));
        }
        let text = construct_feedback(&snap).expect("feedback");
        assert!(!text.contains("review 1"));
        assert!(text.contains("review 2"));
        assert!(text.contains("review 4"));
        assert!(!text.contains("comment 2"));
        assert!(text.contains("comment 3"));
        assert!(text.contains("comment 7"));
    }

    #[test]
    fn feedback_mentions_conflicts() {
        let mut snap = snapshot(3);
        snap.mergeable = Mergeable::Conflicting;
        let text = construct_feedback(&snap).expect("feedback");
        assert!(text.contains("## Merge Conflicts"));
        assert!(text.contains("CI checks passed"));
    }

    #[test]
    fn decide_skips_without_rendering() {
        let mut snap = snapshot(5);
        snap.checks.push(failing_check("ci"));
        snap.commits.push(commit_at("a1", "2024-05-01T10:00:00Z"));
        snap.comments.push(comment_at(
            "bot",
            "<!-- # Task: Fix Pull Request -->",
            "2024-05-01T10:05:00Z",
        ));
        let decision = decide(&snap).expect("decide");
        assert!(decision.needs_feedback);
        assert_eq!(decision.skip_reason, Some(SkipReason::AlreadyReacted));
        assert!(decision.feedback.is_empty());
        assert!(!decision.actionable());
    }

    #[test]
    fn attention_reasons_describe_each_problem() {
        let mut snap = snapshot(5);
        snap.base_branch = "main".to_string();
        snap.checks.push(failing_check("lint"));
        snap.reviews.push(review("bob", ReviewState::ChangesRequested, "no"));
        snap.mergeable = Mergeable::Conflicting;
        assert_eq!(
            attention_reasons(&snap),
            vec![
                "check `lint` is failure".to_string(),
                "bob requested changes".to_string(),
                "branch conflicts with `main`".to_string(),
            ]
        );
        assert!(ts("2024-05-01T10:00:00Z") < ts("2024-05-01T10:00:01Z"));
    }
}
