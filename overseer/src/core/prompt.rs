//! Deterministic text rendering for agent messages and PR comments.
//!
//! Templates only format facts already present in a [`PrSnapshot`]; nothing is
//! inferred here.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::PrSnapshot;

const FEEDBACK_TEMPLATE: &str = include_str!("prompts/feedback.md");
const FIX_REQUEST_TEMPLATE: &str = include_str!("prompts/fix_request.md");
const COMMENT_TEMPLATE: &str = include_str!("prompts/comment.md");

/// Fixed instruction block appended to every feedback message.
pub const AUTONOMY_INSTRUCTIONS: &str = "\
**Full autonomy required:**
- Never ask humans for help, approval, or implementation decisions.
- Make your own technical decisions and keep going until the checks pass.
- If tests fail, debug them, fix the cause, and adjust your approach.";

/// Message sent to sessions that stopped to wait for user input.
pub const NUDGE_MESSAGE: &str =
    "Please make the best decision possible and proceed autonomously to complete the task.";

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("feedback", FEEDBACK_TEMPLATE)
        .expect("feedback template should be valid");
    env.add_template("fix_request", FIX_REQUEST_TEMPLATE)
        .expect("fix request template should be valid");
    env.add_template("comment", COMMENT_TEMPLATE)
        .expect("comment template should be valid");
    env
});

#[derive(Debug, Serialize)]
struct CheckContext {
    name: String,
    status: &'static str,
    link: String,
}

#[derive(Debug, Serialize)]
struct ReviewContext {
    author: String,
    state: String,
    body: String,
}

#[derive(Debug, Serialize)]
struct CommentContext {
    author: String,
    body: String,
}

/// Inputs for the feedback message, already windowed and truncated.
#[derive(Debug)]
pub struct FeedbackInputs<'a> {
    pub snapshot: &'a PrSnapshot,
    pub reviews: Vec<(&'a str, &'a str, &'a str)>,
    pub comments: Vec<(&'a str, String)>,
}

pub fn render_feedback(input: &FeedbackInputs<'_>) -> Result<String> {
    let snapshot = input.snapshot;
    let failing_checks: Vec<CheckContext> = snapshot
        .failing_checks()
        .map(|check| CheckContext {
            name: check.name.clone(),
            status: check.status.as_str(),
            link: check.link.clone().unwrap_or_else(|| "No URL".to_string()),
        })
        .collect();
    let reviews: Vec<ReviewContext> = input
        .reviews
        .iter()
        .map(|(author, state, body)| ReviewContext {
            author: author.to_string(),
            state: state.to_string(),
            body: body.trim().to_string(),
        })
        .collect();
    let comments: Vec<CommentContext> = input
        .comments
        .iter()
        .map(|(author, body)| CommentContext {
            author: author.to_string(),
            body: body.trim().to_string(),
        })
        .collect();

    let template = ENGINE.get_template("feedback")?;
    let rendered = template.render(context! {
        number => snapshot.number,
        title => snapshot.title.as_str(),
        branch => snapshot.head_branch.as_str(),
        base => snapshot.base_branch.as_str(),
        failing_checks => failing_checks,
        conflicting => snapshot.has_conflicts(),
        reviews => reviews,
        comments => comments,
        autonomy => AUTONOMY_INSTRUCTIONS,
    })?;
    Ok(rendered)
}

/// Prompt for a replacement session that continues work on the PR's branch.
pub fn render_fix_request(snapshot: &PrSnapshot, base_sha: &str, feedback: &str) -> Result<String> {
    let description = match snapshot.body.trim() {
        "" => "(no description)",
        body => body,
    };
    let template = ENGINE.get_template("fix_request")?;
    let rendered = template.render(context! {
        number => snapshot.number,
        title => snapshot.title.as_str(),
        branch => snapshot.head_branch.as_str(),
        base => snapshot.base_branch.as_str(),
        base_sha => base_sha,
        changed_files => &snapshot.changed_files,
        description => description,
        feedback => feedback.trim(),
    })?;
    Ok(rendered)
}

/// Content of the marker comment posted after every automated action.
#[derive(Debug, Clone, Default)]
pub struct CommentInputs {
    pub headline: String,
    pub details: Vec<String>,
    pub session_id: Option<String>,
    pub reasons: Vec<String>,
}

pub fn render_comment(input: &CommentInputs, marker: &str) -> Result<String> {
    let template = ENGINE.get_template("comment")?;
    let rendered = template.render(context! {
        headline => input.headline.as_str(),
        details => &input.details,
        session_id => input.session_id.as_deref(),
        reasons => &input.reasons,
        marker => marker,
    })?;
    Ok(rendered)
}
