//! Feedback cycle orchestration.
//!
//! One invocation inspects every open pull request by the agent author,
//! decides whether it needs feedback, and delivers that feedback by reusing
//! the PR's session or starting a replacement. Every delivery attempt, failed
//! or not, leaves a marker comment on the PR; that comment is what stops the
//! next invocation from repeating itself until a newer commit lands.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::feedback::{self, FEEDBACK_MARKER, attention_reasons};
use crate::core::prompt::{CommentInputs, render_comment, render_fix_request};
use crate::core::types::{PrSnapshot, RepoId, SkipReason};
use crate::io::github::PullRequests;
use crate::io::session_client::{AutomationMode, CreateSessionRequest, SessionApi};

/// Placeholder when the base branch SHA cannot be resolved.
pub const UNKNOWN_SHA: &str = "Unknown";

/// Final state of one pull request within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrOutcome {
    Healthy,
    Skipped {
        reason: SkipReason,
    },
    /// No session id could be recovered; nothing was sent or posted.
    Unmanaged,
    /// PR details could not be fetched.
    Unreadable {
        message: String,
    },
    /// Dry run: feedback would have been delivered.
    Planned {
        session_id: String,
    },
    Messaged {
        session_id: String,
    },
    Recreated {
        session_id: String,
        previous: Option<String>,
        reason: FallbackReason,
    },
    Errored {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrReport {
    pub number: u64,
    pub title: String,
    #[serde(flatten)]
    pub outcome: PrOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub prs: Vec<PrReport>,
    /// Set when the open PR listing itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_error: Option<String>,
}

impl CycleReport {
    pub fn count(&self, matches: impl Fn(&PrOutcome) -> bool) -> usize {
        self.prs.iter().filter(|pr| matches(&pr.outcome)).count()
    }
}

/// Why feedback went to a new session instead of the recovered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NoSession,
    Terminal,
    MessageFailed,
    LookupFailed,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoSession => "no existing session was linked to this PR",
            Self::Terminal => "the previous session had already finished",
            Self::MessageFailed => "the previous session did not accept the message",
            Self::LookupFailed => "the previous session could not be looked up",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Messaged {
        session_id: String,
    },
    Recreated {
        session_id: String,
        previous: Option<String>,
        reason: FallbackReason,
    },
}

/// Both reuse and replacement failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("feedback not delivered: {message}")]
pub struct DeliveryError {
    pub previous: Option<String>,
    pub message: String,
}

/// Reuse the PR's session when it is alive, otherwise start a new one on the
/// PR's head branch.
#[instrument(skip_all, fields(pr = snapshot.number, session_id = ?session_id))]
pub fn resolve_session<S: SessionApi + ?Sized>(
    sessions: &S,
    repo: &RepoId,
    snapshot: &PrSnapshot,
    session_id: Option<&str>,
    feedback: &str,
    base_sha: &str,
) -> Result<Delivery, DeliveryError> {
    let reason = match session_id {
        None => FallbackReason::NoSession,
        Some(id) => match sessions.get_session(id) {
            Ok(session) if session.state.is_terminal() => {
                info!(state = ?session.state, "session finished, starting a replacement");
                FallbackReason::Terminal
            }
            Ok(_) => match sessions.send_message(id, feedback) {
                Ok(()) => {
                    info!("feedback sent to existing session");
                    return Ok(Delivery::Messaged {
                        session_id: id.to_string(),
                    });
                }
                Err(err) => {
                    warn!(err = %err, "message rejected, starting a replacement");
                    FallbackReason::MessageFailed
                }
            },
            Err(err) => {
                warn!(err = %err, "session lookup failed, starting a replacement");
                FallbackReason::LookupFailed
            }
        },
    };
    recreate_session(sessions, repo, snapshot, feedback, base_sha)
        .map(|new_id| Delivery::Recreated {
            session_id: new_id,
            previous: session_id_owned(session_id),
            reason,
        })
        .map_err(|message| DeliveryError {
            previous: session_id_owned(session_id),
            message,
        })
}

fn session_id_owned(session_id: Option<&str>) -> Option<String> {
    session_id.map(str::to_string)
}

fn recreate_session<S: SessionApi + ?Sized>(
    sessions: &S,
    repo: &RepoId,
    snapshot: &PrSnapshot,
    feedback: &str,
    base_sha: &str,
) -> Result<String, String> {
    let prompt = render_fix_request(snapshot, base_sha, feedback)
        .map_err(|err| format!("render fix request: {err:#}"))?;
    let request = CreateSessionRequest {
        prompt,
        repo: repo.clone(),
        starting_branch: snapshot.head_branch.clone(),
        title: Some(format!("Fix #{}: {}", snapshot.number, snapshot.title)),
        require_plan_approval: false,
        automation_mode: AutomationMode::AutoCreatePr,
    };
    let session = sessions
        .create_session(&request)
        .map_err(|err| format!("create session: {err}"))?;
    let id = session.session_id().to_string();
    info!(session_id = %id, "replacement session created");
    Ok(id)
}

/// Outcome of a delivery attempt, posted back to the PR.
fn delivery_outcome(result: &Result<Delivery, DeliveryError>) -> PrOutcome {
    match result {
        Ok(Delivery::Messaged { session_id }) => PrOutcome::Messaged {
            session_id: session_id.clone(),
        },
        Ok(Delivery::Recreated {
            session_id,
            previous,
            reason,
        }) => PrOutcome::Recreated {
            session_id: session_id.clone(),
            previous: previous.clone(),
            reason: *reason,
        },
        Err(err) => PrOutcome::Errored {
            message: err.message.clone(),
        },
    }
}

fn delivery_comment(
    snapshot: &PrSnapshot,
    result: &Result<Delivery, DeliveryError>,
) -> CommentInputs {
    let reasons = attention_reasons(snapshot);
    match result {
        Ok(Delivery::Messaged { session_id }) => CommentInputs {
            headline: "Feedback sent to the agent session working on this PR".to_string(),
            details: vec![
                "Action: sent the current failures and review notes as a message".to_string(),
            ],
            session_id: Some(session_id.clone()),
            reasons,
        },
        Ok(Delivery::Recreated {
            session_id,
            previous,
            reason,
        }) => {
            let mut details = vec![format!("Action: started a new session because {reason}")];
            if let Some(previous) = previous {
                details.push(format!("Previous session: `{previous}`"));
            }
            CommentInputs {
                headline: "Started a new agent session to fix this PR".to_string(),
                details,
                session_id: Some(session_id.clone()),
                reasons,
            }
        }
        Err(err) => CommentInputs {
            headline: "Could not hand this PR's feedback to an agent session".to_string(),
            details: vec![
                format!("Error: {}", err.message),
                "Action: none; a new commit on this PR triggers another attempt".to_string(),
            ],
            session_id: err.previous.clone(),
            reasons,
        },
    }
}

/// Post the marker comment describing a delivery attempt. Failures only
/// warn; the delivery outcome is already decided.
fn post_delivery<P: PullRequests + ?Sized>(
    prs: &P,
    snapshot: &PrSnapshot,
    result: &Result<Delivery, DeliveryError>,
) {
    let body = match render_comment(&delivery_comment(snapshot, result), FEEDBACK_MARKER) {
        Ok(body) => body,
        Err(err) => {
            warn!(pr = snapshot.number, err = format!("{err:#}"), "render outcome comment failed");
            return;
        }
    };
    if let Err(err) = prs.post_comment(snapshot.number, &body) {
        warn!(pr = snapshot.number, err = format!("{err:#}"), "posting outcome comment failed");
    }
}

fn base_sha_or_unknown<P: PullRequests + ?Sized>(prs: &P, snapshot: &PrSnapshot) -> String {
    prs.base_sha(&snapshot.base_branch)
        .unwrap_or_else(|| UNKNOWN_SHA.to_string())
}

/// Evaluate one PR. `sessions` is `None` for a dry run.
pub fn process_pr<S, P>(sessions: Option<&S>, prs: &P, repo: &RepoId, number: u64) -> PrOutcome
where
    S: SessionApi + ?Sized,
    P: PullRequests + ?Sized,
{
    let snapshot = match prs.snapshot(number) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(pr = number, err = format!("{err:#}"), "pull request unreadable");
            return PrOutcome::Unreadable {
                message: format!("{err:#}"),
            };
        }
    };
    let decision = match feedback::decide(&snapshot) {
        Ok(decision) => decision,
        Err(err) => {
            return PrOutcome::Errored {
                message: format!("{err:#}"),
            };
        }
    };
    if !decision.needs_feedback {
        return PrOutcome::Healthy;
    }
    if let Some(reason) = decision.skip_reason {
        info!(pr = number, %reason, "skipping");
        return PrOutcome::Skipped { reason };
    }
    let Some(session_id) = snapshot.session_id.clone() else {
        info!(pr = number, "no session id recoverable, leaving unmanaged");
        return PrOutcome::Unmanaged;
    };
    let Some(sessions) = sessions else {
        return PrOutcome::Planned { session_id };
    };

    let base_sha = base_sha_or_unknown(prs, &snapshot);
    let result = resolve_session(
        sessions,
        repo,
        &snapshot,
        Some(&session_id),
        &decision.feedback,
        &base_sha,
    );
    post_delivery(prs, &snapshot, &result);
    delivery_outcome(&result)
}

/// Inspect every open PR by `author` once.
#[instrument(skip_all, fields(repo = %repo, author = %author, dry_run = sessions.is_none()))]
pub fn run_feedback_cycle<S, P>(
    sessions: Option<&S>,
    prs: &P,
    repo: &RepoId,
    author: &str,
) -> CycleReport
where
    S: SessionApi + ?Sized,
    P: PullRequests + ?Sized,
{
    let open = match prs.list_open(author) {
        Ok(open) => open,
        Err(err) => {
            warn!(err = format!("{err:#}"), "listing open pull requests failed");
            return CycleReport {
                prs: Vec::new(),
                list_error: Some(format!("{err:#}")),
            };
        }
    };
    info!(count = open.len(), "open pull requests");

    let reports = open
        .into_iter()
        .map(|summary| PrReport {
            number: summary.number,
            outcome: process_pr(sessions, prs, repo, summary.number),
            title: summary.title,
        })
        .collect();
    CycleReport {
        prs: reports,
        list_error: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoFixStatus {
    Success,
    Skipped,
    Error,
}

/// Result of the single-PR autofix command, printed as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoFixReport {
    pub status: AutoFixStatus,
    pub pr_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
}

/// Fix one PR on demand. Conflicts count as needing attention, and a PR
/// with no linked session gets a fresh one.
#[instrument(skip_all, fields(repo = %repo, pr = number))]
pub fn auto_fix_pr<S, P>(sessions: &S, prs: &P, repo: &RepoId, number: u64) -> AutoFixReport
where
    S: SessionApi + ?Sized,
    P: PullRequests + ?Sized,
{
    let report = |status, action: Option<&str>, session_id: Option<String>, message: String| {
        AutoFixReport {
            status,
            pr_number: number,
            action: action.map(str::to_string),
            session_id,
            message,
        }
    };

    let snapshot = match prs.snapshot(number) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            return report(AutoFixStatus::Error, None, None, format!("{err:#}"));
        }
    };
    if !feedback::needs_feedback(&snapshot) && !snapshot.has_conflicts() {
        return report(
            AutoFixStatus::Skipped,
            None,
            snapshot.session_id,
            "no failing checks, requested changes, or conflicts".to_string(),
        );
    }
    let text = match feedback::construct_feedback(&snapshot) {
        Ok(text) => text,
        Err(err) => return report(AutoFixStatus::Error, None, None, format!("{err:#}")),
    };

    let base_sha = base_sha_or_unknown(prs, &snapshot);
    let result = resolve_session(
        sessions,
        repo,
        &snapshot,
        snapshot.session_id.as_deref(),
        &text,
        &base_sha,
    );
    post_delivery(prs, &snapshot, &result);
    match result {
        Ok(Delivery::Messaged { session_id }) => report(
            AutoFixStatus::Success,
            Some("messaged"),
            Some(session_id),
            "feedback sent to the existing session".to_string(),
        ),
        Ok(Delivery::Recreated {
            session_id, reason, ..
        }) => report(
            AutoFixStatus::Success,
            Some("recreated"),
            Some(session_id),
            format!("started a new session because {reason}"),
        ),
        Err(err) => report(AutoFixStatus::Error, None, err.previous, err.message),
    }
}
