//! Track maintenance: keep each track's session moving, rotate personas on
//! the cycle track, and start new sessions.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::branch::{BranchRemote, BranchStatus, ensure_branch};
use crate::core::cycle_state::CycleState;
use crate::core::prompt::NUDGE_MESSAGE;
use crate::core::rotation::{next_persona, session_expired};
use crate::core::session_id::{self, normalize};
use crate::core::types::{PrSummary, RepoId};
use crate::io::github::PullRequests;
use crate::io::mirror::{StateMirror, save_and_mirror};
use crate::io::session_client::{AutomationMode, CreateSessionRequest, SessionApi, SessionState};
use crate::io::state_store::load_state;

/// What a tick did for one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrackAction {
    /// Session is working within its time budget; nothing to do.
    Observed,
    PlanApproved,
    Nudged,
    /// Session reached `COMPLETED` or `FAILED`.
    Finished,
    /// Session kept working past the timeout and is abandoned.
    TimedOut { elapsed_minutes: i64 },
    Unreachable { message: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackTick {
    pub track: String,
    pub session_id: String,
    pub state: Option<SessionState>,
    #[serde(flatten)]
    pub action: TrackAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_pr: Option<u64>,
}

impl TrackTick {
    /// The track is free for its next session.
    pub fn is_done(&self) -> bool {
        matches!(
            self.action,
            TrackAction::Finished | TrackAction::TimedOut { .. }
        )
    }
}

/// What rotation did on the cycle track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RotationStep {
    /// The current session is still working.
    Waiting { session_id: String },
    Started {
        #[serde(flatten)]
        start: StartReport,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_session: Option<String>,
        completed_round: bool,
    },
    Failed { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackReport {
    pub tracks: Vec<TrackTick>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationStep>,
}

impl TrackReport {
    fn linked_any(&self) -> bool {
        self.tracks.iter().any(|tick| tick.linked_pr.is_some())
    }

    fn started(&self) -> Option<&StartReport> {
        match &self.rotation {
            Some(RotationStep::Started { start, .. }) => Some(start),
            _ => None,
        }
    }

    pub fn rotation_failed(&self) -> bool {
        matches!(self.rotation, Some(RotationStep::Failed { .. }))
    }
}

/// Knobs for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickOptions<'a> {
    /// Author whose open PRs are matched against track sessions.
    pub author: &'a str,
    pub now: DateTime<Utc>,
    pub session_timeout: TimeDelta,
}

/// Advance every occupied track once, mutating `state` in memory.
///
/// Plans awaiting approval are approved, sessions waiting on a human are
/// nudged, finished or overdue sessions are flagged, and a track without a PR
/// is linked to the open PR whose branch carries its session id.
pub fn tick_state<S, P>(
    state: &mut CycleState,
    sessions: &S,
    prs: Option<&P>,
    opts: &TickOptions<'_>,
) -> TrackReport
where
    S: SessionApi + ?Sized,
    P: PullRequests + ?Sized,
{
    let occupied: Vec<(String, String, bool)> = state
        .tracks
        .iter()
        .filter_map(|(name, track)| {
            let session = track.session_id.clone()?;
            Some((name.clone(), session, track.pr_number.is_none()))
        })
        .collect();

    let mut open_prs: Option<Vec<PrSummary>> = None;
    let mut report = TrackReport::default();
    for (name, session, needs_pr) in occupied {
        let recorded_start = state
            .entry_for_session(&session)
            .and_then(|entry| entry.created_at);
        let (state_seen, action) = advance_session(sessions, &session, recorded_start, opts);
        let linked_pr = if needs_pr {
            let open = open_prs.get_or_insert_with(|| list_open_or_empty(prs, opts.author));
            find_pr_for_session(open, &session)
        } else {
            None
        };
        if let Some(number) = linked_pr {
            info!(track = %name, pr = number, "linked track to pull request");
            state.link_pr(&session, number, Some(name.as_str()));
        }
        report.tracks.push(TrackTick {
            track: name,
            session_id: session,
            state: state_seen,
            action,
            linked_pr,
        });
    }
    report
}

fn advance_session<S: SessionApi + ?Sized>(
    sessions: &S,
    session: &str,
    recorded_start: Option<DateTime<Utc>>,
    opts: &TickOptions<'_>,
) -> (Option<SessionState>, TrackAction) {
    let current = match sessions.get_session(session) {
        Ok(current) => current,
        Err(err) => {
            warn!(session_id = session, err = %err, "session unreachable");
            return (
                None,
                TrackAction::Unreachable {
                    message: err.to_string(),
                },
            );
        }
    };
    let started_at = recorded_start.or_else(|| {
        current
            .create_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
    });
    let action = match current.state {
        SessionState::AwaitingPlanApproval => match sessions.approve_plan(session) {
            Ok(()) => TrackAction::PlanApproved,
            Err(err) => TrackAction::Failed {
                message: err.to_string(),
            },
        },
        SessionState::AwaitingUserFeedback => {
            match sessions.send_message(session, NUDGE_MESSAGE) {
                Ok(()) => TrackAction::Nudged,
                Err(err) => TrackAction::Failed {
                    message: err.to_string(),
                },
            }
        }
        seen if seen.is_terminal() => TrackAction::Finished,
        seen if session_expired(seen, started_at, opts.now, opts.session_timeout) => {
            let elapsed_minutes = started_at.map_or(0, |at| (opts.now - at).num_minutes());
            warn!(session_id = session, elapsed_minutes, "session timed out");
            TrackAction::TimedOut { elapsed_minutes }
        }
        _ => TrackAction::Observed,
    };
    (Some(current.state), action)
}

fn list_open_or_empty<P: PullRequests + ?Sized>(prs: Option<&P>, author: &str) -> Vec<PrSummary> {
    let Some(prs) = prs else {
        return Vec::new();
    };
    prs.list_open(author).unwrap_or_else(|err| {
        warn!(err = format!("{err:#}"), "listing open pull requests failed");
        Vec::new()
    })
}

fn find_pr_for_session(open: &[PrSummary], session: &str) -> Option<u64> {
    let wanted = normalize(session);
    open.iter()
        .find(|pr| session_id::from_branch(&pr.head_branch).as_deref() == Some(wanted))
        .map(|pr| pr.number)
}

/// Persona rotation on one track.
#[derive(Debug, Clone, Copy)]
pub struct Rotation<'a, R: ?Sized> {
    pub branch_remote: &'a R,
    pub repo: &'a RepoId,
    pub integration_branch: &'a str,
    pub track: &'a str,
    /// Rotation order; must not be empty.
    pub personas: &'a [String],
    /// Holds `<persona>.md` prompts.
    pub prompts_dir: &'a Path,
}

/// Start the next persona on the rotation track once its current session is
/// done, or right away if the track is empty.
fn rotate<S, R>(
    state: &mut CycleState,
    ticks: &[TrackTick],
    sessions: &S,
    rotation: &Rotation<'_, R>,
) -> RotationStep
where
    S: SessionApi + ?Sized,
    R: BranchRemote + ?Sized,
{
    let current = ticks.iter().find(|tick| tick.track == rotation.track);
    if let Some(tick) = current
        && !tick.is_done()
    {
        return RotationStep::Waiting {
            session_id: tick.session_id.clone(),
        };
    }
    let Some(next) = next_persona(state, rotation.track, rotation.personas) else {
        return RotationStep::Failed {
            message: "no personas configured for rotation".to_string(),
        };
    };
    let prompt_path = rotation.prompts_dir.join(format!("{}.md", next.persona));
    let started = fs::read_to_string(&prompt_path)
        .with_context(|| format!("read {}", prompt_path.display()))
        .and_then(|prompt| {
            start_on_track(
                state,
                rotation.branch_remote,
                sessions,
                StartRequest {
                    repo: rotation.repo,
                    integration_branch: rotation.integration_branch,
                    track: rotation.track,
                    persona: &next.persona,
                    prompt,
                    title: Some(format!("{}: cycle task", next.persona)),
                    require_plan_approval: false,
                },
            )
        });
    match started {
        Ok(start) => {
            info!(persona = %next.persona, completed_round = next.completed_round, "rotated");
            RotationStep::Started {
                start,
                previous_session: current.map(|tick| tick.session_id.clone()),
                completed_round: next.completed_round,
            }
        }
        Err(err) => {
            warn!(persona = %next.persona, err = format!("{err:#}"), "rotation failed");
            RotationStep::Failed {
                message: format!("{err:#}"),
            }
        }
    }
}

/// Load state, tick every track, rotate the cycle track when configured,
/// and save once if anything changed.
#[instrument(skip_all, fields(path = %state_path.display()))]
pub fn tick_tracks<S, P, R>(
    state_path: &Path,
    mirror: Option<&dyn StateMirror>,
    sessions: &S,
    prs: Option<&P>,
    opts: &TickOptions<'_>,
    rotation: Option<&Rotation<'_, R>>,
) -> Result<TrackReport>
where
    S: SessionApi + ?Sized,
    P: PullRequests + ?Sized,
    R: BranchRemote + ?Sized,
{
    let mut state = load_state(state_path);
    let mut report = tick_state(&mut state, sessions, prs, opts);
    if let Some(rotation) = rotation {
        report.rotation = Some(rotate(&mut state, &report.tracks, sessions, rotation));
    }
    let message = match report.started() {
        Some(start) => format!("chore: cycle state -> {}", start.persona),
        None if report.linked_any() => "chore: link track pull requests".to_string(),
        None => return Ok(report),
    };
    save_and_mirror(state_path, &state, mirror, &message)?;
    Ok(report)
}

/// Parameters for starting a persona on a track.
#[derive(Debug, Clone)]
pub struct StartRequest<'a> {
    pub repo: &'a RepoId,
    pub integration_branch: &'a str,
    pub track: &'a str,
    pub persona: &'a str,
    pub prompt: String,
    pub title: Option<String>,
    pub require_plan_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub track: String,
    pub persona: String,
    pub session_id: String,
    pub history_key: u64,
    pub branch: BranchStatus,
}

/// Start `persona` on `track` from the integration branch and record it in
/// `state`. A persona occupies at most one track at a time; starting it on a
/// second track is refused before anything remote is touched.
fn start_on_track<S, R>(
    state: &mut CycleState,
    branch_remote: &R,
    sessions: &S,
    request: StartRequest<'_>,
) -> Result<StartReport>
where
    S: SessionApi + ?Sized,
    R: BranchRemote + ?Sized,
{
    if let Some(other) = state.track_holding_persona(request.persona, request.track) {
        bail!("persona {} already occupies track {other}", request.persona);
    }

    let branch = ensure_branch(branch_remote, request.integration_branch)?;
    let session = sessions.create_session(&CreateSessionRequest {
        prompt: request.prompt,
        repo: request.repo.clone(),
        starting_branch: request.integration_branch.to_string(),
        title: request.title,
        require_plan_approval: request.require_plan_approval,
        automation_mode: AutomationMode::AutoCreatePr,
    })?;
    let session_id = session.session_id().to_string();
    let history_key =
        state.record_session(request.persona, &session_id, None, Some(request.track));
    info!(session_id = %session_id, history_key, "track session started");

    Ok(StartReport {
        track: request.track.to_string(),
        persona: request.persona.to_string(),
        session_id,
        history_key,
        branch,
    })
}

/// Start `persona` on `track`, then save (and mirror) the state.
#[instrument(skip_all, fields(track = request.track, persona = request.persona))]
pub fn start_track_session<S, R>(
    state_path: &Path,
    mirror: Option<&dyn StateMirror>,
    branch_remote: &R,
    sessions: &S,
    request: StartRequest<'_>,
) -> Result<StartReport>
where
    S: SessionApi + ?Sized,
    R: BranchRemote + ?Sized,
{
    let mut state = load_state(state_path);
    let report = start_on_track(&mut state, branch_remote, sessions, request)?;
    save_and_mirror(
        state_path,
        &state,
        mirror,
        &format!("chore: start {} on {}", report.persona, report.track),
    )?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state_store::save_state;
    use crate::test_support::{
        RecordingBranchRemote, RecordingMirror, ScriptedPullRequests, ScriptedSessions,
        SessionCall, snapshot, ts,
    };

    const NO_ROTATION: Option<&Rotation<'_, RecordingBranchRemote>> = None;

    fn repo() -> RepoId {
        RepoId::parse("octo/widgets").expect("repo")
    }

    fn opts() -> TickOptions<'static> {
        TickOptions {
            author: "bot",
            now: ts("2024-06-01T12:00:00Z"),
            session_timeout: TimeDelta::minutes(30),
        }
    }

    fn personas() -> Vec<String> {
        ["architect", "tester", "scribe"]
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    struct RotationFixture {
        temp: tempfile::TempDir,
        remote: RecordingBranchRemote,
        repo: RepoId,
        personas: Vec<String>,
    }

    impl RotationFixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            for persona in personas() {
                fs::write(
                    temp.path().join(format!("{persona}.md")),
                    format!("You are the {persona}."),
                )
                .expect("write prompt");
            }
            Self {
                temp,
                remote: RecordingBranchRemote::with_remote_branches(&["jules"]),
                repo: repo(),
                personas: personas(),
            }
        }

        fn state_path(&self) -> std::path::PathBuf {
            self.temp.path().join("cycle_state.json")
        }

        fn rotation(&self) -> Rotation<'_, RecordingBranchRemote> {
            Rotation {
                branch_remote: &self.remote,
                repo: &self.repo,
                integration_branch: "jules",
                track: "cycle",
                personas: &self.personas,
                prompts_dir: self.temp.path(),
            }
        }

        fn tick(&self, sessions: &ScriptedSessions) -> TrackReport {
            tick_tracks(
                &self.state_path(),
                None,
                sessions,
                None::<&ScriptedPullRequests>,
                &opts(),
                Some(&self.rotation()),
            )
            .expect("tick")
        }
    }

    fn start_request<'a>(repo: &'a RepoId, track: &'a str, persona: &'a str) -> StartRequest<'a> {
        StartRequest {
            repo,
            integration_branch: "jules",
            track,
            persona,
            prompt: "do the thing".to_string(),
            title: None,
            require_plan_approval: false,
        }
    }

    #[test]
    fn tick_approves_nudges_and_observes() {
        let mut state = CycleState::default();
        state.record_session("a", "s-plan", Some(1), Some("design"));
        state.record_session("b", "s-wait", Some(2), Some("infra"));
        state.record_session("c", "s-busy", Some(3), Some("docs"));
        let sessions = ScriptedSessions::new();
        sessions.set_state("s-plan", SessionState::AwaitingPlanApproval);
        sessions.set_state("s-wait", SessionState::AwaitingUserFeedback);

        let report = tick_state(&mut state, &sessions, None::<&ScriptedPullRequests>, &opts());
        let actions: Vec<_> = report
            .tracks
            .iter()
            .map(|tick| (tick.track.as_str(), tick.action.clone()))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("design", TrackAction::PlanApproved),
                ("docs", TrackAction::Observed),
                ("infra", TrackAction::Nudged),
            ]
        );
        let calls = sessions.calls();
        assert!(calls.contains(&SessionCall::Approve("s-plan".to_string())));
        assert!(calls.contains(&SessionCall::Send(
            "s-wait".to_string(),
            NUDGE_MESSAGE.to_string()
        )));
    }

    #[test]
    fn tick_links_pr_by_branch_session_suffix() {
        let mut state = CycleState::default();
        state.record_session("a", "123456789012345678", None, Some("design"));
        state.record_session("b", "999999999999999999", None, Some("infra"));
        let mut pr = snapshot(31);
        pr.head_branch = "design-work-123456789012345678".to_string();
        let prs = ScriptedPullRequests::with(vec![pr]);

        let report = tick_state(&mut state, &ScriptedSessions::new(), Some(&prs), &opts());
        assert_eq!(report.tracks[0].linked_pr, Some(31));
        assert_eq!(state.tracks["design"].pr_number, Some(31));
        assert_eq!(state.history[&0].pr_number, Some(31));
        assert_eq!(state.history[&1].pr_number, None);
        assert_eq!(prs.list_calls(), 1);
    }

    #[test]
    fn unreachable_session_is_reported() {
        let mut state = CycleState::default();
        state.record_session("a", "gone", Some(1), Some("design"));
        let sessions = ScriptedSessions::new();
        sessions.forget("gone");
        let report = tick_state(&mut state, &sessions, None::<&ScriptedPullRequests>, &opts());
        assert!(matches!(
            report.tracks[0].action,
            TrackAction::Unreachable { .. }
        ));
        assert_eq!(report.tracks[0].state, None);
    }

    #[test]
    fn tick_tracks_saves_only_when_linked() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cycle_state.json");
        let mut state = CycleState::default();
        state.record_session("a", "123456789012345678", None, Some("design"));
        save_state(&path, &state).expect("save");
        let mirror = RecordingMirror::default();

        let report = tick_tracks(
            &path,
            Some(&mirror),
            &ScriptedSessions::new(),
            None::<&ScriptedPullRequests>,
            &opts(),
            NO_ROTATION,
        )
        .expect("tick");
        assert_eq!(report.tracks.len(), 1);
        assert!(mirror.uploads().is_empty());

        let mut pr = snapshot(5);
        pr.head_branch = "x-123456789012345678".to_string();
        let prs = ScriptedPullRequests::with(vec![pr]);
        tick_tracks(
            &path,
            Some(&mirror),
            &ScriptedSessions::new(),
            Some(&prs),
            &opts(),
            NO_ROTATION,
        )
        .expect("tick");
        assert_eq!(load_state(&path).tracks["design"].pr_number, Some(5));
        assert_eq!(mirror.uploads().len(), 1);
    }

    #[test]
    fn start_records_session_after_branch_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cycle_state.json");
        let remote = RecordingBranchRemote::with_remote_branches(&["jules"]);
        let sessions = ScriptedSessions::new();
        let repo = repo();

        let report = start_track_session(
            &path,
            None,
            &remote,
            &sessions,
            start_request(&repo, "design", "curator"),
        )
        .expect("start");
        assert_eq!(report.session_id, "created-1");
        assert_eq!(report.history_key, 0);
        assert_eq!(report.branch, BranchStatus::Existing);
        assert_eq!(sessions.created()[0].starting_branch, "jules");

        let state = load_state(&path);
        assert_eq!(state.tracks["design"].persona_id.as_deref(), Some("curator"));
        assert_eq!(state.history[&0].session_id, "created-1");
    }

    #[test]
    fn persona_cannot_hold_two_tracks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cycle_state.json");
        let mut state = CycleState::default();
        state.record_session("curator", "s-1", None, Some("design"));
        save_state(&path, &state).expect("save");
        let remote = RecordingBranchRemote::with_remote_branches(&["jules"]);
        let sessions = ScriptedSessions::new();
        let repo = repo();

        let err = start_track_session(
            &path,
            None,
            &remote,
            &sessions,
            start_request(&repo, "infra", "curator"),
        )
        .expect_err("busy");
        assert!(err.to_string().contains("already occupies track design"));
        assert!(sessions.created().is_empty());
        assert!(remote.calls().is_empty());

        start_track_session(
            &path,
            None,
            &remote,
            &sessions,
            start_request(&repo, "design", "curator"),
        )
        .expect("same track is a replacement");
    }

    #[test]
    fn finished_and_overdue_sessions_are_flagged() {
        let now = opts().now;
        let mut state = CycleState::default();
        state.record_session_at("a", "s-done", None, Some("design"), now);
        state.record_session_at("b", "s-old", None, Some("docs"), now - TimeDelta::hours(2));
        state.record_session_at("c", "s-fresh", None, Some("infra"), now - TimeDelta::minutes(5));
        let sessions = ScriptedSessions::new();
        sessions.set_state("s-done", SessionState::Failed);

        let report = tick_state(&mut state, &sessions, None::<&ScriptedPullRequests>, &opts());
        let actions: Vec<_> = report.tracks.iter().map(|tick| tick.action.clone()).collect();
        assert_eq!(
            actions,
            vec![
                TrackAction::Finished,
                TrackAction::TimedOut {
                    elapsed_minutes: 120
                },
                TrackAction::Observed,
            ]
        );
        assert!(report.tracks[0].is_done());
        assert!(!report.tracks[2].is_done());
    }

    #[test]
    fn empty_rotation_track_starts_first_persona() {
        let fixture = RotationFixture::new();
        let sessions = ScriptedSessions::new();

        let report = fixture.tick(&sessions);
        let Some(RotationStep::Started {
            start,
            previous_session,
            completed_round,
        }) = report.rotation
        else {
            panic!("expected a start, got {:?}", report.rotation);
        };
        assert_eq!(start.persona, "architect");
        assert_eq!(start.session_id, "created-1");
        assert_eq!(previous_session, None);
        assert!(!completed_round);
        assert_eq!(sessions.created()[0].prompt, "You are the architect.");
        assert_eq!(
            sessions.created()[0].title.as_deref(),
            Some("architect: cycle task")
        );

        let state = load_state(&fixture.state_path());
        assert_eq!(state.tracks["cycle"].session_id.as_deref(), Some("created-1"));
    }

    #[test]
    fn working_session_keeps_the_track() {
        let fixture = RotationFixture::new();
        let mut state = CycleState::default();
        state.record_session_at("architect", "s-1", None, Some("cycle"), opts().now);
        save_state(&fixture.state_path(), &state).expect("save");
        let sessions = ScriptedSessions::new();

        let report = fixture.tick(&sessions);
        assert_eq!(
            report.rotation,
            Some(RotationStep::Waiting {
                session_id: "s-1".to_string()
            })
        );
        assert!(sessions.created().is_empty());
        assert_eq!(load_state(&fixture.state_path()), state);
    }

    #[test]
    fn completed_session_hands_over_to_next_persona() {
        let fixture = RotationFixture::new();
        let mut state = CycleState::default();
        state.record_session_at("architect", "s-1", Some(9), Some("cycle"), opts().now);
        save_state(&fixture.state_path(), &state).expect("save");
        let sessions = ScriptedSessions::new();
        sessions.set_state("s-1", SessionState::Completed);

        let report = fixture.tick(&sessions);
        let Some(RotationStep::Started {
            start,
            previous_session,
            ..
        }) = report.rotation
        else {
            panic!("expected a start, got {:?}", report.rotation);
        };
        assert_eq!(start.persona, "tester");
        assert_eq!(previous_session.as_deref(), Some("s-1"));

        let state = load_state(&fixture.state_path());
        let track = &state.tracks["cycle"];
        assert_eq!(track.persona_id.as_deref(), Some("tester"));
        assert_eq!(track.pr_number, None);
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn overdue_last_persona_wraps_and_completes_round() {
        let fixture = RotationFixture::new();
        let mut state = CycleState::default();
        let started = opts().now - TimeDelta::minutes(45);
        state.record_session_at("scribe", "s-3", None, Some("cycle"), started);
        save_state(&fixture.state_path(), &state).expect("save");
        let sessions = ScriptedSessions::new();

        let report = fixture.tick(&sessions);
        assert_eq!(
            report.tracks[0].action,
            TrackAction::TimedOut {
                elapsed_minutes: 45
            }
        );
        let Some(RotationStep::Started {
            start,
            completed_round,
            ..
        }) = report.rotation
        else {
            panic!("expected a start, got {:?}", report.rotation);
        };
        assert_eq!(start.persona, "architect");
        assert!(completed_round);
    }

    #[test]
    fn missing_prompt_fails_rotation_without_saving() {
        let fixture = RotationFixture::new();
        fs::remove_file(fixture.temp.path().join("architect.md")).expect("remove");
        let sessions = ScriptedSessions::new();

        let report = fixture.tick(&sessions);
        let Some(RotationStep::Failed { message }) = &report.rotation else {
            panic!("expected a failure, got {:?}", report.rotation);
        };
        assert!(message.contains("architect.md"), "{message}");
        assert!(report.rotation_failed());
        assert!(sessions.created().is_empty());
        assert!(!fixture.state_path().exists());
    }
}
