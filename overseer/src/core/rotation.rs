//! Persona rotation on the cycle track.
//!
//! Personas take turns in a fixed order. When the session on the cycle track
//! finishes or overruns its time budget, the persona after the one that last
//! ran on the track is started. Wrapping back to the first persona completes
//! a round.

use chrono::{DateTime, TimeDelta, Utc};

use crate::core::cycle_state::CycleState;
use crate::io::session_client::SessionState;

/// Who runs next on the cycle track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextPersona {
    pub persona: String,
    pub index: usize,
    /// The rotation wrapped around to the first persona.
    pub completed_round: bool,
}

/// Index after `current` in `personas`, and whether that wraps around.
///
/// An unknown or absent `current` starts from the beginning without
/// completing a round. `None` only when `personas` is empty.
pub fn advance_cycle(personas: &[String], current: Option<&str>) -> Option<(usize, bool)> {
    if personas.is_empty() {
        return None;
    }
    let Some(position) = current.and_then(|id| personas.iter().position(|p| p == id)) else {
        return Some((0, false));
    };
    let next = (position + 1) % personas.len();
    Some((next, next == 0))
}

/// Successor of the persona in the newest history entry on `track`.
pub fn next_persona(state: &CycleState, track: &str, personas: &[String]) -> Option<NextPersona> {
    let last = state
        .latest_on_track(track)
        .map(|entry| entry.persona_id.as_str());
    let (index, completed_round) = advance_cycle(personas, last)?;
    Some(NextPersona {
        persona: personas[index].clone(),
        index,
        completed_round,
    })
}

/// True when a session still working after `timeout` should be abandoned.
///
/// Only states where the agent is expected to make progress on its own count;
/// sessions waiting on approval or input are handled by approving or nudging,
/// and finished ones rotate regardless. Without a start time nothing expires.
pub fn session_expired(
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: TimeDelta,
) -> bool {
    let working = matches!(
        state,
        SessionState::Queued
            | SessionState::Planning
            | SessionState::InProgress
            | SessionState::Paused
    );
    working && started_at.is_some_and(|at| now - at > timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ts;

    fn personas() -> Vec<String> {
        ["curator", "refactor", "docs"]
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    #[test]
    fn advance_wraps_and_flags_completed_round() {
        let personas = personas();
        assert_eq!(advance_cycle(&personas, Some("curator")), Some((1, false)));
        assert_eq!(advance_cycle(&personas, Some("refactor")), Some((2, false)));
        assert_eq!(advance_cycle(&personas, Some("docs")), Some((0, true)));
        assert_eq!(advance_cycle(&personas, Some("retired")), Some((0, false)));
        assert_eq!(advance_cycle(&personas, None), Some((0, false)));
        assert_eq!(advance_cycle(&[], Some("docs")), None);
    }

    #[test]
    fn single_persona_completes_a_round_every_time() {
        let solo = vec!["curator".to_string()];
        assert_eq!(advance_cycle(&solo, Some("curator")), Some((0, true)));
    }

    #[test]
    fn next_persona_follows_the_track_history() {
        let mut state = CycleState::default();
        assert_eq!(
            next_persona(&state, "cycle", &personas()).map(|n| n.persona),
            Some("curator".to_string())
        );

        state.record_session("refactor", "s-1", None, Some("cycle"));
        state.record_session("curator", "s-2", None, Some("design"));
        let next = next_persona(&state, "cycle", &personas()).expect("next");
        assert_eq!(
            next,
            NextPersona {
                persona: "docs".to_string(),
                index: 2,
                completed_round: false,
            }
        );
    }

    #[test]
    fn only_working_sessions_expire() {
        let started = Some(ts("2024-06-01T00:00:00Z"));
        let now = ts("2024-06-01T00:31:00Z");
        let timeout = TimeDelta::minutes(30);
        assert!(session_expired(SessionState::InProgress, started, now, timeout));
        assert!(session_expired(SessionState::Queued, started, now, timeout));
        assert!(!session_expired(
            SessionState::InProgress,
            started,
            ts("2024-06-01T00:30:00Z"),
            timeout
        ));
        assert!(!session_expired(SessionState::AwaitingUserFeedback, started, now, timeout));
        assert!(!session_expired(SessionState::Completed, started, now, timeout));
        assert!(!session_expired(SessionState::InProgress, None, now, timeout));
    }
}
