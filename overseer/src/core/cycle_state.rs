//! In-memory scheduling ledger: append-only session history plus the current
//! occupant of each execution track.
//!
//! History keys are contiguous integers starting at 0; the highest key is the
//! most recent session. Loading, migration, and persistence live in
//! `core::migration` and `io::state_store`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current occupant of one execution track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub persona_id: Option<String>,
    pub session_id: Option<String>,
    pub pr_number: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of one started session. Only `pr_number` is ever
/// back-filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    pub persona_id: String,
    pub session_id: String,
    pub pr_number: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub track: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleState {
    /// Keyed by sequence number; serialized as decimal strings in ascending
    /// numeric order.
    pub history: BTreeMap<u64, HistoryEntry>,
    pub tracks: BTreeMap<String, Track>,
}

impl CycleState {
    /// Append a history entry and make the session the occupant of `track`.
    pub fn record_session(
        &mut self,
        persona_id: &str,
        session_id: &str,
        pr_number: Option<u64>,
        track: Option<&str>,
    ) -> u64 {
        self.record_session_at(persona_id, session_id, pr_number, track, Utc::now())
    }

    pub fn record_session_at(
        &mut self,
        persona_id: &str,
        session_id: &str,
        pr_number: Option<u64>,
        track: Option<&str>,
        now: DateTime<Utc>,
    ) -> u64 {
        let key = self.next_key();
        self.history.insert(
            key,
            HistoryEntry {
                persona_id: persona_id.to_string(),
                session_id: session_id.to_string(),
                pr_number,
                created_at: Some(now),
                track: track.map(str::to_string),
            },
        );
        if let Some(name) = track {
            *self.get_track(name) = Track {
                persona_id: Some(persona_id.to_string()),
                session_id: Some(session_id.to_string()),
                pr_number,
                updated_at: Some(now),
            };
        }
        key
    }

    /// Back-fill the PR number on the newest history entry and, if it already
    /// exists, the named track. Unknown tracks are not created.
    pub fn update_pr_number(&mut self, pr_number: u64, track: Option<&str>) {
        if let Some((_, entry)) = self.history.iter_mut().next_back() {
            entry.pr_number = Some(pr_number);
        }
        if let Some(existing) = track.and_then(|name| self.tracks.get_mut(name)) {
            existing.pr_number = Some(pr_number);
        }
    }

    /// Attach a PR to the newest history entry of `session_id` and to the
    /// named track if it exists. Unlike [`Self::update_pr_number`], entries of
    /// other sessions are never touched.
    pub fn link_pr(&mut self, session_id: &str, pr_number: u64, track: Option<&str>) {
        if let Some(entry) = self
            .history
            .values_mut()
            .rev()
            .find(|entry| entry.session_id == session_id)
        {
            entry.pr_number = Some(pr_number);
        }
        if let Some(existing) = track.and_then(|name| self.tracks.get_mut(name)) {
            existing.pr_number = Some(pr_number);
        }
    }

    /// Track by name, created empty on first access.
    pub fn get_track(&mut self, name: &str) -> &mut Track {
        self.tracks.entry(name.to_string()).or_default()
    }

    /// Newest history entry started on `track`.
    pub fn latest_on_track(&self, track: &str) -> Option<&HistoryEntry> {
        self.history
            .values()
            .rev()
            .find(|entry| entry.track.as_deref() == Some(track))
    }

    /// Newest history entry for `session_id`.
    pub fn entry_for_session(&self, session_id: &str) -> Option<&HistoryEntry> {
        self.history
            .values()
            .rev()
            .find(|entry| entry.session_id == session_id)
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.history.values().next_back()
    }

    /// Name of a track other than `except` currently occupied by `persona_id`.
    pub fn track_holding_persona(&self, persona_id: &str, except: &str) -> Option<&str> {
        self.tracks
            .iter()
            .find(|(name, track)| {
                name.as_str() != except && track.persona_id.as_deref() == Some(persona_id)
            })
            .map(|(name, _)| name.as_str())
    }

    pub fn next_key(&self) -> u64 {
        self.history.keys().next_back().map_or(0, |last| last + 1)
    }
}
