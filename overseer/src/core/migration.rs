//! Versioned load pipeline for the cycle state file.
//!
//! `detect_shape` → `canonicalize` → `validate_schema` → deserialize →
//! `repair_invariants`. Each stage is pure so the whole pipeline is testable
//! without touching the filesystem; `io::state_store` wraps it and turns any
//! failure into an empty state.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::cycle_state::{CycleState, HistoryEntry};

const V1_SCHEMA: &str = include_str!("../../../schemas/cycle_state/v1.schema.json");

const TRACK_FIELDS: [&str; 4] = ["persona_id", "session_id", "pr_number", "updated_at"];
const LEGACY_PREFIX: &str = "last_";

/// Layout of a raw state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateShape {
    /// `{"history": {"0": ...}, "tracks": {...}}`.
    Canonical,
    /// `{"history": [newest, ...], "tracks": {...}}`.
    NestedList,
    /// `[newest, ...]` with no tracks.
    BareList,
    Unrecognized,
}

pub fn detect_shape(raw: &Value) -> StateShape {
    match raw {
        Value::Array(_) => StateShape::BareList,
        Value::Object(map) => match map.get("history") {
            Some(Value::Array(_)) => StateShape::NestedList,
            None | Some(Value::Object(_) | Value::Null) => StateShape::Canonical,
            Some(_) => StateShape::Unrecognized,
        },
        _ => StateShape::Unrecognized,
    }
}

/// Rewrite any recognized shape into the canonical document.
///
/// Legacy lists are newest-first; they are reversed so key `"0"` is the
/// oldest entry. Track fields spelled `last_<field>` are renamed unless the
/// unprefixed field is also present.
pub fn canonicalize(raw: Value) -> Result<Value> {
    let shape = detect_shape(&raw);
    let (history, tracks) = match (shape, raw) {
        (StateShape::BareList, Value::Array(entries)) => (history_from_list(entries), Map::new()),
        (StateShape::NestedList | StateShape::Canonical, Value::Object(mut map)) => {
            let history = match map.remove("history") {
                Some(Value::Array(entries)) => history_from_list(entries),
                Some(Value::Object(entries)) => history_from_map(entries),
                _ => Map::new(),
            };
            let tracks = match map.remove("tracks") {
                Some(Value::Object(tracks)) => tracks,
                None | Some(Value::Null) => Map::new(),
                Some(other) => bail!("tracks must be an object, found {}", kind(&other)),
            };
            (history, tracks)
        }
        (_, other) => bail!("unrecognized state document ({})", kind(&other)),
    };

    let history = history
        .into_iter()
        .map(|(key, entry)| (key, scrub_timestamp(entry, "created_at")))
        .collect();
    let tracks = tracks
        .into_iter()
        .map(|(name, track)| (name, scrub_timestamp(strip_legacy_prefix(track), "updated_at")))
        .collect();

    let mut doc = Map::new();
    doc.insert("history".to_string(), Value::Object(history));
    doc.insert("tracks".to_string(), Value::Object(tracks));
    Ok(Value::Object(doc))
}

/// Check a canonical document against the v1 JSON Schema (Draft 2020-12).
pub fn validate_schema(doc: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(V1_SCHEMA).context("parse cycle state schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile cycle state schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(doc)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("state schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Restore the ledger invariants in place, returning a note per repair.
///
/// Keys are renumbered to be contiguous from 0 in their existing order, and
/// every track session missing from history gets a back-filled entry.
pub fn repair_invariants(state: &mut CycleState, now: DateTime<Utc>) -> Vec<String> {
    let mut notes = Vec::new();

    let contiguous = state
        .history
        .keys()
        .enumerate()
        .all(|(index, key)| u64::try_from(index).is_ok_and(|index| index == *key));
    if !contiguous {
        notes.push(format!(
            "renumbered {} history entries to close key gaps",
            state.history.len()
        ));
        state.history = std::mem::take(&mut state.history)
            .into_values()
            .zip(0u64..)
            .map(|(entry, key)| (key, entry))
            .collect();
    }

    let orphans: Vec<(String, HistoryEntry)> = state
        .tracks
        .iter()
        .filter_map(|(name, track)| {
            let session_id = track.session_id.as_deref()?;
            let known = state
                .history
                .values()
                .any(|entry| entry.session_id == session_id);
            (!known).then(|| {
                (
                    name.clone(),
                    HistoryEntry {
                        persona_id: track.persona_id.clone().unwrap_or_default(),
                        session_id: session_id.to_string(),
                        pr_number: track.pr_number,
                        created_at: Some(track.updated_at.unwrap_or(now)),
                        track: Some(name.clone()),
                    },
                )
            })
        })
        .collect();
    for (name, entry) in orphans {
        notes.push(format!(
            "back-filled history for session {} on track {name}",
            entry.session_id
        ));
        let key = state.next_key();
        state.history.insert(key, entry);
    }

    notes
}

/// Full pipeline from a parsed document to a valid state.
pub fn migrate(raw: Value, now: DateTime<Utc>) -> Result<CycleState> {
    let shape = detect_shape(&raw);
    if shape == StateShape::Unrecognized {
        bail!("unrecognized state document ({})", kind(&raw));
    }
    let doc = canonicalize(raw)?;
    validate_schema(&doc)?;
    let mut state: CycleState =
        serde_json::from_value(doc).context("deserialize canonical cycle state")?;
    for note in repair_invariants(&mut state, now) {
        warn!(?shape, note = %note, "repaired cycle state");
    }
    Ok(state)
}

fn history_from_list(entries: Vec<Value>) -> Map<String, Value> {
    entries
        .into_iter()
        .rev()
        .enumerate()
        .map(|(index, entry)| (index.to_string(), entry))
        .collect()
}

fn history_from_map(entries: Map<String, Value>) -> Map<String, Value> {
    entries
        .into_iter()
        .filter(|(key, _)| {
            let numeric = key.parse::<u64>().is_ok();
            if !numeric {
                warn!(key = %key, "dropping history entry with non-integer key");
            }
            numeric
        })
        .collect()
}

fn strip_legacy_prefix(track: Value) -> Value {
    let fields = match track {
        Value::Object(fields) => fields,
        other => return other,
    };
    let mut cleaned = Map::new();
    for field in TRACK_FIELDS {
        let legacy = format!("{LEGACY_PREFIX}{field}");
        if let Some(value) = fields.get(field).or_else(|| fields.get(&legacy)) {
            cleaned.insert(field.to_string(), value.clone());
        }
    }
    Value::Object(cleaned)
}

fn scrub_timestamp(mut record: Value, field: &str) -> Value {
    if let Some(fields) = record.as_object_mut()
        && let Some(Value::String(raw)) = fields.get(field)
        && DateTime::parse_from_rfc3339(raw).is_err()
    {
        warn!(field, value = %raw, "dropping unparseable timestamp");
        fields.insert(field.to_string(), Value::Null);
    }
    record
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
