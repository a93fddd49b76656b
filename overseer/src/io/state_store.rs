//! Cycle state persistence (`.overseer/cycle_state.json`).
//!
//! Loading is total: a missing, unreadable, or corrupted file yields an empty
//! state so the loop can always make progress. Saving is atomic.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::cycle_state::CycleState;
use crate::core::migration::migrate;

/// Load state from disk, migrating legacy layouts. Never fails.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_state(path: &Path) -> CycleState {
    match try_load_state(path) {
        Ok(Some(state)) => {
            debug!(
                history = state.history.len(),
                tracks = state.tracks.len(),
                "cycle state loaded"
            );
            state
        }
        Ok(None) => {
            debug!("no cycle state file, starting empty");
            CycleState::default()
        }
        Err(err) => {
            warn!(err = format!("{err:#}"), "cycle state unusable, starting empty");
            CycleState::default()
        }
    }
}

fn try_load_state(path: &Path) -> Result<Option<CycleState>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read cycle state {}", path.display()));
        }
    };
    let raw: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse cycle state {}", path.display()))?;
    migrate(raw, Utc::now()).map(Some)
}

/// Serialized form written by [`save_state`]: history keys ascending, tracks
/// by name, two-space indentation, trailing newline.
pub fn render_state(state: &CycleState) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(state).context("serialize cycle state")?;
    buf.push('\n');
    Ok(buf)
}

/// Atomically write state to disk (temp file + rename).
#[instrument(skip_all, fields(path = %path.display()))]
pub fn save_state(path: &Path, state: &CycleState) -> Result<()> {
    debug!(
        history = state.history.len(),
        tracks = state.tracks.len(),
        "writing cycle state"
    );
    let buf = render_state(state)?;
    super::write_atomic(path, &buf)
}
