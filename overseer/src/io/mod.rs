//! Side-effecting adapters: filesystem, git, `gh`, and HTTP.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod config;
pub mod git;
pub mod github;
pub mod mirror;
pub mod process;
pub mod session_client;
pub mod state_store;

/// Write `contents` next to `path` and rename over it, so readers never see a
/// partial file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let extension = path
        .extension()
        .map(|ext| format!("{}.tmp", ext.to_string_lossy()))
        .unwrap_or_else(|| "tmp".to_string());
    let tmp_path = path.with_extension(extension);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
