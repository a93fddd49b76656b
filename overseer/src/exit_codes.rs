//! Stable exit codes for overseer CLI commands.

/// Command completed, including "nothing to do".
pub const OK: i32 = 0;
/// Repository identity, configuration, or credentials are missing or invalid.
pub const INVALID: i32 = 1;
/// The command ran but its action failed (autofix error, branch push rejected).
pub const FAILED: i32 = 2;
