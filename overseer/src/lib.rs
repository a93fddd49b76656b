//! Control loop for autonomous coding agents working through pull requests.
//!
//! Agents ("personas") take turns on named tracks, each running in a remote
//! session that opens pull requests against a shared integration branch. One
//! invocation of the loop inspects those pull requests, nudges the owning
//! session when checks fail or reviewers ask for changes, and keeps a durable
//! ledger of which session ran where.
//!
//! - **[`core`]**: Pure, deterministic logic (feedback decisions, session id
//!   recovery, the scheduling ledger and its migrations). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, `git`, `gh`, HTTP).
//!   Isolated behind traits so orchestration can be tested with doubles.
//!
//! Orchestration modules ([`cycle`], [`tracks`], [`branch`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod branch;
pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tracks;
