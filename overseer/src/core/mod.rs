//! Deterministic, pure logic shared by the feedback loop.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod cycle_state;
pub mod feedback;
pub mod migration;
pub mod prompt;
pub mod rotation;
pub mod session_id;
pub mod types;
