//! Diagnostic tracing for the control loop.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. Command results
//! (reports, state dumps) go to stdout and are unaffected by it. The PR
//! comments posted after each action are the record maintainers read; logs
//! are for whoever runs the scheduler.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=overseer=debug overseer feedback --dry-run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
