//! Optional `tracing` subscriber setup for binaries and tests.

use tracing_subscriber::{EnvFilter, fmt};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `warn,cellsim_eval=info`. Returns false if a global subscriber was
/// already set.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,cellsim_eval=info"));
    fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
