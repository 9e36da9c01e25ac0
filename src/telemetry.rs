//! Tracing bootstrap for embedders and tests.

use tracing_subscriber::EnvFilter;

/// Initialise a global tracing subscriber honouring `RUST_LOG`, defaulting
/// to `info` for this crate. Safe to call more than once; only the first
/// call installs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("delver=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
