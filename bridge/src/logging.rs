//! Tracing setup for binaries and tests

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber from `RUST_LOG`, falling back to the
/// given level. Safe to call more than once; later calls are no-ops.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
