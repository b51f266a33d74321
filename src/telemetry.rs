//! Tracing setup for node binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber: compact single-line output, level taken
/// from `RUST_LOG` (default `info`). Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    init_with_default("info");
}

pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}
