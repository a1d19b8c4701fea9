//! Tracing setup for embedding binaries and tests.

use tracing_subscriber::EnvFilter;

/// Installs a formatted subscriber honoring `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
