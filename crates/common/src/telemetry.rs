//! Tracing bootstrap for binaries and integration tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global fmt subscriber honoring `RUST_LOG` (default "info").
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
