//! Bootstrap utilities for angzarr-runner binaries and tests.
//!
//! Shared initialization code, mirroring the framework-wide convention of a
//! single `init_tracing` call at process start.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with the ANGZARR_LOG environment variable.
///
/// Defaults to "info" level if ANGZARR_LOG is not set. Safe to call more
/// than once per process (e.g. from multiple test modules); later calls
/// after the global subscriber is set are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("ANGZARR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
