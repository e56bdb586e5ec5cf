//! # Logging Setup
//!
//! Small helpers around `tracing-subscriber` for binaries and tests. The
//! library itself only emits `tracing` events; subscribers are always
//! installed explicitly by the embedding application, never ambiently.

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a human-readable subscriber filtered by `RUST_LOG`.
///
/// Safe to call repeatedly; later calls are no-ops when a global
/// subscriber is already set.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init();
}

/// Install a JSON subscriber filtered by `RUST_LOG`, for log shippers.
pub fn init_json() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .json()
        .try_init();
}
