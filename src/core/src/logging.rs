//! Logging bootstrap.
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init`] once to install a subscriber.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"info"` or `"acipack_image=debug"`).
///
/// Calling it again after a subscriber is installed does nothing.
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
