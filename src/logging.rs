//! Tracing setup helpers.
//!
//! The simulator logs through `tracing`: protocol progress at DEBUG, setup at
//! INFO, tolerated races at DEBUG, state-machine misuse at WARN. These
//! helpers install a formatting subscriber; the level comes from `RUST_LOG`
//! when set.

use tracing_subscriber::EnvFilter;

/// Install a global subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init() {
    init_with_default("info");
}

/// Install a global subscriber with the given default level, still
/// overridable through `RUST_LOG`.
pub fn init_with_default(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
