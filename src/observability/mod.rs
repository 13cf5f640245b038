//! Tracing subscriber setup.
//!
//! Everything in the crate logs through `tracing` with dotted event names
//! (`delivery.scheduled`, `gate.retry`, ...). Embedding applications that
//! already install a subscriber can skip [`init_tracing`] entirely.

use crate::config::ObservabilityConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter from `RUST_LOG` when set, otherwise from the configured level.
/// An unparsable level falls back to `info`.
pub fn build_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| directive_filter(&config.log_level))
}

fn directive_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level.trim()).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global fmt subscriber. Returns `false` when one was already set.
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    fmt::Subscriber::builder()
        .with_env_filter(build_filter(config))
        .with_target(false)
        .try_init()
        .is_ok()
}
