//! Tracing subscriber setup.

use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the global tracing subscriber.
///
/// `env_filter` is the default directive set, overridable through `RUST_LOG`.
/// Calling this more than once is a no-op so tests can initialize freely.
pub fn initialize(env_filter: &str) {
    static ONCE: Once = Once::new();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env_filter));
    ONCE.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    });
}
