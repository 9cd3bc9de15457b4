//! Shared observability bootstrap for the router and post-auction binaries.

pub mod metrics;
pub mod tracing;
