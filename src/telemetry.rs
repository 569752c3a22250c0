//! Tracing setup for the binaries.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, prelude::*};

/// Install the global subscriber: formatted output filtered by `RUST_LOG`,
/// plus the span capture used by the error types.
///
/// Falls back to `info` when `RUST_LOG` is unset or invalid.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(ErrorLayer::default())
        .init();
}
