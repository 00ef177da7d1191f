//! Tracing subscriber setup.
//!
//! Filtering follows `RUST_LOG` and defaults to `info`. JSON output is meant
//! for log shippers; pretty output for terminals.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Install the global subscriber.
///
/// Safe to call more than once; later calls are no-ops, which keeps tests
/// that build several gateways quiet.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
    };

    if result.is_ok() {
        tracing::debug!(?format, "Tracing initialized");
    }
}
