//! Tracing/logging initialization.
//!
//! Every job produces structured events (`job_id`, `image_url`, outcome);
//! the subscriber installed here decides whether they are rendered for a
//! terminal or as one JSON object per line for a log collector.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Initialize tracing/logging for the process.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `verbose`.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(verbose: bool, format: LogFormat) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
    };
}
