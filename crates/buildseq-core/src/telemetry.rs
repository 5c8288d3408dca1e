//! Tracing initialisation for the `buildseq` binary.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored; the
//! global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "BUILDSEQ_LOG";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// Newline-delimited JSON, for log aggregation.
    Json,
}

/// Initialise the global tracing subscriber.
///
/// The filter comes from `BUILDSEQ_LOG`, then `RUST_LOG`, then `level`.
/// Logs go to stderr so stdout stays free for reports.
pub fn init_tracing(format: LogFormat, level: Level) {
    let filter = filter_from_env(level);
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok(),
    };
}

fn filter_from_env(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
