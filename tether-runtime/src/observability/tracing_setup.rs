//! Subscriber installation.

use super::config::{LogFormat, TracingConfig};
use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Keeps logging installed. Hold it for the life of the program.
#[derive(Debug)]
pub struct TracingGuard {
    format: LogFormat,
}

impl TracingGuard {
    /// Format that was installed.
    pub fn format(&self) -> LogFormat {
        self.format
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        tracing::debug!(format = ?self.format, "logging shut down");
    }
}

/// Install a global subscriber for `config`.
///
/// An invalid filter falls back to `info`. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_new(config.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format() {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target())
                    .with_thread_ids(config.include_thread_ids())
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target())
                    .with_thread_ids(config.include_thread_ids()),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target())
                    .with_thread_ids(config.include_thread_ids()),
            )
            .try_init(),
    }
    .context("failed to initialize tracing subscriber")?;

    Ok(TracingGuard {
        format: config.log_format(),
    })
}
