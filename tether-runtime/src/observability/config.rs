//! Logging configuration.

use std::env;
use std::str::FromStr;
use tether_core::config::env_parse;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line, colored.
    Pretty,
    /// Single line per event.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    log_format: LogFormat,
    /// Filter directives, e.g. `info,tether_runtime=trace`.
    log_filter: String,
    include_location: bool,
    include_target: bool,
    include_thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info".to_string(),
            include_location: false,
            include_target: true,
            include_thread_ids: false,
        }
    }
}

impl TracingConfig {
    /// Create a new builder.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }

    /// Read configuration from `TETHER_LOG_FORMAT`, `TETHER_LOG_LEVEL` (or
    /// `RUST_LOG`), `TETHER_LOG_LOCATION` and `TETHER_LOG_THREAD_IDS`.
    ///
    /// Without an explicit format, terminals get `pretty` and everything
    /// else `json`.
    pub fn from_env() -> Self {
        let log_format = env::var("TETHER_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse::<LogFormat>().ok())
            .unwrap_or_else(|| {
                if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
                    LogFormat::Pretty
                } else {
                    LogFormat::Json
                }
            });

        let log_filter = env::var("TETHER_LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());

        Self {
            log_format,
            log_filter,
            include_location: env_parse("TETHER_LOG_LOCATION").unwrap_or(false),
            include_target: true,
            include_thread_ids: env_parse("TETHER_LOG_THREAD_IDS").unwrap_or(false),
        }
    }

    /// Output format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Filter directives.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Whether events carry file and line.
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /// Whether events carry their target.
    pub fn include_target(&self) -> bool {
        self.include_target
    }

    /// Whether events carry thread ids.
    pub fn include_thread_ids(&self) -> bool {
        self.include_thread_ids
    }
}

/// Builder for [`TracingConfig`].
#[derive(Debug, Clone, Default)]
pub struct TracingConfigBuilder {
    config: TracingConfig,
}

impl TracingConfigBuilder {
    /// Set the output format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = format;
        self
    }

    /// Set the filter directives.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.log_filter = filter.into();
        self
    }

    /// Include file and line in events.
    pub fn include_location(mut self, include: bool) -> Self {
        self.config.include_location = include;
        self
    }

    /// Include the event target.
    pub fn include_target(mut self, include: bool) -> Self {
        self.config.include_target = include;
        self
    }

    /// Include thread ids.
    pub fn include_thread_ids(mut self, include: bool) -> Self {
        self.config.include_thread_ids = include;
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> TracingConfig {
        self.config
    }
}
