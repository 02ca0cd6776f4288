//! Logging setup for hosts embedding the runtime.
//!
//! Output format is chosen with `TETHER_LOG_FORMAT`:
//! - `json` for log shippers
//! - `pretty` for terminals
//! - `compact` for everything else
//!
//! The filter comes from `TETHER_LOG_LEVEL`, falling back to `RUST_LOG`.
//!
//! ```no_run
//! use tether_runtime::observability::{init_tracing, LogFormat, TracingConfig};
//!
//! let config = TracingConfig::builder()
//!     .log_format(LogFormat::Json)
//!     .log_filter("info,tether_runtime=debug")
//!     .build();
//! let _guard = init_tracing(config)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod config;
mod tracing_setup;

pub use config::{LogFormat, TracingConfig, TracingConfigBuilder};
pub use tracing_setup::{init_tracing, TracingGuard};

/// Span covering one instantiation.
#[macro_export]
macro_rules! instrument_instantiation {
    ($module:expr) => {
        tracing::info_span!("instantiation", module = %$module)
    };
}

/// Span covering one call into a module export.
#[macro_export]
macro_rules! instrument_export {
    ($module:expr, $export:expr) => {
        tracing::debug_span!("export_call", module = %$module, export = %$export)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.log_filter(), "info");
        assert_eq!(config.log_format(), LogFormat::Compact);
        assert!(config.include_target());
    }

    #[test]
    fn builder_overrides() {
        let config = TracingConfig::builder()
            .log_format(LogFormat::Json)
            .log_filter("debug")
            .include_location(true)
            .build();

        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.log_filter(), "debug");
        assert!(config.include_location());
        assert!(!config.include_thread_ids());
    }

    #[test]
    fn format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("bogus".parse::<LogFormat>().unwrap(), LogFormat::Compact);
    }
}
