//! Logging utilities for the host and its worker processes
//!
//! Provides logging initialization that:
//! - Respects the RUST_LOG environment variable
//! - Allows a filter from the config file
//! - Gives worker processes their own default filter
//!
//! # Usage
//!
//! ## Host
//! ```rust,no_run
//! use shelf_host::utils::init_logging;
//!
//! init_logging(None); // Uses RUST_LOG or defaults to "info"
//! ```
//!
//! ## Worker process
//! ```rust,no_run
//! use shelf_host::utils::init_shelf_logging;
//!
//! init_shelf_logging("clock", None);
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Resolve the filter: RUST_LOG first, then the configured filter, then `fallback`
fn resolve_filter(filter: Option<&str>, fallback: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or(fallback))
}

/// Initialize logging for the host
///
/// # Arguments
/// * `filter` - Optional log filter from config (e.g. "info", "shelf_host::shelf=debug").
///              RUST_LOG takes precedence; with neither set the level is "info".
pub fn init_logging(filter: Option<&str>) {
    let env_filter = resolve_filter(filter, "info");

    // try_init: a second initialization (tests, embedded hosts) is not an error
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(env_filter)
        .try_init();
}

/// Initialize logging for a worker process
///
/// Workers log to stderr, which they share with the host, so every line
/// carries the service name as a span field. Without RUST_LOG or a filter the default is
/// "info" for everything and "debug" for the shelf runtime.
pub fn init_shelf_logging(service_name: &str, filter: Option<&str>) -> tracing::span::EnteredSpan {
    let env_filter = resolve_filter(filter, "info,shelf_host::shelf::worker=debug");

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(env_filter)
        .try_init();

    tracing::info_span!("shelf", service = %service_name).entered()
}

/// Initialize logging with JSON output (for log aggregation)
///
/// # Arguments
/// * `filter` - Optional log filter. If None, uses RUST_LOG or defaults to "info"
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    let env_filter = resolve_filter(filter, "info");

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(env_filter)
        .try_init();
}

/// Initialize logging from the `[logging]` section of the host config
///
/// Falls back to plain output when JSON is requested but the `json-logging`
/// feature is off.
pub fn init_logging_from_config(config: Option<&LoggingConfig>) {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.is_some_and(|c| c.json_format) {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            init_logging(filter);
        }
    } else {
        init_logging(filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_initialization_is_harmless() {
        init_logging(Some("warn"));
        init_logging_from_config(Some(&LoggingConfig {
            filter: Some("debug".to_string()),
            json_format: true,
        }));
    }
}
