//! Structured logging system using tracing crate
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Examples
//!
//! ```bash
//! # Follow a crawl in a terminal
//! LOG_FORMAT=compact LOG_LEVEL=INFO crawlsync watch --job 7
//!
//! # Trace frame traffic
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG LOG_SPANS=true crawlsync watch
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Dependencies that are too chatty at our default level
const QUIET_DEPENDENCIES: [&str; 4] = ["tokio_tungstenite", "tungstenite", "rustls", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string; anything unknown is JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; anything unknown is INFO
pub fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Only an explicit "true" enables span events
pub fn parse_spans_flag(s: &str) -> bool {
    s.trim().eq_ignore_ascii_case("true")
}

/// Filter for `level` with noisy dependencies held at WARN
pub fn build_filter(level: Level) -> EnvFilter {
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|dep| format!("{dep}=warn")));
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration. A second call is a no-op.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    // Allow RUST_LOG to override
    let filter = env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| EnvFilter::try_new(rust_log).ok())
        .unwrap_or_else(|| build_filter(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events(include_spans)))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = parse_spans_flag(&env::var("LOG_SPANS").unwrap_or_default());

    init_logging(level, format, include_spans);
}

/// Create a span around one broker connection attempt
#[macro_export]
macro_rules! connection_span {
    ($($field:tt)*) => {
        tracing::info_span!("broker_connection", $($field)*)
    };
}

/// Create a span around subscription bookkeeping for one destination
#[macro_export]
macro_rules! subscription_span {
    ($($field:tt)*) => {
        tracing::info_span!("subscription", $($field)*)
    };
}

// Re-export macros for convenience
pub use {connection_span, subscription_span};
