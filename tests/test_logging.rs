//! Tests for logging configuration and format parsing
//!
//! Covers the pure parsing helpers behind `init_default_logging` and the
//! span macros used around broker connections and subscriptions.

use crawlsync::observability::logging::{
    build_filter, init_logging, parse_level, parse_spans_flag, LogFormat,
};
use tracing::Level;

#[test]
fn test_log_format_parse_known_formats() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Invalid formats default to JSON for production safety
    for input in ["invalid", "", "xml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input:?}");
    }
}

#[test]
fn test_log_format_parse_whitespace() {
    assert_eq!(LogFormat::parse("  pretty  "), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("compact\n"), LogFormat::Compact);
    assert_eq!(LogFormat::parse("\tjson"), LogFormat::Json);
}

#[test]
fn test_log_level_parsing() {
    let test_cases = [
        ("ERROR", Level::ERROR),
        ("warn", Level::WARN),
        ("Info", Level::INFO),
        ("DEBUG", Level::DEBUG),
        (" trace ", Level::TRACE),
        ("", Level::INFO),
        ("verbose", Level::INFO),
    ];

    for (input, expected) in test_cases {
        assert_eq!(parse_level(input), expected, "input: {input:?}");
    }
}

#[test]
fn test_log_spans_parsing() {
    let test_cases = [
        ("true", true),
        ("TRUE", true),
        (" True ", true),
        ("false", false),
        ("", false),
        ("yes", false),
        ("1", false),
    ];

    for (input, expected) in test_cases {
        assert_eq!(parse_spans_flag(input), expected, "input: {input:?}");
    }
}

#[test]
fn test_filter_quiets_transport_dependencies() {
    let rendered = build_filter(Level::DEBUG).to_string().to_lowercase();
    assert!(rendered.contains("debug"));
    assert!(rendered.contains("tokio_tungstenite=warn"));
    assert!(rendered.contains("rustls=warn"));
}

#[test]
fn test_init_logging_is_idempotent() {
    init_logging(Level::INFO, LogFormat::Compact, false);
    init_logging(Level::DEBUG, LogFormat::Json, true);

    let span = crawlsync::connection_span!(url = "ws://localhost/ws", attempt = 1);
    let _guard = span.enter();
    tracing::info!("logging still works after repeated init");
}
