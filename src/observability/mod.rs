//! Observability for the progress sync client
//!
//! Structured logging through `tracing`, with span macros for connection
//! attempts and subscription bookkeeping.

pub mod logging;

// Re-export for convenience
pub use logging::{LogFormat, init_default_logging, init_logging};

// Span macros for structured logging
pub use logging::{connection_span, subscription_span};
