//! Crate-level error type and secret redaction for log output

use crate::config::ConfigError;
use crate::protocol::{DecodeError, FrameError};
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static BEARER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/]+=*").expect("bearer pattern is valid")
});

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passcode|token|key|secret)[=:]\s*\S+")
        .expect("secret pattern is valid")
});

/// Main error type for progress sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
}

impl SyncError {
    /// Display text with credentials masked, safe for logs
    pub fn redacted(&self) -> String {
        redact_secrets(&self.to_string())
    }
}

/// Mask bearer tokens and `key=value` secrets, and cap the length
pub fn redact_secrets(message: &str) -> String {
    let sanitized = BEARER_PATTERN.replace_all(message, "${1} ***");
    let mut sanitized = SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .into_owned();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for progress sync operations
pub type SyncResult<T> = Result<T, SyncError>;
