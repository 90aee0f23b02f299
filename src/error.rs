//! Error types for the hub client
//!
//! Connection, timeout and protocol failures are returned as [`HubError`].
//! Application failures reported by a remote handler are data: they travel
//! in `ResponseMessage::error` and only become [`HubError::Application`] when
//! a caller asks to decode the output.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for hub client operations
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Application error: {0}")]
    Application(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl HubError {
    pub fn connection_failed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed(message.into())
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn connection_closed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionClosed(message.into())
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn timeout<S: Into<String>>(correlation_id: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            correlation_id: correlation_id.into(),
            timeout_ms,
        }
    }

    /// Connection-family errors leave the connection unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            HubError::ConnectionFailed(_)
                | HubError::Unauthorized(_)
                | HubError::NotConnected
                | HubError::ConnectionClosed(_)
        )
    }

    /// Text suitable for a failure response sent to a remote peer
    pub fn to_response_error(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_ERROR_LEN: usize = 500;

/// Redact credentials and sensitive paths from error text and cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(re) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    if sanitized.len() > MAX_ERROR_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for hub client operations
pub type HubResult<T> = Result<T, HubError>;
