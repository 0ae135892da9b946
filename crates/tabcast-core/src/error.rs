//! Error types for tabcast.
//!
//! Only `request()` callers ever see a failure at runtime. Malformed inbound
//! envelopes are dropped where they are parsed and never leave the receive loop.

use std::time::Duration;
use thiserror::Error;

/// Main error type for tabcast connections.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No response to {event} within {after:?}")]
    Timeout { event: String, after: Duration },

    #[error("Request {event} was cancelled because the connection stopped")]
    Cancelled { event: String },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for tabcast operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

impl From<serde_json::Error> for ConnectionError {
    fn from(err: serde_json::Error) -> Self {
        ConnectionError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ConnectionError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ConnectionError::MalformedMessage {
            reason: reason.into(),
        }
    }

    /// True when a request gave up waiting for its response.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectionError::Timeout { .. })
    }

    /// Check if this error should trigger a retry.
    ///
    /// A timeout may simply mean the responder was not up yet; everything
    /// else is either terminal or a caller bug.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectionError::Timeout {
            event: "connection.ping".into(),
            after: Duration::from_millis(500),
        };
        assert_eq!(err.to_string(), "No response to connection.ping within 500ms");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ConnectionError::Timeout {
            event: "app.compute".into(),
            after: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(!ConnectionError::Cancelled {
            event: "app.compute".into()
        }
        .is_retryable());
        assert!(!ConnectionError::malformed("no event").is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: ConnectionError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ConnectionError::Json { source: Some(_), .. }));
    }
}
