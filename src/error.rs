//! Error types for the transport engine.

use thiserror::Error;

use crate::protocol::MessageErrorType;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during stream operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing error (bad magic, size out of bounds, region over/underrun).
    #[error("Framing error: {0}")]
    Framing(String),

    /// Protocol error (unknown command, invalid capability bits, malformed handshake).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message exceeds the configured maximum size.
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge {
        /// Declared or computed size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A request did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A wait was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Remote identity did not match the expected one.
    #[error("Identity mismatch: {0}")]
    IdentityMismatch(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer answered with an error entry.
    #[error("Remote error {name} ({code}): {message}")]
    Remote {
        /// Wire error code.
        code: u16,
        /// Error name carried in the reply.
        name: String,
        /// Error description carried in the reply.
        message: String,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal invariant violation (e.g. encoded size mismatch).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether this error must tear the connection down.
    ///
    /// Request-level errors only resolve the waiting caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Cancelled
                | TransportError::IdentityMismatch(_)
                | TransportError::Remote { .. }
                | TransportError::Config(_)
        )
    }

    /// Wire error code used when this error is reported to the peer.
    pub fn error_code(&self) -> MessageErrorType {
        match self {
            TransportError::Io(_) => MessageErrorType::ConnectionError,
            TransportError::Json(_) | TransportError::Config(_) => {
                MessageErrorType::InvalidConfiguration
            }
            TransportError::Framing(_) | TransportError::Protocol(_) => {
                MessageErrorType::ProtocolError
            }
            TransportError::MessageTooLarge { .. } => MessageErrorType::BufferLimitViolation,
            TransportError::Timeout(_) => MessageErrorType::RequestTimeout,
            TransportError::Cancelled => MessageErrorType::OperationCancelled,
            TransportError::IdentityMismatch(_) => MessageErrorType::NodeNotFound,
            TransportError::ConnectionClosed => MessageErrorType::ConnectionError,
            TransportError::Remote { code, .. } => MessageErrorType::from_code(*code),
            TransportError::Internal(_) => MessageErrorType::InternalError,
        }
    }

    /// Shorthand for a framing error.
    pub(crate) fn framing(msg: impl Into<String>) -> Self {
        TransportError::Framing(msg.into())
    }

    /// Shorthand for a protocol error.
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TransportError::Protocol(msg.into())
    }
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_level_errors_are_not_fatal() {
        assert!(!TransportError::Timeout("x".into()).is_fatal());
        assert!(!TransportError::Cancelled.is_fatal());
        assert!(!TransportError::IdentityMismatch("x".into()).is_fatal());
    }

    #[test]
    fn test_framing_and_io_are_fatal() {
        assert!(TransportError::framing("bad magic").is_fatal());
        assert!(TransportError::ConnectionClosed.is_fatal());
        assert!(TransportError::MessageTooLarge { size: 10, max: 5 }.is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(TransportError::from(io).is_fatal());
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            TransportError::protocol("x").error_code(),
            MessageErrorType::ProtocolError
        );
        assert_eq!(
            TransportError::MessageTooLarge { size: 1, max: 0 }.error_code(),
            MessageErrorType::BufferLimitViolation
        );
    }
}
