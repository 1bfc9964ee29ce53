//! Client error types.

use tds5_protocol::{ProtocolError, ServerMessage};
use thiserror::Error;

use crate::state::ConnectionState;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Type conversion error.
    #[error("type error: {0}")]
    Type(#[from] tds5_types::TypeError),

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error severity.
        severity: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Server name where error occurred.
        server: Option<String>,
        /// Stored procedure name (if applicable).
        procedure: Option<String>,
        /// Line number in the SQL batch or procedure.
        line: u16,
    },

    /// Login was rejected or not acknowledged.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Operation not allowed in the current connection state.
    #[error("invalid state: expected {expected}, found {actual:?}")]
    InvalidState {
        /// States in which the operation is allowed.
        expected: &'static str,
        /// Current state.
        actual: ConnectionState,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid identifier (potential SQL injection attempt).
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed => Self::ConnectionClosed,
            ProtocolError::Type(e) => Self::Type(e),
            other => Self::Protocol(other),
        }
    }
}

impl From<&ServerMessage> for Error {
    fn from(msg: &ServerMessage) -> Self {
        Self::Server {
            number: msg.number,
            severity: msg.severity,
            state: msg.state,
            message: msg.message.clone(),
            server: msg.server.clone(),
            procedure: msg.procedure.clone(),
            line: msg.line,
        }
    }
}

impl Error {
    /// Check if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }

    /// Check if this error indicates a protocol/driver bug.
    ///
    /// Protocol errors typically indicate a bug in the driver implementation
    /// or a server speaking something other than TDS 5.0.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Check if this error leaves the connection unusable.
    ///
    /// Server errors, type errors and state errors do not. Neither does a
    /// request too large to encode, since it is rejected before any byte is
    /// sent. Anything that desynchronises the byte stream does.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(ProtocolError::TokenTooLarge { .. }) => false,
            Self::Protocol(_) | Self::ConnectionClosed | Self::Io(_) | Self::Connection(_) => true,
            _ => false,
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }

    /// Get the error severity if this is a server error.
    ///
    /// Severities of 10 and below are informational; 11 to 16 are user
    /// errors; 17 and above are resource or system errors.
    #[must_use]
    pub fn severity(&self) -> Option<u8> {
        match self {
            Self::Server { severity, .. } => Some(*severity),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_closed_is_mapped() {
        let err: Error = ProtocolError::ConnectionClosed.into();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(err.is_fatal());
        assert!(err.is_transient());
    }

    #[test]
    fn test_type_error_is_unwrapped() {
        let err: Error = ProtocolError::Type(tds5_types::TypeError::UnexpectedNull).into();
        assert!(matches!(err, Error::Type(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_server_error_from_message() {
        let msg = ServerMessage::new(208, 16, "Invalid object name 'nope'.").with_server("ASE");
        let err = Error::from(&msg);
        assert!(err.is_server_error(208));
        assert_eq!(err.severity(), Some(16));
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "server error 208: Invalid object name 'nope'.");
    }

    #[test]
    fn test_protocol_error_is_fatal() {
        let err: Error = ProtocolError::UnknownToken(0x01).into();
        assert!(err.is_protocol_error());
        assert!(err.is_fatal());
        assert_eq!(err.severity(), None);
    }

    #[test]
    fn test_oversized_request_is_not_fatal() {
        let err: Error = ProtocolError::TokenTooLarge {
            token_type: tds5_protocol::TokenType::ParamFmt,
            length: 70_000,
        }
        .into();
        assert!(err.is_protocol_error());
        assert!(!err.is_fatal());
    }
}
