//! Errors returned by the dialer and listener

use std::fmt;
use std::io;
use std::time::Duration;

use peerlink_proto::{CodecError, DialFailure, ErrorCode};
use peerlink_transport_webrtc::{NegotiationError, TransportError};
use peerlink_transport_websocket::SignalingError;
use thiserror::Error;

/// A failed network operation on the listener side, shaped like a local
/// `dial tcp 127.0.0.1:80: connection refused`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub op: String,
    pub network: String,
    pub address: String,
    pub code: ErrorCode,
    pub message: String,
}

impl OpError {
    /// The `io::ErrorKind` a local connect would have returned
    pub fn kind(&self) -> io::ErrorKind {
        self.code.into()
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}",
            self.op, self.network, self.address, self.message
        )
    }
}

impl std::error::Error for OpError {}

impl From<DialFailure> for OpError {
    fn from(failure: DialFailure) -> Self {
        Self {
            op: failure.op,
            network: failure.network,
            address: failure.address,
            code: failure.code,
            message: failure.message,
        }
    }
}

/// Errors from [`crate::Dialer`]
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Negotiation error: {0}")]
    Negotiation(NegotiationError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("{0}")]
    Destination(OpError),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// The dialer was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport went away underneath the operation
    #[error("Unexpected end of stream")]
    Eof,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DialError {
    /// Deadline-class errors; retrying with a fresh dialer may succeed
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout(_) | DialError::Cancelled)
    }

    /// The dialer or its transport is gone
    pub fn is_closed(&self) -> bool {
        matches!(self, DialError::ConnectionClosed | DialError::Eof)
    }

    /// Errors that need a configuration change, not a retry
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, DialError::Negotiation(e) if e.is_configuration_error())
    }
}

impl From<TransportError> for DialError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Negotiation(e) => DialError::Negotiation(e),
            other => DialError::Transport(other),
        }
    }
}

impl From<NegotiationError> for DialError {
    fn from(err: NegotiationError) -> Self {
        DialError::Negotiation(err)
    }
}

impl From<CodecError> for DialError {
    fn from(err: CodecError) -> Self {
        DialError::Protocol(err.to_string())
    }
}

/// Result type for dialer operations
pub type DialResult<T> = Result<T, DialError>;

/// Errors from [`crate::Listener`]
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Listener closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_error_from_failure() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        let failure = DialFailure::from_io("dial", "tcp", "127.0.0.1:1", &err);
        let op: OpError = failure.into();

        assert_eq!(op.kind(), io::ErrorKind::ConnectionRefused);
        assert!(op.to_string().starts_with("dial tcp 127.0.0.1:1: "));
    }

    #[test]
    fn test_classification() {
        assert!(DialError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(DialError::Cancelled.is_timeout());
        assert!(DialError::Eof.is_closed());
        assert!(DialError::ConnectionClosed.is_closed());
        assert!(!DialError::Protocol("bad".to_string()).is_closed());

        let creds = DialError::from(TransportError::Negotiation(
            NegotiationError::InvalidCredentials {
                url: "turn:127.0.0.1:3478".to_string(),
                code: 401,
            },
        ));
        assert!(matches!(creds, DialError::Negotiation(_)));
        assert!(creds.is_configuration_error());
    }
}
