//! Signaling errors

use peerlink_proto::CodecError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Signaling-level errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Connection error: failed to reach {address}: {source}")]
    ConnectionError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The server answered the upgrade request with a non-101 status.
    #[error("WebSocket upgrade rejected with HTTP status {status}")]
    UpgradeRejected { status: u16 },

    #[error("WebSocket error: {0}")]
    WebSocketError(Box<tungstenite::Error>),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Unexpected binary signaling frame ({0} bytes)")]
    UnexpectedBinary(usize),

    #[error("Signaling connection closed")]
    Closed,

    #[error("Signaling connection already closed")]
    AlreadyClosed,

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl SignalingError {
    /// True for failures at the socket level (reset, refused, bad upgrade),
    /// as opposed to protocol or configuration problems.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SignalingError::ConnectionError { .. }
                | SignalingError::UpgradeRejected { .. }
                | SignalingError::WebSocketError(_)
                | SignalingError::IoError(_)
                | SignalingError::TlsError(_)
        )
    }
}

impl From<tungstenite::Error> for SignalingError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => SignalingError::UpgradeRejected {
                status: response.status().as_u16(),
            },
            tungstenite::Error::Io(e) => SignalingError::IoError(e),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                SignalingError::Closed
            }
            other => SignalingError::WebSocketError(Box::new(other)),
        }
    }
}

/// Result type for signaling operations
pub type SignalingResult<T> = Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_status_is_preserved() {
        let mut response = tungstenite::http::Response::new(None);
        *response.status_mut() = tungstenite::http::StatusCode::NOT_FOUND;

        let err = SignalingError::from(tungstenite::Error::Http(response));
        assert!(matches!(err, SignalingError::UpgradeRejected { status: 404 }));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_closed_is_not_connection_error() {
        let err = SignalingError::from(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, SignalingError::Closed));
        assert!(!err.is_connection_error());
    }
}
