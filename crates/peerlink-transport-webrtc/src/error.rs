//! Transport and negotiation errors

use peerlink_proto::{CodecError, Scheme};
use thiserror::Error;

/// Why ICE/SDP negotiation with the configured servers failed
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A relay server rejected the supplied username/credential
    #[error("Invalid credentials for {url} (STUN error {code})")]
    InvalidCredentials { url: String, code: u16 },

    /// The server speaks the other variant of the configured scheme
    #[error("Mismatched scheme for {url}: configured {configured}, server expects {detected}")]
    MismatchedScheme {
        url: String,
        configured: Scheme,
        detected: Scheme,
    },

    #[error("ICE server {url} unreachable: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {url} failed: {source}")]
    Tls {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ICE server {url} did not answer in time")]
    Timeout { url: String },

    #[error("ICE server {url} returned STUN error {code}: {reason}")]
    ServerError {
        url: String,
        code: u16,
        reason: String,
    },

    #[error("STUN error: {0}")]
    Stun(#[from] webrtc::stun::Error),

    #[error("Negotiation failed: {0}")]
    Failed(String),
}

impl NegotiationError {
    /// Configuration-class failures that retrying cannot fix
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            NegotiationError::InvalidCredentials { .. } | NegotiationError::MismatchedScheme { .. }
        )
    }
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("WebRTC error: {0}")]
    RtcError(#[from] webrtc::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Transport closed")]
    Closed,

    #[error("Data channel {label} closed")]
    ChannelClosed { label: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_class() {
        let creds = NegotiationError::InvalidCredentials {
            url: "turn:127.0.0.1:3478".to_string(),
            code: 401,
        };
        assert!(creds.is_configuration_error());

        let mismatch = NegotiationError::MismatchedScheme {
            url: "turns:127.0.0.1:3478".to_string(),
            configured: Scheme::Turns,
            detected: Scheme::Turn,
        };
        assert!(mismatch.is_configuration_error());
        assert!(mismatch.to_string().contains("configured turns"));

        let timeout = NegotiationError::Timeout {
            url: "turn:127.0.0.1:3478".to_string(),
        };
        assert!(!timeout.is_configuration_error());
    }

    #[test]
    fn test_negotiation_error_converts() {
        let err: TransportError = NegotiationError::Failed("ice failed".to_string()).into();
        assert!(matches!(err, TransportError::Negotiation(_)));
    }
}
