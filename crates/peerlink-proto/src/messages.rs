//! Protocol message types

use std::io;

use serde::{Deserialize, Serialize};

use crate::ice::{IceServer, IceTransportPolicy};

/// Messages exchanged over the signaling websocket.
///
/// The dialer sends `Offer` first; afterwards both sides trickle `Candidate`
/// messages until the peer transport is up. `Error` is sent by the listener
/// when it rejects a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer {
        client: ClientInfo,
        sdp: String,
        #[serde(default)]
        servers: Vec<IceServer>,
        #[serde(default)]
        policy: IceTransportPolicy,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: IceCandidate,
    },
    Error {
        message: String,
    },
}

impl SignalMessage {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Error { .. } => "error",
        }
    }
}

/// Trickled ICE candidate, as serialized by the peer connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Identity sent with the offer so the listener can label the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
    pub hostname: String,
    pub platform: String, // e.g., "linux", "macos", "windows"
    pub version: String,
}

impl ClientInfo {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// First frame on a proxy channel: where the listener should connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialRequest {
    pub network: String,
    pub address: String,
}

/// Listener's acknowledgment of a [`DialRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DialFailure>,
}

impl DialResponse {
    pub fn accepted() -> Self {
        Self { error: None }
    }

    pub fn failed(failure: DialFailure) -> Self {
        Self {
            error: Some(failure),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }
}

/// Structured description of a failed destination connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialFailure {
    pub op: String,
    pub network: String,
    pub address: String,
    pub code: ErrorCode,
    pub message: String,
}

impl DialFailure {
    pub fn from_io(op: &str, network: &str, address: &str, err: &io::Error) -> Self {
        Self {
            op: op.to_string(),
            network: network.to_string(),
            address: address.to_string(),
            code: ErrorCode::from(err.kind()),
            message: err.to_string(),
        }
    }
}

/// Transport-independent error classes for destination failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ConnectionRefused,
    ConnectionReset,
    TimedOut,
    AddrNotAvailable,
    HostNotFound,
    InvalidAddress,
    UnsupportedNetwork,
    Other,
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                ErrorCode::ConnectionReset
            }
            io::ErrorKind::TimedOut => ErrorCode::TimedOut,
            io::ErrorKind::AddrNotAvailable => ErrorCode::AddrNotAvailable,
            io::ErrorKind::NotFound => ErrorCode::HostNotFound,
            io::ErrorKind::InvalidInput => ErrorCode::InvalidAddress,
            io::ErrorKind::Unsupported => ErrorCode::UnsupportedNetwork,
            _ => ErrorCode::Other,
        }
    }
}

impl From<ErrorCode> for io::ErrorKind {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            ErrorCode::ConnectionReset => io::ErrorKind::ConnectionReset,
            ErrorCode::TimedOut => io::ErrorKind::TimedOut,
            ErrorCode::AddrNotAvailable => io::ErrorKind::AddrNotAvailable,
            ErrorCode::HostNotFound => io::ErrorKind::NotFound,
            ErrorCode::InvalidAddress => io::ErrorKind::InvalidInput,
            ErrorCode::UnsupportedNetwork => io::ErrorKind::Unsupported,
            ErrorCode::Other => io::ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_serialization() {
        let msg = SignalMessage::Offer {
            client: ClientInfo::with_id("abc"),
            sdp: "v=0".to_string(),
            servers: vec![IceServer::new("turn:127.0.0.1:3478").with_credentials("u", "p")],
            policy: IceTransportPolicy::Relay,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"policy\":\"relay\""));

        let decoded: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_offer_defaults_servers_and_policy() {
        let json = r#"{"type":"offer","client":{"id":"x","hostname":"h","platform":"linux","version":"0.1.0"},"sdp":"v=0"}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();

        if let SignalMessage::Offer {
            servers, policy, ..
        } = msg
        {
            assert!(servers.is_empty());
            assert_eq!(policy, IceTransportPolicy::All);
        } else {
            panic!("Expected Offer message");
        }
    }

    #[test]
    fn test_candidate_omits_empty_fields() {
        let msg = SignalMessage::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".to_string(),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("sdp_mid"));
        assert_eq!(msg.kind(), "candidate");
    }

    #[test]
    fn test_dial_response_failure() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let response = DialResponse::failed(DialFailure::from_io("dial", "tcp", "127.0.0.1:1", &err));

        assert!(!response.is_accepted());
        let json = serde_json::to_string(&response).unwrap();
        let decoded: DialResponse = serde_json::from_str(&json).unwrap();
        let failure = decoded.error.unwrap();
        assert_eq!(failure.code, ErrorCode::ConnectionRefused);
        assert_eq!(failure.address, "127.0.0.1:1");
    }

    #[test]
    fn test_accepted_response_is_empty_object() {
        let json = serde_json::to_string(&DialResponse::accepted()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_error_code_maps_back_to_io_kind() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut,
            io::ErrorKind::AddrNotAvailable,
            io::ErrorKind::InvalidInput,
        ] {
            let code = ErrorCode::from(kind);
            assert_eq!(io::ErrorKind::from(code), kind);
        }
        assert_eq!(
            ErrorCode::from(io::ErrorKind::PermissionDenied),
            ErrorCode::Other
        );
    }

    #[test]
    fn test_client_info_default() {
        let info = ClientInfo::default();
        assert!(!info.id.is_empty());
        assert_eq!(info.platform, std::env::consts::OS);
    }
}
