//! Transport connection state machine

use std::fmt;

use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Lifecycle of a peer transport.
///
/// `new → gathering → connecting → connected | failed | disconnected → closed`.
/// `disconnected` may return to `connected`; `failed` and `closed` are
/// terminal (a failed transport may still be marked closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Gathering,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;

        if self == next {
            return false;
        }

        match self {
            Closed => false,
            Failed => next == Closed,
            New => true,
            Gathering => next != New,
            Connecting => !matches!(next, New | Gathering),
            Connected => matches!(next, Disconnected | Failed | Closed),
            Disconnected => matches!(next, Connecting | Connected | Failed | Closed),
        }
    }

    /// Map the peer connection's aggregate state. `Unspecified` has no
    /// counterpart and is ignored.
    pub fn from_peer(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(TransportState::New),
            RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
            RTCPeerConnectionState::Connected => Some(TransportState::Connected),
            RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
            RTCPeerConnectionState::Failed => Some(TransportState::Failed),
            RTCPeerConnectionState::Closed => Some(TransportState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Gathering => "gathering",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
