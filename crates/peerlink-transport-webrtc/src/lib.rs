//! Peer transport for the tunnel, built on webrtc-rs
//!
//! A [`PeerTransport`] wraps one ICE/SCTP peer connection. Logical streams are
//! data channels: one `control` channel for liveness probes and one `proxy`
//! channel per tunneled TCP connection. The [`StreamRegistry`] owned by the
//! transport tracks every open channel so that a transport failure reaches all
//! of them exactly once.
//!
//! Negotiation failures are classified into [`NegotiationError`] variants;
//! [`probe::probe_ice_server`] checks a single STUN/TURN server directly to
//! tell bad credentials apart from a `turn:`/`turns:` mix-up.

pub mod config;
pub mod error;
pub mod peer;
pub mod probe;
pub mod registry;
pub mod state;
pub mod stream;

pub use config::RtcConfig;
pub use error::{NegotiationError, TransportError, TransportResult};
pub use peer::PeerTransport;
pub use probe::{probe_ice_server, ProbeOptions, ProbeReport};
pub use registry::{StreamId, StreamKind, StreamRegistry};
pub use state::TransportState;
pub use stream::DataChannelStream;
