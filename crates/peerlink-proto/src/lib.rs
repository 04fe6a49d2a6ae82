//! Peerlink Protocol Definitions
//!
//! This crate defines the signaling messages exchanged over the websocket,
//! the per-stream open/accept frames carried on data channels, and the relay
//! server configuration shared by the dialer and the listener.

pub mod codec;
pub mod ice;
pub mod messages;

pub use codec::{CodecError, SignalCodec};
pub use ice::{IceProto, IceServer, IceTransportPolicy, IceUrl, IceUrlError, Scheme};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Label of the data channel used for liveness probes.
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Label of every data channel that carries one proxied connection.
pub const PROXY_CHANNEL_LABEL: &str = "proxy";

/// Sequence byte of a dialer's first ping. Later pings count up from it and
/// the listener echoes every control-channel byte back.
pub const PING_BYTE: u8 = 0x01;

/// Networks a dial request may name.
pub const SUPPORTED_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6"];

/// Default websocket path the listener serves signaling on.
pub const DEFAULT_SIGNALING_PATH: &str = "/";
