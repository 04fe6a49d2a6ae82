//! WebSocket signaling transport using tokio-tungstenite
//!
//! The dialer and the listener exchange session offers, answers and trickled
//! ICE candidates over one websocket per session. Every message is a JSON text
//! frame (see [`peerlink_proto::SignalCodec`]).
//!
//! # Features
//!
//! - **Encryption**: optional TLS via rustls (`wss://`)
//! - **Routing**: the listener only upgrades requests for its configured path
//! - **Access token**: an optional `?token=` query parameter checked at upgrade

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod tls;

pub use config::SignalingConfig;
pub use connection::SignalingConnection;
pub use error::{SignalingError, SignalingResult};
pub use listener::{SignalingConnector, SignalingListener};
