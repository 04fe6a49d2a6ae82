//! Peerlink library - dial TCP endpoints inside a remote network over a
//! peer-to-peer transport
//!
//! A [`Listener`] runs next to the destinations. It accepts websocket
//! signaling sessions and negotiates one peer transport per session (direct,
//! or relayed through TURN). A [`Dialer`] connects to a listener and opens
//! proxied TCP connections through that transport.
//!
//! # Quick Start - Listener
//!
//! ```ignore
//! use peerlink_lib::{Listener, ListenerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = Listener::bind(
//!         ListenerConfig::new("0.0.0.0:8443".parse()?).with_token("secret"),
//!     )
//!     .await?;
//!     println!("Signaling URL: {}", listener.url());
//!
//!     tokio::signal::ctrl_c().await?;
//!     listener.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Quick Start - Dialer
//!
//! ```ignore
//! use peerlink_lib::{DialOptions, Dialer, IceServer};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = DialOptions::default().with_ice_server(
//!     IceServer::new("turn:turn.example.com:3478").with_credentials("user", "pass"),
//! );
//! let dialer = Dialer::connect("ws://agent.example.com:8443/?token=secret", options).await?;
//!
//! let mut conn = dialer.dial("tcp", "127.0.0.1:5432").await?;
//! conn.write_all(b"ping").await?;
//!
//! dialer.ping().await?;
//! dialer.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod dialer;
pub mod error;
pub mod forwarder;
pub mod listener;
pub mod tracker;

pub use dialer::{DialOptions, DialedStream, Dialer};
pub use error::{DialError, DialResult, ListenError, OpError};
pub use forwarder::{ForwarderError, TcpForwarder};
pub use listener::{Listener, ListenerConfig};
pub use tracker::SessionTracker;

// Re-export the layers a caller configures directly
pub use peerlink_proto::{ErrorCode, IceServer, IceTransportPolicy, Scheme};
pub use peerlink_transport_webrtc::{
    probe_ice_server, NegotiationError, ProbeOptions, ProbeReport, RtcConfig, TransportError,
    TransportState,
};
pub use peerlink_transport_websocket::{SignalingConfig, SignalingError};
