//! Shared fixtures: fast-failing transport settings, an in-process TURN
//! server and small TCP destinations

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use peerlink_lib::{DialOptions, IceServer, Listener, ListenerConfig, RtcConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use webrtc::turn::auth::{generate_auth_key, AuthHandler};
use webrtc::turn::relay::relay_static::RelayAddressGeneratorStatic;
use webrtc::turn::server::config::{ConnConfig, ServerConfig};
use webrtc::turn::server::Server;
use webrtc::util::vnet::net::Net;

pub const TURN_REALM: &str = "peerlink.test";
pub const TURN_USER: &str = "user";
pub const TURN_PASSWORD: &str = "pass";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("peerlink_lib=debug,peerlink_transport_webrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Loopback candidates and short ICE timeouts so failures surface quickly
pub fn fast_rtc() -> RtcConfig {
    RtcConfig::default().with_loopback(true).with_ice_timeouts(
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_millis(500),
    )
}

pub async fn start_listener() -> Listener {
    let config = ListenerConfig::default()
        .with_path("/signal")
        .with_rtc_config(fast_rtc())
        .with_connect_timeout(Duration::from_secs(2))
        .with_teardown_timeout(Duration::from_secs(2));
    Listener::bind(config).await.expect("bind listener")
}

pub fn dial_options() -> DialOptions {
    DialOptions::default()
        .with_rtc_config(fast_rtc())
        .with_handshake_timeout(Duration::from_secs(15))
        .with_dial_timeout(Duration::from_secs(5))
}

struct StaticAuth;

impl AuthHandler for StaticAuth {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        _src_addr: SocketAddr,
    ) -> Result<Vec<u8>, webrtc::turn::Error> {
        if username != TURN_USER {
            return Err(webrtc::turn::Error::ErrFakeErr);
        }
        Ok(generate_auth_key(username, realm, TURN_PASSWORD))
    }
}

/// TURN over UDP on 127.0.0.1, relaying on 127.0.0.1
pub async fn start_turn() -> (Server, SocketAddr) {
    let conn = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = conn.local_addr().unwrap();

    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn,
            relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                address: "127.0.0.1".to_string(),
                net: Arc::new(Net::new(None)),
            }),
        }],
        realm: TURN_REALM.to_string(),
        auth_handler: Arc::new(StaticAuth),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await
    .unwrap();

    (server, addr)
}

pub fn turn_server(addr: SocketAddr, password: &str) -> IceServer {
    IceServer::new(format!("turn:{}", addr)).with_credentials(TURN_USER, password)
}

/// Writes `message` to every connection, then closes it
pub async fn message_server(message: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.write_all(message).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Echoes every connection until the peer closes
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A port nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
