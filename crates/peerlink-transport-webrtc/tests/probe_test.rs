//! Probes against an in-process TURN server and scheme-mismatch fixtures

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use peerlink_proto::{IceServer, Scheme};
use peerlink_transport_webrtc::{probe_ice_server, NegotiationError, ProbeOptions};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use webrtc::turn::auth::{generate_auth_key, AuthHandler};
use webrtc::turn::relay::relay_static::RelayAddressGeneratorStatic;
use webrtc::turn::server::config::{ConnConfig, ServerConfig};
use webrtc::turn::server::Server;
use webrtc::util::vnet::net::Net;

const REALM: &str = "peerlink.test";
const USERNAME: &str = "user";
const PASSWORD: &str = "pass";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("peerlink_transport_webrtc=debug")
        .with_test_writer()
        .try_init();
}

struct StaticAuth;

impl AuthHandler for StaticAuth {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        _src_addr: SocketAddr,
    ) -> Result<Vec<u8>, webrtc::turn::Error> {
        if username != USERNAME {
            return Err(webrtc::turn::Error::ErrFakeErr);
        }
        Ok(generate_auth_key(username, realm, PASSWORD))
    }
}

async fn start_turn() -> (Server, SocketAddr) {
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
        realm: REALM.to_string(),
        auth_handler: Arc::new(StaticAuth),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await
    .unwrap();

    (server, addr)
}

fn options() -> ProbeOptions {
    ProbeOptions::default()
        .with_timeout(Duration::from_secs(3))
        .with_insecure_skip_verify()
}

#[tokio::test]
async fn test_turn_allocation_succeeds() {
    init_tracing();
    let (server, addr) = start_turn().await;

    let ice = IceServer::new(format!("turn:{}", addr)).with_credentials(USERNAME, PASSWORD);
    let reports = probe_ice_server(&ice, &options()).await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].url.scheme, Scheme::Turn);
    assert!(reports[0].mapped_address.is_some());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_stun_binding() {
    init_tracing();
    let (server, addr) = start_turn().await;

    let ice = IceServer::new(format!("stun:{}", addr));
    let reports = probe_ice_server(&ice, &options()).await.unwrap();

    let mapped = reports[0].mapped_address.unwrap();
    assert_eq!(mapped.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_invalid_credentials() {
    init_tracing();
    let (server, addr) = start_turn().await;

    let ice = IceServer::new(format!("turn:{}", addr)).with_credentials(USERNAME, "wrong");
    let err = probe_ice_server(&ice, &options()).await.unwrap_err();
    assert!(
        matches!(err, NegotiationError::InvalidCredentials { .. }),
        "unexpected error: {:?}",
        err
    );
    assert!(err.is_configuration_error());

    let ice = IceServer::new(format!("turn:{}", addr)).with_credentials("nobody", PASSWORD);
    let err = probe_ice_server(&ice, &options()).await.unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidCredentials { .. }));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_silent_server_times_out() {
    init_tracing();
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let ice = IceServer::new(format!("turn:{}", addr)).with_credentials(USERNAME, PASSWORD);
    let options = options().with_timeout(Duration::from_millis(600));
    let err = probe_ice_server(&ice, &options).await.unwrap_err();
    assert!(matches!(err, NegotiationError::Timeout { .. }));
    assert!(!err.is_configuration_error());
}

#[tokio::test]
async fn test_refused_tcp_is_unreachable() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ice = IceServer::new(format!("turn:{}?transport=tcp", addr))
        .with_credentials(USERNAME, PASSWORD);
    let err = probe_ice_server(&ice, &options()).await.unwrap_err();
    assert!(matches!(err, NegotiationError::Unreachable { .. }));
}

#[tokio::test]
async fn test_turns_against_plain_server() {
    init_tracing();
    // Plain TCP TURN stand-in: reads the ClientHello, finds no STUN header, hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).await;
        }
    });

    let ice = IceServer::new(format!("turns:{}", addr)).with_credentials(USERNAME, PASSWORD);
    let err = probe_ice_server(&ice, &options()).await.unwrap_err();
    match err {
        NegotiationError::MismatchedScheme {
            configured,
            detected,
            ..
        } => {
            assert_eq!(configured, Scheme::Turns);
            assert_eq!(detected, Scheme::Turn);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

/// TLS-only listener standing in for a TURNS server
async fn start_tls_server() -> SocketAddr {
    peerlink_transport_websocket::tls::ensure_crypto_provider();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let _ = acceptor.accept(socket).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_turn_against_tls_server() {
    init_tracing();
    let addr = start_tls_server().await;

    let ice = IceServer::new(format!("turn:{}?transport=tcp", addr))
        .with_credentials(USERNAME, PASSWORD);
    let err = probe_ice_server(&ice, &options()).await.unwrap_err();
    match err {
        NegotiationError::MismatchedScheme {
            configured,
            detected,
            ..
        } => {
            assert_eq!(configured, Scheme::Turn);
            assert_eq!(detected, Scheme::Turns);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_turn_udp_default_against_tls_server() {
    init_tracing();
    let addr = start_tls_server().await;

    // No transport given, so the first attempt goes over UDP
    let ice = IceServer::new(format!("turn:{}", addr)).with_credentials(USERNAME, PASSWORD);
    let err = probe_ice_server(&ice, &options()).await.unwrap_err();
    assert!(err.is_configuration_error(), "unexpected error: {:?}", err);
    match err {
        NegotiationError::MismatchedScheme {
            configured,
            detected,
            ..
        } => {
            assert_eq!(configured, Scheme::Turn);
            assert_eq!(detected, Scheme::Turns);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
