//! Integration tests for the signaling listener and connector

use std::sync::Arc;
use std::time::Duration;

use peerlink_proto::{IceCandidate, SignalMessage};
use peerlink_transport_websocket::{
    SignalingConfig, SignalingConnector, SignalingError, SignalingListener,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("peerlink_transport_websocket=debug")
        .with_test_writer()
        .try_init();
}

async fn bind(config: SignalingConfig) -> SignalingListener {
    SignalingListener::bind("127.0.0.1:0".parse().unwrap(), Arc::new(config))
        .await
        .expect("bind signaling listener")
}

#[tokio::test]
async fn test_exchange_messages() {
    init_tracing();
    let listener = bind(SignalingConfig::server_default().with_path("/signal")).await;
    let url = listener.url();
    assert!(url.ends_with("/signal"));

    let connector = SignalingConnector::new(Arc::new(SignalingConfig::client_default())).unwrap();
    let client = connector.connect(&url).await.unwrap();

    let (server, remote_addr) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote_addr.ip().to_string(), "127.0.0.1");

    let candidate = SignalMessage::Candidate {
        candidate: IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    };
    client.send(&candidate).await.unwrap();
    assert_eq!(server.recv().await.unwrap(), Some(candidate));

    let answer = SignalMessage::Answer {
        sdp: "v=0".to_string(),
    };
    server.send(&answer).await.unwrap();
    assert_eq!(client.recv().await.unwrap(), Some(answer));

    client.close().await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(5), server.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_wrong_path_is_rejected() {
    init_tracing();
    let listener = bind(SignalingConfig::server_default().with_path("/signal")).await;
    let url = format!("ws://{}/other", listener.local_addr());

    let connector = SignalingConnector::new(Arc::new(SignalingConfig::client_default())).unwrap();
    let err = connector.connect(&url).await.unwrap_err();

    assert!(matches!(err, SignalingError::UpgradeRejected { status: 404 }));
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_token_is_required() {
    init_tracing();
    let listener = bind(SignalingConfig::server_default().with_token("s3cret")).await;
    let url = listener.url();

    let anonymous = SignalingConnector::new(Arc::new(SignalingConfig::client_default())).unwrap();
    let err = anonymous.connect(&url).await.unwrap_err();
    assert!(matches!(err, SignalingError::UpgradeRejected { status: 401 }));

    let wrong = SignalingConnector::new(Arc::new(
        SignalingConfig::client_default().with_token("guess"),
    ))
    .unwrap();
    let err = wrong.connect(&url).await.unwrap_err();
    assert!(matches!(err, SignalingError::UpgradeRejected { status: 401 }));

    let authorized = SignalingConnector::new(Arc::new(
        SignalingConfig::client_default().with_token("s3cret"),
    ))
    .unwrap();
    let conn = authorized.connect(&url).await.unwrap();
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_connection_refused() {
    init_tracing();
    // Bind then drop to get a port nobody listens on
    let port = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    let connector = SignalingConnector::new(Arc::new(SignalingConfig::client_default())).unwrap();
    let err = connector
        .connect(&format!("ws://127.0.0.1:{}/", port))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::ConnectionError { .. }));
}

#[tokio::test]
async fn test_unsupported_scheme() {
    let connector = SignalingConnector::new(Arc::new(SignalingConfig::client_default())).unwrap();
    let err = connector.connect("http://127.0.0.1:1/").await.unwrap_err();
    assert!(matches!(err, SignalingError::ConfigurationError(_)));
}

#[tokio::test]
async fn test_secure_signaling() {
    init_tracing();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir().join(format!("peerlink-ws-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let listener = bind(SignalingConfig::server_tls(
        cert_path.to_str().unwrap(),
        key_path.to_str().unwrap(),
    ))
    .await;
    let url = listener.url();
    assert!(url.starts_with("wss://"));

    let connector = SignalingConnector::new(Arc::new(SignalingConfig::client_insecure())).unwrap();
    let client = connector.connect(&url).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();

    client
        .send(&SignalMessage::Error {
            message: "ping".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        server.recv().await.unwrap(),
        Some(SignalMessage::Error { .. })
    ));

    let verifying = SignalingConnector::new(Arc::new(
        SignalingConfig::client_default().with_root_cert(certified.cert.der().to_vec()),
    ))
    .unwrap();
    // The certificate names localhost, not the IP in the listener URL
    assert!(matches!(
        verifying.connect(&url).await,
        Err(SignalingError::TlsError(_))
    ));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_stalled_handshake_does_not_block_accept() {
    init_tracing();
    let listener = bind(SignalingConfig::server_default()).await;

    // Open a raw TCP connection and never send the upgrade request
    let _stalled = tokio::net::TcpStream::connect(listener.local_addr())
        .await
        .unwrap();

    let connector = SignalingConnector::new(Arc::new(SignalingConfig::client_default())).unwrap();
    let _client = connector.connect(&listener.url()).await.unwrap();

    let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
    assert!(matches!(accepted, Ok(Some(_))));
}

#[tokio::test]
async fn test_accept_after_close() {
    let listener = bind(SignalingConfig::server_default()).await;
    listener.close();
    assert!(listener.accept().await.is_none());
}
