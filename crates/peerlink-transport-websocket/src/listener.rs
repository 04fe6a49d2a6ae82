//! Signaling listener and connector implementations

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SignalingConfig;
use crate::connection::SignalingConnection;
use crate::error::{SignalingError, SignalingResult};

/// Server socket accepting signaling sessions
///
/// Handshakes (TLS + websocket upgrade) run in their own tasks, so a peer that
/// stalls mid-handshake never blocks other sessions from being accepted.
pub struct SignalingListener {
    local_addr: SocketAddr,
    accepted: Mutex<mpsc::Receiver<(SignalingConnection, SocketAddr)>>,
    shutdown: CancellationToken,
    config: Arc<SignalingConfig>,
}

impl std::fmt::Debug for SignalingListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingListener")
            .field("local_addr", &self.local_addr)
            .field("path", &self.config.path)
            .finish()
    }
}

impl SignalingListener {
    pub async fn bind(
        bind_addr: SocketAddr,
        config: Arc<SignalingConfig>,
    ) -> SignalingResult<Self> {
        config.validate()?;

        let tls_acceptor = config.build_tls_acceptor()?;

        // Create TCP listener synchronously using std
        let std_listener = std::net::TcpListener::bind(bind_addr).map_err(|e| {
            SignalingError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        std_listener.set_nonblocking(true).map_err(|e| {
            SignalingError::ConfigurationError(format!("Failed to set nonblocking: {}", e))
        })?;

        let tcp_listener = TcpListener::from_std(std_listener)?;
        let local_addr = tcp_listener.local_addr()?;

        info!(
            "Signaling listener bound to {}://{}{}",
            if tls_acceptor.is_some() { "wss" } else { "ws" },
            local_addr,
            config.path
        );

        let (accepted_tx, accepted_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            tcp_listener,
            tls_acceptor,
            config.clone(),
            accepted_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            accepted: Mutex::new(accepted_rx),
            shutdown,
            config,
        })
    }

    /// Wait for the next upgraded signaling session.
    ///
    /// Returns `None` once the listener is closed.
    pub async fn accept(&self) -> Option<(SignalingConnection, SocketAddr)> {
        let mut accepted = self.accepted.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            next = accepted.recv() => next,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL a connector should use to reach this listener
    pub fn url(&self) -> String {
        let scheme = if self.config.is_tls() { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.local_addr, self.config.path)
    }

    /// Stop accepting. Sessions already handed out are unaffected.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Signaling listener on {} closed", self.local_addr);
        }
        self.shutdown.cancel();
    }
}

impl Drop for SignalingListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    tcp_listener: TcpListener,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<SignalingConfig>,
    accepted: mpsc::Sender<(SignalingConnection, SocketAddr)>,
    shutdown: CancellationToken,
) {
    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = tcp_listener.accept() => match result {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    continue;
                }
            },
        };

        debug!("Incoming TCP connection from {}", remote_addr);

        let tls_acceptor = tls_acceptor.clone();
        let config = config.clone();
        let accepted = accepted.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let handshake = async {
                match tls_acceptor {
                    Some(acceptor) => {
                        let tls_stream = acceptor.accept(tcp_stream).await.map_err(|e| {
                            SignalingError::TlsError(format!("TLS handshake failed: {}", e))
                        })?;
                        debug!("TLS handshake complete from {}", remote_addr);
                        upgrade(tls_stream, &config, remote_addr).await
                    }
                    None => upgrade(tcp_stream, &config, remote_addr).await,
                }
            };

            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = tokio::time::timeout(config.handshake_timeout, handshake) => result,
            };

            match result {
                Ok(Ok(connection)) => {
                    info!("Signaling connection established from {}", remote_addr);
                    if accepted.send((connection, remote_addr)).await.is_err() {
                        debug!("Listener gone, dropping connection from {}", remote_addr);
                    }
                }
                Ok(Err(e)) => warn!("Signaling handshake failed from {}: {}", remote_addr, e),
                Err(_) => warn!("Signaling handshake timed out from {}", remote_addr),
            }
        });
    }

    debug!("Signaling accept loop ended");
}

/// Perform the websocket upgrade, checking path and access token
async fn upgrade<S>(
    stream: S,
    config: &SignalingConfig,
    remote_addr: SocketAddr,
) -> SignalingResult<SignalingConnection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let expected_path = config.path.clone();
    let expected_token = config.token.clone();

    let callback = move |req: &Request, response: Response| {
        let path = req.uri().path();
        let path_ok = path == expected_path
            || path.trim_end_matches('/') == expected_path.trim_end_matches('/');
        if !path_ok {
            return Err(reject(StatusCode::NOT_FOUND, "unknown signaling path"));
        }

        if let Some(token) = &expected_token {
            let supplied = req.uri().query().and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| k == "token")
                    .map(|(_, v)| v.into_owned())
            });
            if supplied.as_deref() != Some(token.as_str()) {
                return Err(reject(StatusCode::UNAUTHORIZED, "invalid access token"));
            }
        }

        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(config.websocket_config()),
    )
    .await?;

    Ok(SignalingConnection::new(ws_stream, Some(remote_addr)))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Connector for establishing outgoing signaling sessions
pub struct SignalingConnector {
    tls_connector: tokio_rustls::TlsConnector,
    config: Arc<SignalingConfig>,
}

impl std::fmt::Debug for SignalingConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingConnector").finish()
    }
}

impl SignalingConnector {
    pub fn new(config: Arc<SignalingConfig>) -> SignalingResult<Self> {
        config.validate()?;

        let tls_connector = config.build_tls_connector()?;

        Ok(Self {
            tls_connector,
            config,
        })
    }

    /// Connect to a `ws://` or `wss://` URL and upgrade
    pub async fn connect(&self, url: &str) -> SignalingResult<SignalingConnection> {
        let mut ws_url = Url::parse(url)
            .map_err(|e| SignalingError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        let secure = match ws_url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(SignalingError::ConfigurationError(format!(
                    "Unsupported signaling scheme: {}",
                    other
                )))
            }
        };

        if let Some(token) = &self.config.token {
            let has_token = ws_url.query_pairs().any(|(k, _)| k == "token");
            if !has_token {
                ws_url.query_pairs_mut().append_pair("token", token);
            }
        }

        let host = match ws_url.host() {
            Some(url::Host::Domain(d)) => d.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(SignalingError::ConfigurationError(
                    "Signaling URL has no host".to_string(),
                ))
            }
        };
        let port = ws_url.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });

        debug!("Connecting to signaling server: {}", redact(&ws_url));

        // Connect TCP
        let tcp_stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| SignalingError::ConnectionError {
                address: format!("{}:{}", host, port),
                source: e,
            })?;
        let remote_addr = tcp_stream.peer_addr().ok();
        let _ = tcp_stream.set_nodelay(true);

        let stream = if secure {
            let dns_name = ServerName::try_from(host.clone())
                .map_err(|e| SignalingError::TlsError(format!("Invalid server name: {}", e)))?;

            let tls_stream = self
                .tls_connector
                .connect(dns_name, tcp_stream)
                .await
                .map_err(|e| SignalingError::TlsError(format!("TLS handshake failed: {}", e)))?;

            MaybeTlsStream::Rustls(tls_stream)
        } else {
            MaybeTlsStream::Plain(tcp_stream)
        };

        // Perform WebSocket handshake
        let (ws_stream, _response) = tokio_tungstenite::client_async_with_config(
            ws_url.as_str(),
            stream,
            Some(self.config.websocket_config()),
        )
        .await?;

        info!("Signaling connection established to {}", redact(&ws_url));

        Ok(SignalingConnection::new(ws_stream, remote_addr))
    }
}

/// URL without its query string, for log lines
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
