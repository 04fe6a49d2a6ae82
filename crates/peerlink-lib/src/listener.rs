//! Server side: accept signaling sessions and forward their streams

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerlink_proto::SignalMessage;
use peerlink_transport_webrtc::{DataChannelStream, PeerTransport, RtcConfig, StreamKind, TransportState};
use peerlink_transport_websocket::{SignalingConfig, SignalingConnection, SignalingListener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::dialer::next_candidate;
use crate::error::ListenError;
use crate::forwarder::TcpForwarder;
use crate::tracker::SessionTracker;

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    pub signaling: SignalingConfig,
    /// Local transport settings. Relay servers and policy sent by the dialer
    /// are added per session.
    pub rtc: RtcConfig,
    /// Bound for connecting to a requested destination
    pub connect_timeout: Duration,
    /// Bound for offer/answer plus ICE, per session
    pub handshake_timeout: Duration,
    /// How long a disconnected transport may stay silent before its session
    /// and destination sockets are torn down
    pub teardown_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            signaling: SignalingConfig::server_default(),
            rtc: RtcConfig::default(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.signaling = self.signaling.with_path(path);
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.signaling = self.signaling.with_token(token);
        self
    }

    pub fn with_signaling_config(mut self, signaling: SignalingConfig) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn with_rtc_config(mut self, rtc: RtcConfig) -> Self {
        self.rtc = rtc;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ListenError> {
        self.signaling.validate()?;
        for (name, value) in [
            ("connect", self.connect_timeout),
            ("handshake", self.handshake_timeout),
            ("teardown", self.teardown_timeout),
        ] {
            if value.is_zero() {
                return Err(ListenError::ConfigurationError(format!(
                    "{} timeout must be non-zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Accepts signaling sessions; each session negotiates its own transport and
/// forwards its proxy streams to local TCP destinations.
///
/// Sessions are isolated: a failed or malformed one is answered with a
/// signaling `error` and closed without affecting the others.
pub struct Listener {
    local_addr: SocketAddr,
    url: String,
    sessions: Arc<SessionTracker>,
    shutdown: CancellationToken,
    teardown_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("url", &self.url)
            .field("sessions", &self.active_sessions())
            .finish()
    }
}

impl Listener {
    pub async fn bind(config: ListenerConfig) -> Result<Self, ListenError> {
        config.validate()?;

        let signaling =
            SignalingListener::bind(config.bind_addr, Arc::new(config.signaling.clone())).await?;
        let local_addr = signaling.local_addr();
        let url = signaling.url();
        let shutdown = CancellationToken::new();
        let sessions = Arc::new(SessionTracker::new());
        let teardown_timeout = config.teardown_timeout;

        tokio::spawn(accept_loop(
            signaling,
            Arc::new(config),
            sessions.clone(),
            shutdown.clone(),
        ));

        info!("Listening for signaling sessions on {}", url);
        Ok(Self {
            local_addr,
            url,
            sessions,
            shutdown,
            teardown_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signaling URL dialers connect to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sessions currently negotiating or serving
    pub fn active_sessions(&self) -> usize {
        self.sessions.active()
    }

    /// Stop accepting and end every session. Sessions that do not wind down
    /// within the teardown timeout are aborted. A second call does nothing.
    pub async fn close(&self) -> Result<(), ListenError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(sessions = self.active_sessions(), "Closing listener on {}", self.url);
        self.shutdown.cancel();
        self.sessions.drain(self.teardown_timeout).await;
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    signaling: SignalingListener,
    config: Arc<ListenerConfig>,
    sessions: Arc<SessionTracker>,
    shutdown: CancellationToken,
) {
    loop {
        let (conn, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = signaling.accept() => match next {
                Some(accepted) => accepted,
                None => break,
            },
        };

        let session_id = conn.connection_id().to_string();
        let span = info_span!(
            "session",
            session_id = %session_id,
            remote_addr = %remote_addr,
            client_id = tracing::field::Empty,
        );
        let session = Session {
            conn: Arc::new(conn),
            config: config.clone(),
            token: shutdown.child_token(),
        };

        let tracker = sessions.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(
            async move {
                session.run().await;
                tracker.remove(&id);
            }
            .instrument(span),
        );
        sessions.register(session_id, handle);
    }

    signaling.close();
    debug!("Accept loop stopped");
}

struct Session {
    conn: Arc<SignalingConnection>,
    config: Arc<ListenerConfig>,
    /// Cancelled when the session ends; stops its pump and forwarders
    token: CancellationToken,
}

impl Session {
    async fn run(self) {
        debug!("Session started");

        let mut built = None;
        let negotiated = tokio::select! {
            _ = self.token.cancelled() => Err(ListenError::Closed),
            result = tokio::time::timeout(self.config.handshake_timeout, self.negotiate(&mut built)) => {
                result.unwrap_or(Err(ListenError::HandshakeTimeout(self.config.handshake_timeout)))
            }
        };

        match negotiated {
            Ok((transport, incoming)) => {
                info!("Transport established");
                self.serve(&transport, incoming).await;
                self.token.cancel();
                let _ = transport.close().await;
            }
            Err(e) => {
                warn!("Session failed: {}", e);
                self.token.cancel();
                if let Some(transport) = built {
                    let _ = transport.close().await;
                }
                let message = SignalMessage::Error {
                    message: e.to_string(),
                };
                if let Err(e) = self.conn.send(&message).await {
                    debug!("Could not report session error: {}", e);
                }
            }
        }

        let _ = self.conn.close().await;
        info!("Session ended");
    }

    async fn negotiate(
        &self,
        built: &mut Option<Arc<PeerTransport>>,
    ) -> Result<(Arc<PeerTransport>, mpsc::Receiver<DataChannelStream>), ListenError> {
        let (client, sdp, servers, policy) = match self.conn.recv().await? {
            Some(SignalMessage::Offer {
                client,
                sdp,
                servers,
                policy,
            }) => (client, sdp, servers, policy),
            Some(other) => {
                return Err(ListenError::Protocol(format!(
                    "expected offer, got {}",
                    other.kind()
                )))
            }
            None => {
                return Err(ListenError::Protocol(
                    "signaling closed before an offer arrived".to_string(),
                ))
            }
        };

        Span::current().record("client_id", client.id.as_str());
        info!(
            hostname = %client.hostname,
            platform = %client.platform,
            version = %client.version,
            relay_servers = servers.len(),
            "Offer received"
        );

        let mut rtc = self.config.rtc.clone();
        rtc.ice_servers.extend(servers);
        rtc.policy = policy;

        let transport = Arc::new(PeerTransport::new(rtc).await?);
        *built = Some(transport.clone());
        let incoming = transport
            .take_incoming_streams()
            .ok_or_else(|| ListenError::Protocol("incoming streams already taken".to_string()))?;

        let answer = transport.accept_offer(sdp).await?;
        self.conn.send(&SignalMessage::Answer { sdp: answer }).await?;

        tokio::spawn(
            session_pump(transport.clone(), self.conn.clone(), self.token.clone())
                .in_current_span(),
        );

        transport.wait_connected().await?;
        Ok((transport, incoming))
    }

    /// Route incoming streams until the transport ends, stays disconnected
    /// past the teardown timeout, or the listener closes
    async fn serve(
        &self,
        transport: &Arc<PeerTransport>,
        mut incoming: mpsc::Receiver<DataChannelStream>,
    ) {
        let forwarder = TcpForwarder::new(self.config.connect_timeout);
        let mut state = transport.subscribe();

        let teardown = tokio::time::sleep(self.config.teardown_timeout);
        tokio::pin!(teardown);
        let mut armed = false;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("Listener closing session");
                    break;
                }
                stream = incoming.recv() => match stream {
                    Some(stream) => self.spawn_stream(stream, &forwarder),
                    None => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    match current {
                        TransportState::Disconnected => {
                            debug!("Transport disconnected, arming teardown");
                            teardown.as_mut().reset(Instant::now() + self.config.teardown_timeout);
                            armed = true;
                        }
                        TransportState::Connected => armed = false,
                        s if s.is_terminal() => {
                            info!(state = %s, "Transport ended");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = &mut teardown, if armed => {
                    info!("Transport stayed disconnected, tearing down");
                    break;
                }
            }
        }
    }

    fn spawn_stream(&self, stream: DataChannelStream, forwarder: &TcpForwarder) {
        let token = self.token.clone();
        match stream.kind() {
            StreamKind::Control => {
                tokio::spawn(echo(stream, token).in_current_span());
            }
            StreamKind::Proxy => {
                let forwarder = forwarder.clone();
                let stream_id = stream.id();
                tokio::spawn(
                    async move {
                        if let Err(e) = forwarder.forward(stream, token).await {
                            debug!(stream_id, "Forward ended: {}", e);
                        }
                    }
                    .in_current_span(),
                );
            }
        }
    }
}

/// Echo liveness probes on the control channel
async fn echo(mut stream: DataChannelStream, token: CancellationToken) {
    let mut buf = [0u8; 64];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        if stream.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    debug!("Control channel closed");
}

/// Trickle local candidates to the dialer and apply the dialer's candidates
async fn session_pump(
    transport: Arc<PeerTransport>,
    conn: Arc<SignalingConnection>,
    token: CancellationToken,
) {
    let mut candidates = transport.take_local_candidates();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            candidate = next_candidate(&mut candidates) => match candidate {
                Some(candidate) => {
                    if let Err(e) = conn.send(&SignalMessage::Candidate { candidate }).await {
                        debug!("Failed to send candidate: {}", e);
                    }
                }
                None => candidates = None,
            },
            msg = conn.recv() => match msg {
                Ok(Some(SignalMessage::Candidate { candidate })) => {
                    if let Err(e) = transport.add_remote_candidate(candidate).await {
                        debug!("Failed to add remote candidate: {}", e);
                    }
                }
                Ok(Some(other)) => debug!(kind = other.kind(), "Ignoring signaling message"),
                Ok(None) => {
                    debug!("Signaling closed by dialer");
                    break;
                }
                Err(e) => debug!("Bad signaling message: {}", e),
            },
        }
    }
}
