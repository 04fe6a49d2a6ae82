//! Client side: negotiate one transport over signaling and dial through it

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use peerlink_proto::{
    ClientInfo, DialRequest, DialResponse, IceServer, SignalCodec, SignalMessage,
    CONTROL_CHANNEL_LABEL, PING_BYTE, PROXY_CHANNEL_LABEL, SUPPORTED_NETWORKS,
};
use peerlink_transport_webrtc::{
    probe_ice_server, DataChannelStream, NegotiationError, PeerTransport, ProbeOptions, RtcConfig,
    StreamId, StreamKind, TransportError, TransportState,
};
use peerlink_transport_websocket::{SignalingConfig, SignalingConnection, SignalingConnector};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::error::{DialError, DialResult};

/// How a [`Dialer`] connects
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub rtc: RtcConfig,
    pub signaling: SignalingConfig,
    /// Bound for signaling connect plus negotiation
    pub handshake_timeout: Duration,
    /// Default bound for [`Dialer::dial`] and [`Dialer::ping`]
    pub dial_timeout: Duration,
    /// External cancellation for the handshake and every later operation
    pub cancel: Option<CancellationToken>,
    /// Span all dialer work is recorded under
    pub span: Option<Span>,
    pub client: ClientInfo,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            rtc: RtcConfig::default(),
            signaling: SignalingConfig::client_default(),
            handshake_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(30),
            cancel: None,
            span: None,
            client: ClientInfo::default(),
        }
    }
}

impl DialOptions {
    pub fn with_rtc_config(mut self, rtc: RtcConfig) -> Self {
        self.rtc = rtc;
        self
    }

    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.rtc.ice_servers.push(server);
        self
    }

    pub fn with_signaling_config(mut self, signaling: SignalingConfig) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// Client handle bound to one negotiated transport.
///
/// Every stream returned by [`Dialer::dial`] is multiplexed over that
/// transport. The transport is never re-established: once it fails, build a
/// new dialer.
pub struct Dialer {
    client: ClientInfo,
    transport: Arc<PeerTransport>,
    signaling: Arc<SignalingConnection>,
    control: Mutex<DataChannelStream>,
    /// Byte written by the next ping
    ping_seq: AtomicU8,
    dial_timeout: Duration,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    closed: AtomicBool,
    span: Span,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("client_id", &self.client.id)
            .field("state", &self.transport.state())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

impl Dialer {
    /// Open signaling to `url` and negotiate a transport within the
    /// handshake timeout
    pub async fn connect(url: &str, options: DialOptions) -> DialResult<Self> {
        let span = dialer_span(&options);
        let deadline = Instant::now() + options.handshake_timeout;
        let cancel = options.cancel.clone().unwrap_or_default();

        let signaling = async {
            let connector = SignalingConnector::new(Arc::new(options.signaling.clone()))?;
            let conn = connector.connect(url).await?;
            Ok::<_, DialError>(conn)
        };
        let signaling = bounded(
            signaling,
            deadline,
            &cancel,
            options.handshake_timeout,
        )
        .instrument(span.clone())
        .await?;

        Self::negotiate(Arc::new(signaling), options, deadline, span).await
    }

    /// Negotiate over an already open signaling connection.
    ///
    /// On failure the transport and `signaling` are both closed before the
    /// error is returned.
    pub async fn handshake(
        signaling: Arc<SignalingConnection>,
        options: DialOptions,
    ) -> DialResult<Self> {
        let span = dialer_span(&options);
        let deadline = Instant::now() + options.handshake_timeout;
        Self::negotiate(signaling, options, deadline, span).await
    }

    async fn negotiate(
        signaling: Arc<SignalingConnection>,
        options: DialOptions,
        deadline: Instant,
        span: Span,
    ) -> DialResult<Self> {
        let cancel = options.cancel.clone().unwrap_or_default();
        let shutdown = CancellationToken::new();

        let transport = match PeerTransport::new(options.rtc.clone())
            .instrument(span.clone())
            .await
        {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                let _ = signaling.close().await;
                return Err(e.into());
            }
        };

        let handshake = Handshake {
            transport: &transport,
            signaling: &signaling,
            options: &options,
            shutdown: &shutdown,
        };
        let result = bounded(
            handshake.run(),
            deadline,
            &cancel,
            options.handshake_timeout,
        )
        .instrument(span.clone())
        .await;

        match result {
            Ok(control) => {
                span.in_scope(|| info!(state = %transport.state(), "Transport established"));
                Ok(Self {
                    client: options.client,
                    transport,
                    signaling,
                    control: Mutex::new(control),
                    ping_seq: AtomicU8::new(PING_BYTE),
                    dial_timeout: options.dial_timeout,
                    cancel,
                    shutdown,
                    closed: AtomicBool::new(false),
                    span,
                })
            }
            Err(e) => {
                span.in_scope(|| debug!("Handshake failed: {}", e));
                shutdown.cancel();
                let _ = transport.close().await;
                let _ = signaling.close().await;
                Err(e)
            }
        }
    }

    /// Open a stream to `address` on the listener's side, bounded by the
    /// default dial timeout
    pub async fn dial(&self, network: &str, address: &str) -> DialResult<DialedStream> {
        self.dial_timeout(network, address, self.dial_timeout).await
    }

    /// Open a stream to `address` on the listener's side.
    ///
    /// Returns [`DialError::Destination`] when the listener could not reach
    /// the destination. A stream abandoned by timeout or cancellation is
    /// closed before returning.
    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> DialResult<DialedStream> {
        if !SUPPORTED_NETWORKS.contains(&network) {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }
        self.ensure_open()?;

        let open = async {
            let mut stream = self
                .transport
                .open_stream(PROXY_CHANNEL_LABEL, StreamKind::Proxy)
                .await
                .map_err(|e| self.transport_error(e))?;
            stream.wait_open().await.map_err(|e| self.transport_error(e))?;

            let request = SignalCodec::encode_frame(&DialRequest {
                network: network.to_string(),
                address: address.to_string(),
            })?;
            stream
                .send_text(request)
                .await
                .map_err(|e| self.transport_error(e))?;

            let frame = stream.recv_frame().await.ok_or_else(|| self.gone())?;
            let response: DialResponse = SignalCodec::decode_frame(&frame)?;
            if let Some(failure) = response.error {
                return Err(DialError::Destination(failure.into()));
            }

            debug!(stream_id = stream.id(), network, address, "Stream opened");
            Ok(DialedStream {
                inner: stream,
                network: network.to_string(),
                address: address.to_string(),
            })
        };

        bounded(open, Instant::now() + timeout, &self.cancel, timeout)
            .instrument(self.span.clone())
            .await
    }

    /// Round-trip a liveness check, bounded by the default dial timeout
    pub async fn ping(&self) -> DialResult<()> {
        self.ping_timeout(self.dial_timeout).await
    }

    /// Round-trip a liveness check over the control channel.
    ///
    /// Every ping writes a fresh sequence byte, so an echo left behind by a
    /// ping that timed out never completes a later one.
    ///
    /// Fails with [`DialError::ConnectionClosed`] after [`Dialer::close`] and
    /// with [`DialError::Eof`] once the transport has been torn down.
    pub async fn ping_timeout(&self, timeout: Duration) -> DialResult<()> {
        self.ensure_open()?;

        let round_trip = async {
            let mut control = self.control.lock().await;
            let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
            match echo_round_trip(&mut *control, seq).await {
                Ok(true) => Ok(()),
                Ok(false) | Err(_) => Err(self.gone()),
            }
        };

        bounded(round_trip, Instant::now() + timeout, &self.cancel, timeout)
            .instrument(self.span.clone())
            .await
    }

    /// Tear down the transport and every stream opened through it. A second
    /// call does nothing.
    pub async fn close(&self) -> DialResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.span.in_scope(|| info!("Closing dialer"));
        self.shutdown.cancel();
        let result = self.transport.close().await;
        if let Err(e) = self.signaling.close().await {
            debug!("Signaling already closed: {}", e);
        }
        result.map_err(DialError::from)
    }

    /// Streams opened by this dialer that neither side has closed yet
    pub fn active_connections(&self) -> usize {
        self.transport.active_streams()
    }

    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    /// Suspend until the dialer is closed or its transport fails
    pub async fn wait_closed(&self) {
        let mut state = self.transport.subscribe();
        loop {
            if state.borrow_and_update().is_terminal() {
                return;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> DialResult<()> {
        if self.is_closed() {
            return Err(DialError::ConnectionClosed);
        }
        if self.transport.is_closed() {
            return Err(DialError::Eof);
        }
        Ok(())
    }

    /// Closed by us, or torn down underneath us
    fn gone(&self) -> DialError {
        if self.is_closed() {
            DialError::ConnectionClosed
        } else {
            DialError::Eof
        }
    }

    fn transport_error(&self, err: TransportError) -> DialError {
        match err {
            TransportError::Closed | TransportError::ChannelClosed { .. } => self.gone(),
            other => other.into(),
        }
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn dialer_span(options: &DialOptions) -> Span {
    options
        .span
        .clone()
        .unwrap_or_else(|| info_span!("dialer", client_id = %options.client.id))
}

/// Run `fut` until it finishes, `deadline` passes or `cancel` fires
/// Write `seq` and read until it comes back, skipping stale echoes.
///
/// `Ok(false)` means the stream ended first.
async fn echo_round_trip<S>(stream: &mut S, seq: u8) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[seq]).await?;

    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            return Ok(false);
        }
        if byte[0] == seq {
            return Ok(true);
        }
    }
}

async fn bounded<F, T>(
    fut: F,
    deadline: Instant,
    cancel: &CancellationToken,
    timeout: Duration,
) -> DialResult<T>
where
    F: Future<Output = DialResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DialError::Cancelled),
        result = tokio::time::timeout_at(deadline, fut) => {
            result.map_err(|_| DialError::Timeout(timeout))?
        }
    }
}

/// One offer/answer exchange
struct Handshake<'a> {
    transport: &'a Arc<PeerTransport>,
    signaling: &'a Arc<SignalingConnection>,
    options: &'a DialOptions,
    shutdown: &'a CancellationToken,
}

impl Handshake<'_> {
    /// Returns the open control channel
    async fn run(self) -> DialResult<DataChannelStream> {
        // Opened before the offer so the SDP carries a data section
        let mut control = self
            .transport
            .open_stream(CONTROL_CHANNEL_LABEL, StreamKind::Control)
            .await?;

        let sdp = self.transport.create_offer().await?;
        self.signaling
            .send(&SignalMessage::Offer {
                client: self.options.client.clone(),
                sdp,
                servers: self.options.rtc.ice_servers.clone(),
                policy: self.options.rtc.policy,
            })
            .await?;
        debug!("Offer sent");

        let (answer_tx, answer_rx) = oneshot::channel();
        tokio::spawn(
            signal_pump(
                self.transport.clone(),
                self.signaling.clone(),
                answer_tx,
                self.shutdown.clone(),
            )
            .in_current_span(),
        );

        let answer = answer_rx.await.map_err(|_| {
            DialError::Protocol("signaling closed before an answer arrived".to_string())
        })??;
        self.transport.apply_answer(answer).await?;
        debug!("Answer applied");

        if let Err(e) = self.transport.wait_connected().await {
            return Err(self.classify(e).await);
        }
        control.wait_open().await?;
        Ok(control)
    }

    /// Replace a generic ICE failure with a relay-server diagnosis when one
    /// of the configured servers explains it
    async fn classify(&self, err: TransportError) -> DialError {
        if !matches!(err, TransportError::Negotiation(NegotiationError::Failed(_))) {
            return err.into();
        }

        let probe = ProbeOptions {
            verify_server_cert: self.options.signaling.verify_server_cert,
            root_certs: self.options.signaling.root_certs.clone(),
            ..ProbeOptions::default()
        };
        for server in self.options.rtc.relay_servers() {
            match probe_ice_server(server, &probe).await {
                Ok(_) => {}
                Err(e) if e.is_configuration_error() => {
                    warn!("Relay server misconfigured: {}", e);
                    return DialError::Negotiation(e);
                }
                Err(e) => debug!("Relay server probe failed: {}", e),
            }
        }
        err.into()
    }
}

/// Trickle local candidates out and route signaling messages in, for the
/// lifetime of the dialer
async fn signal_pump(
    transport: Arc<PeerTransport>,
    signaling: Arc<SignalingConnection>,
    answer_tx: oneshot::Sender<DialResult<String>>,
    shutdown: CancellationToken,
) {
    let mut answer_tx = Some(answer_tx);
    let mut candidates = transport.take_local_candidates();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            candidate = next_candidate(&mut candidates) => match candidate {
                Some(candidate) => {
                    if let Err(e) = signaling.send(&SignalMessage::Candidate { candidate }).await {
                        debug!("Failed to send candidate: {}", e);
                    }
                }
                None => candidates = None,
            },
            msg = signaling.recv() => match msg {
                Ok(Some(SignalMessage::Answer { sdp })) => {
                    if let Some(tx) = answer_tx.take() {
                        let _ = tx.send(Ok(sdp));
                    }
                }
                Ok(Some(SignalMessage::Candidate { candidate })) => {
                    if let Err(e) = transport.add_remote_candidate(candidate).await {
                        debug!("Failed to add remote candidate: {}", e);
                    }
                }
                Ok(Some(SignalMessage::Error { message })) => {
                    warn!("Listener reported an error: {}", message);
                    if let Some(tx) = answer_tx.take() {
                        let _ = tx.send(Err(DialError::Remote(message)));
                    }
                }
                Ok(Some(other)) => debug!(kind = other.kind(), "Ignoring signaling message"),
                Ok(None) => {
                    debug!("Signaling closed");
                    break;
                }
                Err(e) => debug!("Bad signaling message: {}", e),
            },
        }
    }
}

pub(crate) async fn next_candidate(
    candidates: &mut Option<tokio::sync::mpsc::UnboundedReceiver<peerlink_proto::IceCandidate>>,
) -> Option<peerlink_proto::IceCandidate> {
    match candidates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// A proxied connection returned by [`Dialer::dial`]
#[derive(Debug)]
pub struct DialedStream {
    inner: DataChannelStream,
    network: String,
    address: String,
}

impl DialedStream {
    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stream_id(&self) -> StreamId {
        self.inner.id()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received()
    }
}

impl AsyncRead for DialedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DialedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_round_trip_skips_stale_echo() {
        let (mut local, mut remote) = tokio::io::duplex(64);

        // Echo of an earlier ping that gave up waiting
        remote.write_all(&[PING_BYTE]).await.unwrap();

        let seq = PING_BYTE.wrapping_add(1);
        let round_trip = tokio::spawn(async move {
            let result = echo_round_trip(&mut local, seq).await;
            (local, result)
        });

        let mut written = [0u8; 1];
        remote.read_exact(&mut written).await.unwrap();
        assert_eq!(written[0], seq);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!round_trip.is_finished());

        remote.write_all(&written).await.unwrap();
        let (_local, result) = round_trip.await.unwrap();
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn test_echo_round_trip_eof() {
        let (mut local, remote) = tokio::io::duplex(64);
        drop(remote);
        // Writing to a closed duplex fails; reading reports end-of-stream
        assert!(echo_round_trip(&mut local, PING_BYTE).await.is_err());

        let (mut local, mut remote) = tokio::io::duplex(64);
        let round_trip = tokio::spawn(async move { echo_round_trip(&mut local, 7).await });
        let mut written = [0u8; 1];
        remote.read_exact(&mut written).await.unwrap();
        drop(remote);
        assert!(!round_trip.await.unwrap().unwrap());
    }
}
