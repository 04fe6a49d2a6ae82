//! Peer transport: one ICE/SCTP peer connection and its logical streams

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use peerlink_proto::IceCandidate;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::RtcConfig;
use crate::error::{NegotiationError, TransportError, TransportResult};
use crate::registry::{StreamKind, StreamRegistry};
use crate::state::TransportState;
use crate::stream::DataChannelStream;

const INCOMING_QUEUE: usize = 64;

/// A negotiated (or negotiating) peer connection.
///
/// State changes from the negotiation layer are folded into a
/// [`TransportState`] watch channel. Reaching `failed` or `closed` closes the
/// stream registry, which ends every stream on this transport.
pub struct PeerTransport {
    peer: Arc<RTCPeerConnection>,
    state: Arc<watch::Sender<TransportState>>,
    registry: Arc<StreamRegistry>,
    local_candidates: std::sync::Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
    incoming: std::sync::Mutex<Option<mpsc::Receiver<DataChannelStream>>>,
    /// Remote candidates received before the remote description; `None`
    /// once the description is applied.
    pending_remote: Mutex<Option<Vec<IceCandidate>>>,
    closed: AtomicBool,
    config: RtcConfig,
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish()
    }
}

impl PeerTransport {
    pub async fn new(config: RtcConfig) -> TransportResult<Self> {
        config.validate()?;
        // DTLS needs a process-level rustls provider
        peerlink_transport_websocket::tls::ensure_crypto_provider();

        let api = APIBuilder::new()
            .with_setting_engine(config.setting_engine())
            .build();
        let peer = Arc::new(api.new_peer_connection(config.rtc_configuration()).await?);

        let (state_tx, _) = watch::channel(TransportState::New);
        let state = Arc::new(state_tx);
        let registry = Arc::new(StreamRegistry::new());

        // Local candidates, trickled by the caller over signaling
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let gathering_state = state.clone();
        peer.on_ice_gathering_state_change(Box::new(move |gathering| {
            if gathering == RTCIceGathererState::Gathering {
                advance(&gathering_state, TransportState::Gathering);
            }
            Box::pin(async {})
        }));

        let change_state = state.clone();
        let change_registry = registry.clone();
        peer.on_peer_connection_state_change(Box::new(move |peer_state| {
            if let Some(next) = TransportState::from_peer(peer_state) {
                if advance(&change_state, next) {
                    debug!(state = %next, "Transport state changed");
                }
                if next.is_terminal() {
                    change_registry.close_all();
                }
            }
            Box::pin(async {})
        }));

        // Handlers are attached inside the callback, before the channel can
        // deliver its first message
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let incoming_registry = registry.clone();
        peer.on_data_channel(Box::new(move |channel| {
            let incoming_tx = incoming_tx.clone();
            let kind = StreamKind::from_label(channel.label());
            let attached = DataChannelStream::attach(channel.clone(), &incoming_registry, kind);
            Box::pin(async move {
                match attached {
                    Ok(stream) => {
                        debug!(stream_id = stream.id(), label = stream.label(), "Incoming data channel");
                        if incoming_tx.send(stream).await.is_err() {
                            debug!("No consumer for incoming data channels");
                        }
                    }
                    Err(e) => {
                        debug!("Refusing data channel {}: {}", channel.label(), e);
                        let _ = channel.close().await;
                    }
                }
            })
        }));

        Ok(Self {
            peer,
            state,
            registry,
            local_candidates: std::sync::Mutex::new(Some(candidate_rx)),
            incoming: std::sync::Mutex::new(Some(incoming_rx)),
            pending_remote: Mutex::new(Some(Vec::new())),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Suspend until the transport is connected, or fails/closes.
    ///
    /// Callers bound this with their own deadline.
    pub async fn wait_connected(&self) -> TransportResult<()> {
        let mut rx = self.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                TransportState::Connected => return Ok(()),
                TransportState::Failed => {
                    return Err(NegotiationError::Failed(
                        "ICE connectivity checks failed".to_string(),
                    )
                    .into())
                }
                TransportState::Closed => return Err(TransportError::Closed),
                _ => {}
            }

            if rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Create and apply the local offer; returns its SDP
    pub async fn create_offer(&self) -> TransportResult<String> {
        self.ensure_open()?;

        let offer = self.peer.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.peer.set_local_description(offer).await?;
        advance(&self.state, TransportState::Connecting);
        Ok(sdp)
    }

    /// Apply a remote offer and return the local answer's SDP
    pub async fn accept_offer(&self, sdp: String) -> TransportResult<String> {
        self.ensure_open()?;

        let offer = RTCSessionDescription::offer(sdp)?;
        self.peer.set_remote_description(offer).await?;
        self.flush_pending_candidates().await?;

        let answer = self.peer.create_answer(None).await?;
        let answer_sdp = answer.sdp.clone();
        self.peer.set_local_description(answer).await?;
        advance(&self.state, TransportState::Connecting);
        Ok(answer_sdp)
    }

    /// Apply the remote answer to our offer
    pub async fn apply_answer(&self, sdp: String) -> TransportResult<()> {
        self.ensure_open()?;

        let answer = RTCSessionDescription::answer(sdp)?;
        self.peer.set_remote_description(answer).await?;
        self.flush_pending_candidates().await
    }

    /// Add a trickled remote candidate, queueing it until the remote
    /// description is known
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        self.ensure_open()?;

        let mut pending = self.pending_remote.lock().await;
        match pending.as_mut() {
            Some(queue) => {
                queue.push(candidate);
                Ok(())
            }
            None => {
                self.peer.add_ice_candidate(candidate_init(candidate)).await?;
                Ok(())
            }
        }
    }

    async fn flush_pending_candidates(&self) -> TransportResult<()> {
        let mut pending = self.pending_remote.lock().await;
        let queued = pending.take().unwrap_or_default();

        if !queued.is_empty() {
            debug!(count = queued.len(), "Applying queued remote candidates");
        }
        for candidate in queued {
            self.peer.add_ice_candidate(candidate_init(candidate)).await?;
        }
        Ok(())
    }

    /// Receiver of local candidates to trickle. Can be taken once.
    pub fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        lock(&self.local_candidates).take()
    }

    /// Receiver of channels opened by the remote peer. Can be taken once.
    pub fn take_incoming_streams(&self) -> Option<mpsc::Receiver<DataChannelStream>> {
        lock(&self.incoming).take()
    }

    /// Open a new ordered, reliable data channel
    pub async fn open_stream(
        &self,
        label: &str,
        kind: StreamKind,
    ) -> TransportResult<DataChannelStream> {
        self.ensure_open()?;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self.peer.create_data_channel(label, Some(init)).await?;

        match DataChannelStream::attach(channel.clone(), &self.registry, kind) {
            Ok(stream) => Ok(stream),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Proxy streams currently open on this transport
    pub fn active_streams(&self) -> usize {
        self.registry.active_streams()
    }

    pub fn config(&self) -> &RtcConfig {
        &self.config
    }

    /// Close the peer connection and every stream on it. Idempotent.
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing peer transport");
        self.registry.close_all();
        let result = self.peer.close().await;
        advance(&self.state, TransportState::Closed);
        result.map_err(TransportError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.state().is_terminal()
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.registry.close_all();
        let peer = self.peer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peer.close().await {
                    debug!("Peer connection close on drop failed: {}", e);
                }
            });
        }
    }
}

/// Apply `next` if it is a legal transition; returns whether it was applied
fn advance(state: &watch::Sender<TransportState>, next: TransportState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

fn candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
