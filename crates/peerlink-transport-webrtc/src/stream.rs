//! AsyncRead + AsyncWrite adapter over one data channel

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{TransportError, TransportResult};
use crate::registry::{InboundSlot, StreamId, StreamKind, StreamRegistry};

/// Largest payload written in one data channel message
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

const INBOUND_QUEUE: usize = 256;
const OUTBOUND_QUEUE: usize = 32;

/// Pause writing while this much is queued in SCTP
const HIGH_WATER_MARK: usize = 1024 * 1024;

/// Upper bound for draining queued data before a graceful close
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One logical stream.
///
/// Reads return end-of-stream once the channel is closed by either side or
/// the transport goes away. Writes are queued to a background task that
/// applies backpressure on the channel's buffered amount; dropping or shutting
/// down the stream drains that queue and then closes the channel.
pub struct DataChannelStream {
    id: StreamId,
    kind: StreamKind,
    label: String,
    channel: Arc<RTCDataChannel>,
    registry: Weak<StreamRegistry>,
    inbound: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    outbound: PollSender<Bytes>,
    opened: Option<oneshot::Receiver<()>>,
    closed: CancellationToken,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    released: bool,
}

impl std::fmt::Debug for DataChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelStream")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

impl DataChannelStream {
    /// Install handlers on `channel` and register it.
    ///
    /// Must run before the channel can deliver messages (right after
    /// creation, or inside the peer's data channel callback) so that nothing
    /// is dropped.
    pub fn attach(
        channel: Arc<RTCDataChannel>,
        registry: &Arc<StreamRegistry>,
        kind: StreamKind,
    ) -> TransportResult<Self> {
        let label = channel.label().to_string();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let slot = InboundSlot::new(inbound_tx);

        let id = registry.register(kind, &label, slot.clone())?;
        let closed = registry.shutdown_token().child_token();

        let (open_tx, opened) = oneshot::channel();
        channel.on_open(Box::new(move || {
            let _ = open_tx.send(());
            Box::pin(async {})
        }));

        let message_slot = slot.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = message_slot.sender();
            Box::pin(async move {
                match tx {
                    Some(tx) => {
                        if tx.send(msg.data).await.is_err() {
                            trace!(stream_id = id, "Reader gone, dropping message");
                        }
                    }
                    None => trace!(stream_id = id, "Stream released, dropping message"),
                }
            })
        }));

        let weak = Arc::downgrade(registry);
        let close_token = closed.clone();
        let close_label = label.clone();
        channel.on_close(Box::new(move || {
            debug!(stream_id = id, label = %close_label, "Data channel closed");
            slot.close();
            close_token.cancel();
            if let Some(registry) = weak.upgrade() {
                registry.release(id);
            }
            Box::pin(async {})
        }));

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(writer_task(
            channel.clone(),
            outbound_rx,
            closed.clone(),
            id,
        ));

        Ok(Self {
            id,
            kind,
            label,
            channel,
            registry: Arc::downgrade(registry),
            inbound,
            read_buf: Bytes::new(),
            outbound: PollSender::new(outbound_tx),
            opened: Some(opened),
            closed,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            released: false,
        })
    }

    /// Wait until the channel is open for writing
    pub async fn wait_open(&mut self) -> TransportResult<()> {
        if self.channel.ready_state() == RTCDataChannelState::Open {
            return Ok(());
        }

        let opened = self.opened.take().ok_or_else(|| self.channel_closed())?;

        tokio::select! {
            result = opened => result.map_err(|_| self.channel_closed()),
            _ = self.closed.cancelled() => Err(self.channel_closed()),
        }
    }

    /// Next whole message, for the open/accept handshake.
    ///
    /// Returns `None` once the stream is closed. Handshake frames are not
    /// counted in the byte counters.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        if !self.read_buf.is_empty() {
            return Some(std::mem::take(&mut self.read_buf));
        }

        self.inbound.recv().await
    }

    /// Send one text message ahead of any queued binary data
    pub async fn send_text(&self, text: String) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(self.channel_closed());
        }

        self.channel.send_text(text).await?;
        Ok(())
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the remote closed the channel or the transport went away
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Token cancelled when the channel closes remotely or the transport dies
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Drop the registry entry. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.id);
        }
    }

    fn channel_closed(&self) -> TransportError {
        TransportError::ChannelClosed {
            label: self.label.clone(),
        }
    }
}

impl Drop for DataChannelStream {
    fn drop(&mut self) {
        self.release();
    }
}

async fn writer_task(
    channel: Arc<RTCDataChannel>,
    mut rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    id: StreamId,
) {
    loop {
        let data = tokio::select! {
            _ = closed.cancelled() => {
                trace!(stream_id = id, "Writer stopped, channel gone");
                return;
            }
            next = rx.recv() => match next {
                Some(data) => data,
                None => break,
            },
        };

        while channel.buffered_amount().await > HIGH_WATER_MARK {
            tokio::select! {
                _ = closed.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        if let Err(e) = channel.send(&data).await {
            debug!(stream_id = id, "Data channel send failed: {}", e);
            return;
        }
    }

    // All senders dropped: let queued data drain, then close
    let deadline = Instant::now() + FLUSH_TIMEOUT;
    while !closed.is_cancelled()
        && Instant::now() < deadline
        && channel.buffered_amount().await > 0
    {
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if !closed.is_cancelled() {
        if let Err(e) = channel.close().await {
            debug!(stream_id = id, "Data channel close failed: {}", e);
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "data channel closed")
}

impl AsyncRead for DataChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        while this.read_buf.is_empty() {
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    this.bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    this.read_buf = data;
                }
                // EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.remaining().min(this.read_buf.len());
        buf.put_slice(&this.read_buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for DataChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = &mut *self;
        if this.released || this.closed.is_cancelled() {
            return Poll::Ready(Err(broken_pipe()));
        }

        match this.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(broken_pipe())),
            Poll::Pending => return Poll::Pending,
        }

        let n = buf.len().min(MAX_MESSAGE_SIZE);
        this.outbound
            .send_item(Bytes::copy_from_slice(&buf[..n]))
            .map_err(|_| broken_pipe())?;
        this.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Data channels have no half-close: shutdown closes the whole stream
    /// once the write queue has drained.
    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.outbound.close();
        this.release();
        Poll::Ready(Ok(()))
    }
}
