//! Signaling connection over an established websocket

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerlink_proto::{SignalCodec, SignalMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{SignalingError, SignalingResult};

/// One signaling session: typed send/recv over a websocket.
///
/// Reading and writing run in background tasks so that `send` never waits on
/// a concurrent `recv`. Dropping the connection stops both tasks.
pub struct SignalingConnection {
    /// Connection ID for logging
    connection_id: String,
    /// Remote address, when known
    remote_addr: Option<SocketAddr>,
    /// Channel for sending messages to the writer task
    outgoing: mpsc::Sender<Message>,
    /// Decoded messages from the reader task
    incoming: Mutex<mpsc::Receiver<SignalingResult<SignalMessage>>>,
    /// Set once either side closed the socket
    closed: Arc<AtomicBool>,
    /// Set once `close` was called locally
    close_called: AtomicBool,
    /// Stops the reader task
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SignalingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SignalingConnection {
    /// Wrap an upgraded websocket stream
    pub fn new<S>(ws_stream: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("sig-{}", uuid::Uuid::new_v4());

        let (ws_sink, ws_source) = ws_stream.split();

        let (outgoing, outgoing_rx) = mpsc::channel::<Message>(64);
        let (incoming_tx, incoming) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let conn_id = connection_id.clone();
        let closed_flag = closed.clone();
        tokio::spawn(async move {
            Self::writer_task(ws_sink, outgoing_rx, closed_flag, conn_id).await;
        });

        let conn_id = connection_id.clone();
        let closed_flag = closed.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            Self::reader_task(ws_source, incoming_tx, closed_flag, token, conn_id).await;
        });

        Self {
            connection_id,
            remote_addr,
            outgoing,
            incoming: Mutex::new(incoming),
            closed,
            close_called: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Writer task - sends messages to the websocket
    async fn writer_task<S>(
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::Receiver<Message>,
        closed: Arc<AtomicBool>,
        conn_id: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));

            if let Err(e) = sink.send(msg).await {
                debug!("[{}] WebSocket send error: {}", conn_id, e);
                break;
            }

            if is_close {
                break;
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
        closed.store(true, Ordering::SeqCst);
        let _ = sink.close().await;
    }

    /// Reader task - decodes text frames into signaling messages
    async fn reader_task<S>(
        mut source: SplitStream<WebSocketStream<S>>,
        tx: mpsc::Sender<SignalingResult<SignalMessage>>,
        closed: Arc<AtomicBool>,
        shutdown: CancellationToken,
        conn_id: String,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = source.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            let decoded = match result {
                Ok(Message::Text(text)) => {
                    trace!("[{}] Received {} bytes", conn_id, text.len());
                    SignalCodec::decode(&text).map_err(SignalingError::from)
                }
                Ok(Message::Binary(data)) => {
                    warn!("[{}] Ignoring binary frame", conn_id);
                    Err(SignalingError::UnexpectedBinary(data.len()))
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong is automatically handled by tungstenite
                    continue;
                }
                Ok(Message::Close(_)) => {
                    debug!("[{}] WebSocket close received", conn_id);
                    break;
                }
                Ok(Message::Frame(_)) => continue,
                Err(e) => {
                    let err = SignalingError::from(e);
                    if !matches!(err, SignalingError::Closed) {
                        error!("[{}] WebSocket read error: {}", conn_id, err);
                        let _ = tx.send(Err(err)).await;
                    }
                    break;
                }
            };

            if tx.send(decoded).await.is_err() {
                break;
            }
        }

        debug!("[{}] WebSocket reader task ended", conn_id);
        closed.store(true, Ordering::SeqCst);
    }

    /// Send one signaling message
    pub async fn send(&self, msg: &SignalMessage) -> SignalingResult<()> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }

        let text = SignalCodec::encode(msg)?;
        trace!("[{}] Sending {}", self.connection_id, msg.kind());

        self.outgoing
            .send(Message::Text(text))
            .await
            .map_err(|_| SignalingError::Closed)
    }

    /// Receive the next signaling message.
    ///
    /// Returns `Ok(None)` once the socket is closed by either side.
    pub async fn recv(&self) -> SignalingResult<Option<SignalMessage>> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.transpose()
    }

    /// Send a close frame and stop reading.
    ///
    /// A second call returns [`SignalingError::AlreadyClosed`].
    pub async fn close(&self) -> SignalingResult<()> {
        if self.close_called.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::AlreadyClosed);
        }

        debug!("[{}] Closing signaling connection", self.connection_id);
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.outgoing.send(Message::Close(None)).await;
        self.shutdown.cancel();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (SignalingConnection, SignalingConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (
            SignalingConnection::new(client, None),
            SignalingConnection::new(server, None),
        )
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (client, server) = pair().await;

        let msg = SignalMessage::Answer {
            sdp: "v=0".to_string(),
        };
        client.send(&msg).await.unwrap();

        let received = server.recv().await.unwrap();
        assert_eq!(received, Some(msg));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (client, _server) = pair().await;

        assert!(client.close().await.is_ok());
        assert!(client.is_closed());
        assert!(matches!(
            client.close().await,
            Err(SignalingError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (client, _server) = pair().await;
        client.close().await.unwrap();

        let result = client
            .send(&SignalMessage::Error {
                message: "late".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SignalingError::Closed)));
    }

    #[tokio::test]
    async fn test_remote_close_ends_recv() {
        let (client, server) = pair().await;
        client.close().await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), server.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_none());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_text_is_reported() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut raw_client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = SignalingConnection::new(
            WebSocketStream::from_raw_socket(b, Role::Server, None).await,
            None,
        );

        raw_client
            .send(Message::Text("{\"type\":\"bogus\"}".to_string()))
            .await
            .unwrap();

        let result = server.recv().await;
        assert!(matches!(result, Err(SignalingError::CodecError(_))));
    }
}
