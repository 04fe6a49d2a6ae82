//! Listener-side bridge between one proxy stream and a local TCP destination

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use peerlink_proto::{
    DialFailure, DialRequest, DialResponse, ErrorCode, SignalCodec, SUPPORTED_NETWORKS,
};
use peerlink_transport_webrtc::{DataChannelStream, TransportError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during TCP forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to reach destination: {0}")]
    Destination(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Connects proxy streams to their requested destinations
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    connect_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Serve one proxy stream: read its dial request, connect, acknowledge,
    /// then copy in both directions until either side closes or `shutdown`
    /// fires.
    ///
    /// Returns (bytes_to_destination, bytes_to_stream).
    pub async fn forward(
        &self,
        mut stream: DataChannelStream,
        shutdown: CancellationToken,
    ) -> Result<(u64, u64), ForwarderError> {
        let frame = stream
            .recv_frame()
            .await
            .ok_or_else(|| ForwarderError::Protocol("stream closed before dial request".into()))?;
        stream.wait_open().await?;

        let request: DialRequest = match SignalCodec::decode_frame(&frame) {
            Ok(request) => request,
            Err(e) => {
                let failure = DialFailure {
                    op: "dial".to_string(),
                    network: String::new(),
                    address: String::new(),
                    code: ErrorCode::Other,
                    message: format!("malformed dial request: {}", e),
                };
                respond(&stream, DialResponse::failed(failure)).await?;
                return Err(ForwarderError::Protocol(e.to_string()));
            }
        };

        tracing::debug!(
            stream_id = stream.id(),
            network = %request.network,
            address = %request.address,
            "Dial request"
        );

        let destination = match self.connect(&request).await {
            Ok(destination) => destination,
            Err(failure) => {
                tracing::debug!(
                    stream_id = stream.id(),
                    address = %request.address,
                    "Destination unreachable: {}",
                    failure.message
                );
                let message = failure.message.clone();
                respond(&stream, DialResponse::failed(failure)).await?;
                return Err(ForwarderError::Destination(message));
            }
        };
        respond(&stream, DialResponse::accepted()).await?;

        let stream_id = stream.id();
        let (to_destination, to_stream) = copy(stream, destination, shutdown).await?;

        tracing::info!(
            stream_id,
            address = %request.address,
            bytes_to_destination = to_destination,
            bytes_to_stream = to_stream,
            "TCP forward completed"
        );
        Ok((to_destination, to_stream))
    }

    async fn connect(&self, request: &DialRequest) -> Result<TcpStream, DialFailure> {
        let failure = |code: ErrorCode, message: String| DialFailure {
            op: "dial".to_string(),
            network: request.network.clone(),
            address: request.address.clone(),
            code,
            message,
        };

        if !SUPPORTED_NETWORKS.contains(&request.network.as_str()) {
            return Err(failure(
                ErrorCode::UnsupportedNetwork,
                format!("unsupported network {}", request.network),
            ));
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(request.address.as_str())
            .await
            .map_err(|e| failure(ErrorCode::HostNotFound, e.to_string()))?
            .filter(|addr| match request.network.as_str() {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            })
            .collect();

        if addrs.is_empty() {
            return Err(failure(
                ErrorCode::AddrNotAvailable,
                "no suitable address found".to_string(),
            ));
        }

        let connect = TcpStream::connect(addrs.as_slice());
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(DialFailure::from_io(
                "dial",
                &request.network,
                &request.address,
                &e,
            )),
            Err(_) => Err(failure(ErrorCode::TimedOut, "i/o timeout".to_string())),
        }
    }
}

async fn respond(stream: &DataChannelStream, response: DialResponse) -> Result<(), ForwarderError> {
    let text = SignalCodec::encode_frame(&response)
        .map_err(|e| ForwarderError::Protocol(e.to_string()))?;
    stream.send_text(text).await?;
    Ok(())
}

/// Copy until either direction finishes.
///
/// Data channels have no half-close, so the first direction to reach
/// end-of-stream ends both: its peer is shut down after the copied data, and
/// dropping the halves closes the destination socket and the channel.
async fn copy(
    stream: DataChannelStream,
    mut destination: TcpStream,
    shutdown: CancellationToken,
) -> Result<(u64, u64), ForwarderError> {
    let stream_id = stream.id();
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    let (mut dest_read, mut dest_write) = destination.split();

    let to_destination = async {
        tokio::io::copy(&mut stream_read, &mut dest_write).await?;
        dest_write.shutdown().await
    };
    let to_stream = async {
        tokio::io::copy(&mut dest_read, &mut stream_write).await?;
        stream_write.shutdown().await
    };

    let result = tokio::select! {
        result = to_destination => {
            tracing::debug!(stream_id, "Stream closed by dialer");
            result
        }
        result = to_stream => {
            tracing::debug!(stream_id, "Destination closed the connection");
            result
        }
        _ = shutdown.cancelled() => {
            tracing::debug!(stream_id, "Session ended, closing destination");
            Ok(())
        }
    };

    let stream = stream_read.unsplit(stream_write);
    match result {
        Ok(()) => Ok((stream.bytes_received(), stream.bytes_sent())),
        // The dialer hanging up mid-copy is not a forwarding failure
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            Ok((stream.bytes_received(), stream.bytes_sent()))
        }
        Err(e) => Err(ForwarderError::Io(e)),
    }
}
