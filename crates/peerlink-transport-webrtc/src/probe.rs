//! Direct STUN/TURN reachability checks.
//!
//! ICE only reports that no candidate pair worked. When a handshake fails with
//! relay servers configured, each server is probed on its own: a binding
//! request for `stun:`/`stuns:`, an authenticated allocation for
//! `turn:`/`turns:`. The outcome tells invalid credentials apart from a scheme
//! that does not match what the server speaks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use peerlink_proto::{IceProto, IceServer, IceUrl, Scheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use webrtc::stun::agent::TransactionId;
use webrtc::stun::attributes::{ATTR_NONCE, ATTR_REALM, ATTR_USERNAME};
use webrtc::stun::error_code::ErrorCodeAttribute;
use webrtc::stun::fingerprint::FINGERPRINT;
use webrtc::stun::integrity::MessageIntegrity;
use webrtc::stun::message::{
    Getter, Message, MessageType, Setter, BINDING_REQUEST, CLASS_ERROR_RESPONSE, CLASS_REQUEST,
    CLASS_SUCCESS_RESPONSE, METHOD_ALLOCATE, METHOD_REFRESH,
};
use webrtc::stun::textattrs::TextAttribute;
use webrtc::stun::xoraddr::XorMappedAddress;
use webrtc::turn::proto::lifetime::Lifetime;
use webrtc::turn::proto::reqtrans::RequestedTransport;
use webrtc::turn::proto::PROTO_UDP;

use crate::error::NegotiationError;

const STUN_HEADER_SIZE: usize = 20;
const MAX_DATAGRAM: usize = 1500;
const INITIAL_RTO: Duration = Duration::from_millis(250);
/// Least time given to the TLS check after a failed `turn:` UDP attempt
const TLS_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

const CODE_BAD_REQUEST: u16 = 400;
const CODE_UNAUTHORIZED: u16 = 401;
const CODE_INTEGRITY_FAILURE: u16 = 431;
const CODE_WRONG_CREDENTIALS: u16 = 441;
const CODE_STALE_NONCE: u16 = 438;

/// How a probe is run
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Deadline for each URL, connection setup included
    pub timeout: Duration,
    /// Verify the certificate of `stuns:`/`turns:` servers
    pub verify_server_cert: bool,
    /// Extra DER-encoded roots trusted for secure schemes
    pub root_certs: Vec<Vec<u8>>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            verify_server_cert: true,
            root_certs: Vec::new(),
        }
    }
}

impl ProbeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }
}

/// A successful probe of one server URL
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub url: IceUrl,
    pub rtt: Duration,
    /// Reflexive address (STUN) or relayed allocation's mapped address (TURN)
    pub mapped_address: Option<SocketAddr>,
}

/// Probe every URL of `server` in order, stopping at the first failure
pub async fn probe_ice_server(
    server: &IceServer,
    options: &ProbeOptions,
) -> Result<Vec<ProbeReport>, NegotiationError> {
    let urls = server
        .parsed_urls()
        .map_err(|e| NegotiationError::Failed(format!("invalid ICE server URL: {}", e)))?;

    let mut reports = Vec::with_capacity(urls.len());
    for url in urls {
        let report = probe_ice_url(
            &url,
            server.username.as_deref(),
            server.credential.as_deref(),
            options,
        )
        .await?;
        reports.push(report);
    }
    Ok(reports)
}

/// Probe a single server URL
pub async fn probe_ice_url(
    url: &IceUrl,
    username: Option<&str>,
    credential: Option<&str>,
    options: &ProbeOptions,
) -> Result<ProbeReport, NegotiationError> {
    let started = Instant::now();
    let deadline = started + options.timeout;
    debug!(url = %url, "Probing ICE server");

    let attempt = async {
        let mut conn = Conn::open(url, options).await?;
        let mapped_address = if url.scheme.is_relay() {
            allocate(&mut conn, url, username, credential).await?
        } else {
            binding(&mut conn, url).await?
        };
        Ok::<_, NegotiationError>(mapped_address)
    };

    let result = match tokio::time::timeout_at(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(NegotiationError::Timeout {
            url: url.to_string(),
        }),
    };

    let mapped_address = match result {
        Ok(mapped_address) => mapped_address,
        // `turn:` defaults to UDP, which a TLS-only server never answers
        Err(e @ (NegotiationError::Unreachable { .. } | NegotiationError::Timeout { .. }))
            if url.scheme == Scheme::Turn && url.proto == IceProto::Udp =>
        {
            let check_deadline = deadline.max(Instant::now() + TLS_CHECK_TIMEOUT);
            if speaks_tls(url, options, check_deadline).await {
                debug!(url = %url, "No UDP answer but the port speaks TLS");
                return Err(NegotiationError::MismatchedScheme {
                    url: url.to_string(),
                    configured: Scheme::Turn,
                    detected: Scheme::Turns,
                });
            }
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let rtt = started.elapsed();
    info!(url = %url, rtt_ms = rtt.as_millis() as u64, "ICE server reachable");
    Ok(ProbeReport {
        url: url.clone(),
        rtt,
        mapped_address,
    })
}

async fn binding(conn: &mut Conn, url: &IceUrl) -> Result<Option<SocketAddr>, NegotiationError> {
    let request = build(vec![Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;
    let response = conn.exchange(&request, url).await?;

    if response.typ.class == CLASS_ERROR_RESPONSE {
        return Err(server_error(url, &response));
    }

    let mut mapped = XorMappedAddress::default();
    mapped.get_from(&response)?;
    Ok(Some(SocketAddr::new(mapped.ip, mapped.port)))
}

async fn allocate(
    conn: &mut Conn,
    url: &IceUrl,
    username: Option<&str>,
    credential: Option<&str>,
) -> Result<Option<SocketAddr>, NegotiationError> {
    let allocate_type = MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST);

    // Unauthenticated first attempt, answered with a realm and nonce
    let request = build(vec![
        Box::new(TransactionId::new()),
        Box::new(allocate_type),
        Box::new(RequestedTransport { protocol: PROTO_UDP }),
        Box::new(FINGERPRINT),
    ])?;
    let challenge = conn.exchange(&request, url).await?;

    if challenge.typ.class == CLASS_SUCCESS_RESPONSE {
        return Ok(mapped_address(&challenge));
    }
    let code = error_code(&challenge);
    if code != Some(CODE_UNAUTHORIZED) {
        return Err(server_error(url, &challenge));
    }

    let (Some(username), Some(credential)) = (username, credential) else {
        return Err(NegotiationError::InvalidCredentials {
            url: url.to_string(),
            code: CODE_UNAUTHORIZED,
        });
    };

    let realm = TextAttribute::get_from_as(&challenge, ATTR_REALM)?.text;
    let mut nonce = TextAttribute::get_from_as(&challenge, ATTR_NONCE)?.text;
    let integrity =
        MessageIntegrity::new_long_term_integrity(username.to_string(), realm.clone(), credential.to_string());

    let mut retried = false;
    loop {
        let request = build(vec![
            Box::new(TransactionId::new()),
            Box::new(allocate_type),
            Box::new(RequestedTransport { protocol: PROTO_UDP }),
            Box::new(TextAttribute::new(ATTR_USERNAME, username.to_string())),
            Box::new(TextAttribute::new(ATTR_REALM, realm.clone())),
            Box::new(TextAttribute::new(ATTR_NONCE, nonce.clone())),
            Box::new(integrity.clone()),
            Box::new(FINGERPRINT),
        ])?;
        let response = conn.exchange(&request, url).await?;

        if response.typ.class == CLASS_SUCCESS_RESPONSE {
            let mapped = mapped_address(&response);
            release(conn, url, username, &realm, &nonce, &integrity).await;
            return Ok(mapped);
        }

        match error_code(&response) {
            Some(CODE_STALE_NONCE) if !retried => {
                retried = true;
                nonce = TextAttribute::get_from_as(&response, ATTR_NONCE)?.text;
            }
            Some(
                code @ (CODE_BAD_REQUEST
                | CODE_UNAUTHORIZED
                | CODE_INTEGRITY_FAILURE
                | CODE_WRONG_CREDENTIALS),
            ) => {
                return Err(NegotiationError::InvalidCredentials {
                    url: url.to_string(),
                    code,
                });
            }
            _ => return Err(server_error(url, &response)),
        }
    }
}

/// Drop the probe allocation right away with a zero-lifetime refresh
async fn release(
    conn: &mut Conn,
    url: &IceUrl,
    username: &str,
    realm: &str,
    nonce: &str,
    integrity: &MessageIntegrity,
) {
    let request = build(vec![
        Box::new(TransactionId::new()),
        Box::new(MessageType::new(METHOD_REFRESH, CLASS_REQUEST)),
        Box::new(Lifetime(Duration::ZERO)),
        Box::new(TextAttribute::new(ATTR_USERNAME, username.to_string())),
        Box::new(TextAttribute::new(ATTR_REALM, realm.to_string())),
        Box::new(TextAttribute::new(ATTR_NONCE, nonce.to_string())),
        Box::new(integrity.clone()),
        Box::new(FINGERPRINT),
    ]);

    let result = match request {
        Ok(request) => {
            tokio::time::timeout(INITIAL_RTO * 4, conn.exchange(&request, url))
                .await
                .ok()
        }
        Err(_) => None,
    };
    if !matches!(result, Some(Ok(_))) {
        debug!(url = %url, "Probe allocation not released; it will expire");
    }
}

fn build(setters: Vec<Box<dyn Setter>>) -> Result<Message, NegotiationError> {
    let mut msg = Message::new();
    msg.build(&setters)?;
    Ok(msg)
}

fn mapped_address(msg: &Message) -> Option<SocketAddr> {
    let mut mapped = XorMappedAddress::default();
    mapped.get_from(msg).ok()?;
    Some(SocketAddr::new(mapped.ip, mapped.port))
}

fn error_code(msg: &Message) -> Option<u16> {
    let mut code = ErrorCodeAttribute::default();
    code.get_from(msg).ok()?;
    Some(code.code.0)
}

fn server_error(url: &IceUrl, msg: &Message) -> NegotiationError {
    let mut attr = ErrorCodeAttribute::default();
    match attr.get_from(msg) {
        Ok(()) => NegotiationError::ServerError {
            url: url.to_string(),
            code: attr.code.0,
            reason: String::from_utf8_lossy(&attr.reason).into_owned(),
        },
        Err(_) => NegotiationError::Failed(format!(
            "{} answered with unexpected message {}",
            url, msg.typ
        )),
    }
}

/// Whether `url`'s host and port complete (or reject on certificate grounds)
/// a TLS handshake over TCP before `deadline`
async fn speaks_tls(url: &IceUrl, options: &ProbeOptions, deadline: Instant) -> bool {
    let handshake = async {
        let addr = resolve(url).await.ok()?;
        let tcp = TcpStream::connect(addr).await.ok()?;
        let config = peerlink_transport_websocket::tls::client_config(
            options.verify_server_cert,
            &options.root_certs,
        )
        .ok()?;
        let server_name = rustls::pki_types::ServerName::try_from(url.host.clone()).ok()?;

        Some(match TlsConnector::from(config).connect(server_name, tcp).await {
            Ok(_) => true,
            Err(e) if is_plaintext_peer(&e) => false,
            Err(e) => e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
                .is_some(),
        })
    };

    matches!(tokio::time::timeout_at(deadline, handshake).await, Ok(Some(true)))
}

/// True when the first bytes look like a TLS record header
/// (handshake, alert, change-cipher-spec or application data; major version 3)
pub(crate) fn looks_like_tls(header: &[u8]) -> bool {
    header.len() >= 2 && (0x14..=0x17).contains(&header[0]) && header[1] == 0x03
}

/// Whether a TLS handshake failure means the peer is not speaking TLS
fn is_plaintext_peer(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    ) {
        return true;
    }

    match err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(rustls::Error::InvalidMessage(_))
        | Some(rustls::Error::InappropriateMessage { .. })
        | Some(rustls::Error::InappropriateHandshakeMessage { .. }) => true,
        _ => false,
    }
}

fn mismatched(url: &IceUrl) -> NegotiationError {
    NegotiationError::MismatchedScheme {
        url: url.to_string(),
        configured: url.scheme,
        detected: url.scheme.counterpart(),
    }
}

trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

enum Conn {
    Udp(UdpSocket),
    Stream(Box<dyn ByteStream>),
}

impl Conn {
    async fn open(url: &IceUrl, options: &ProbeOptions) -> Result<Self, NegotiationError> {
        let addr = resolve(url).await?;
        let unreachable = |source: io::Error| NegotiationError::Unreachable {
            url: url.to_string(),
            source,
        };

        if url.proto == IceProto::Udp {
            let local: SocketAddr = if addr.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            };
            let socket = UdpSocket::bind(local).await.map_err(unreachable)?;
            socket.connect(addr).await.map_err(unreachable)?;
            return Ok(Conn::Udp(socket));
        }

        let tcp = TcpStream::connect(addr).await.map_err(unreachable)?;
        let _ = tcp.set_nodelay(true);
        if !url.scheme.is_secure() {
            return Ok(Conn::Stream(Box::new(tcp)));
        }

        let config: Arc<rustls::ClientConfig> = peerlink_transport_websocket::tls::client_config(
            options.verify_server_cert,
            &options.root_certs,
        )
        .map_err(NegotiationError::Failed)?;
        let server_name = rustls::pki_types::ServerName::try_from(url.host.clone())
            .map_err(|e| NegotiationError::Failed(format!("invalid TLS server name: {}", e)))?;

        match TlsConnector::from(config).connect(server_name, tcp).await {
            Ok(tls) => Ok(Conn::Stream(Box::new(tls))),
            Err(e) if is_plaintext_peer(&e) => {
                debug!(url = %url, "TLS handshake rejected: {}", e);
                Err(mismatched(url))
            }
            Err(e) => Err(NegotiationError::Tls {
                url: url.to_string(),
                source: e,
            }),
        }
    }

    /// Send `request` and wait for the response with the same transaction id
    async fn exchange(&mut self, request: &Message, url: &IceUrl) -> Result<Message, NegotiationError> {
        match self {
            Conn::Udp(socket) => exchange_udp(socket, request, url).await,
            Conn::Stream(stream) => exchange_stream(stream.as_mut(), request, url).await,
        }
    }
}

async fn resolve(url: &IceUrl) -> Result<SocketAddr, NegotiationError> {
    let mut addrs = tokio::net::lookup_host(url.host_port())
        .await
        .map_err(|source| NegotiationError::Unreachable {
            url: url.to_string(),
            source,
        })?;

    addrs.next().ok_or_else(|| NegotiationError::Unreachable {
        url: url.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
    })
}

async fn exchange_udp(
    socket: &UdpSocket,
    request: &Message,
    url: &IceUrl,
) -> Result<Message, NegotiationError> {
    let unreachable = |source: io::Error| NegotiationError::Unreachable {
        url: url.to_string(),
        source,
    };

    let mut rto = INITIAL_RTO;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        socket.send(&request.raw).await.map_err(unreachable)?;
        let retransmit_at = Instant::now() + rto;

        loop {
            let n = match tokio::time::timeout_at(retransmit_at, socket.recv(&mut buf)).await {
                Ok(result) => result.map_err(unreachable)?,
                Err(_) => break,
            };

            let mut response = Message::new();
            response.raw = buf[..n].to_vec();
            if response.decode().is_err() || response.transaction_id != request.transaction_id {
                continue;
            }
            return Ok(response);
        }

        rto *= 2;
    }
}

async fn exchange_stream(
    stream: &mut dyn ByteStream,
    request: &Message,
    url: &IceUrl,
) -> Result<Message, NegotiationError> {
    let io_error = |source: io::Error| match source.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            mismatched(url)
        }
        _ => NegotiationError::Unreachable {
            url: url.to_string(),
            source,
        },
    };

    stream.write_all(&request.raw).await.map_err(io_error)?;
    stream.flush().await.map_err(io_error)?;

    loop {
        // Two bytes first: a TLS alert is shorter than a STUN header
        let mut header = [0u8; STUN_HEADER_SIZE];
        stream.read_exact(&mut header[..2]).await.map_err(io_error)?;
        if !url.scheme.is_secure() && looks_like_tls(&header[..2]) {
            return Err(mismatched(url));
        }
        stream.read_exact(&mut header[2..]).await.map_err(io_error)?;

        let body_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut raw = Vec::with_capacity(STUN_HEADER_SIZE + body_len);
        raw.extend_from_slice(&header);
        raw.resize(STUN_HEADER_SIZE + body_len, 0);
        stream
            .read_exact(&mut raw[STUN_HEADER_SIZE..])
            .await
            .map_err(io_error)?;

        let mut response = Message::new();
        response.raw = raw;
        response.decode()?;
        if response.transaction_id == request.transaction_id {
            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_proto::Scheme;

    #[test]
    fn test_tls_record_detection() {
        // ClientHello / alert record headers
        assert!(looks_like_tls(&[0x16, 0x03, 0x01]));
        assert!(looks_like_tls(&[0x15, 0x03, 0x03]));
        // STUN binding success (0x0101) and allocate error (0x0113)
        assert!(!looks_like_tls(&[0x01, 0x01]));
        assert!(!looks_like_tls(&[0x01, 0x13]));
        assert!(!looks_like_tls(&[0x16]));
    }

    #[test]
    fn test_plaintext_peer_detection() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "tls handshake eof");
        assert!(is_plaintext_peer(&eof));

        let garbage = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidMessage(rustls::InvalidMessage::InvalidContentType),
        );
        assert!(is_plaintext_peer(&garbage));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_plaintext_peer(&refused));
    }

    #[test]
    fn test_mismatch_reports_counterpart() {
        let url = IceUrl::parse("turns:127.0.0.1:5349").unwrap();
        match mismatched(&url) {
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

    #[test]
    fn test_build_binding_request() {
        let msg = build(vec![Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)]).unwrap();
        assert_eq!(msg.typ, BINDING_REQUEST);
        assert_eq!(msg.raw.len(), STUN_HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_refused_udp_port_is_unreachable_or_timeout() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let url = IceUrl::parse(&format!("stun:127.0.0.1:{}", port)).unwrap();
        let options = ProbeOptions::default().with_timeout(Duration::from_millis(500));
        let err = probe_ice_url(&url, None, None, &options).await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Unreachable { .. } | NegotiationError::Timeout { .. }
        ));
    }
}
