//! Signaling socket configuration

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use peerlink_proto::DEFAULT_SIGNALING_PATH;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::error::{SignalingError, SignalingResult};
use crate::tls;

/// Configuration shared by the signaling listener and connector
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Server certificate path (for servers, enables `wss://`)
    pub server_cert_path: Option<String>,

    /// Server private key path (for servers)
    pub server_key_path: Option<String>,

    /// WebSocket path the listener accepts (e.g., "/signal")
    pub path: String,

    /// Access token: required by the listener, appended by the connector
    pub token: Option<String>,

    /// Verify the server certificate on `wss://` connections
    pub verify_server_cert: bool,

    /// Additional trusted roots (DER). Empty means the webpki roots.
    pub root_certs: Vec<Vec<u8>>,

    /// Upper bound for TCP accept + TLS + upgrade on the listener side
    pub handshake_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,
}

impl SignalingConfig {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            server_cert_path: None,
            server_key_path: None,
            path: DEFAULT_SIGNALING_PATH.to_string(),
            token: None,
            verify_server_cert: true,
            root_certs: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024, // 1MB
        }
    }

    /// Create a client configuration for local development (skip cert verification)
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Create a plain `ws://` server configuration
    pub fn server_default() -> Self {
        Self::client_default()
    }

    /// Create a `wss://` server configuration with certificate paths
    pub fn server_tls(cert_path: &str, key_path: &str) -> Self {
        Self {
            server_cert_path: Some(cert_path.to_string()),
            server_key_path: Some(key_path.to_string()),
            ..Self::client_default()
        }
    }

    /// Set WebSocket path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Set access token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Trust an additional root certificate (DER encoded)
    pub fn with_root_cert(mut self, der: Vec<u8>) -> Self {
        self.root_certs.push(der);
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    /// Whether the listener terminates TLS
    pub fn is_tls(&self) -> bool {
        self.server_cert_path.is_some()
    }

    pub fn validate(&self) -> SignalingResult<()> {
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(SignalingError::ConfigurationError(
                "WebSocket path must start with '/'".to_string(),
            ));
        }
        if self.server_cert_path.is_some() != self.server_key_path.is_some() {
            return Err(SignalingError::ConfigurationError(
                "Server cert and key must be configured together".to_string(),
            ));
        }
        if matches!(&self.token, Some(t) if t.is_empty()) {
            return Err(SignalingError::ConfigurationError(
                "Access token must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }

    /// Build rustls TlsConnector for client
    pub(crate) fn build_tls_connector(&self) -> SignalingResult<tokio_rustls::TlsConnector> {
        let client_crypto = tls::client_config(self.verify_server_cert, &self.root_certs)
            .map_err(SignalingError::ConfigurationError)?;
        Ok(tokio_rustls::TlsConnector::from(client_crypto))
    }

    /// Build rustls TlsAcceptor for server, `None` for plain `ws://`
    pub(crate) fn build_tls_acceptor(&self) -> SignalingResult<Option<tokio_rustls::TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.server_cert_path, &self.server_key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Ok(None),
        };

        tls::ensure_crypto_provider();

        let certs = tls::load_certs(Path::new(cert_path)).map_err(SignalingError::TlsError)?;
        let key = tls::load_private_key(Path::new(key_path)).map_err(SignalingError::TlsError)?;

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| SignalingError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(
            server_crypto,
        ))))
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self::client_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = SignalingConfig::client_default();
        assert_eq!(config.path, "/");
        assert!(config.verify_server_cert);
        assert!(!config.is_tls());
    }

    #[test]
    fn test_config_validation() {
        let config = SignalingConfig::client_default().with_token("secret");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_path_validation() {
        let config = SignalingConfig::client_default().with_path("invalid");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let mut config = SignalingConfig::server_tls("cert.pem", "key.pem");
        config.server_key_path = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_token_is_rejected() {
        let config = SignalingConfig::server_default().with_token("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plain_server_has_no_acceptor() {
        let acceptor = SignalingConfig::server_default().build_tls_acceptor().unwrap();
        assert!(acceptor.is_none());
    }

    #[test]
    fn test_missing_cert_file() {
        let result = SignalingConfig::server_tls("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .build_tls_acceptor();
        assert!(matches!(result, Err(SignalingError::TlsError(_))));
    }
}
