//! Peer transport configuration

use std::time::Duration;

use peerlink_proto::{IceServer, IceTransportPolicy};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::error::{TransportError, TransportResult};

/// ICE and keep-alive settings for one peer connection
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN/TURN servers, tried in order
    pub ice_servers: Vec<IceServer>,

    /// Restrict candidates to relayed ones
    pub policy: IceTransportPolicy,

    /// Gather 127.0.0.1 / ::1 host candidates
    pub include_loopback: bool,

    /// Silence after which the connection is reported `disconnected`
    pub disconnected_timeout: Duration,

    /// Silence after which the connection is reported `failed`
    pub failed_timeout: Duration,

    /// Interval of ICE keep-alive (binding) requests
    pub keep_alive_interval: Duration,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            policy: IceTransportPolicy::All,
            include_loopback: false,
            disconnected_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(25),
            keep_alive_interval: Duration::from_secs(2),
        }
    }
}

impl RtcConfig {
    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_policy(mut self, policy: IceTransportPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_loopback(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }

    /// Set the disconnected / failed / keep-alive intervals at once
    pub fn with_ice_timeouts(
        mut self,
        disconnected: Duration,
        failed: Duration,
        keep_alive: Duration,
    ) -> Self {
        self.disconnected_timeout = disconnected;
        self.failed_timeout = failed;
        self.keep_alive_interval = keep_alive;
        self
    }

    /// Relay servers only (`turn:` / `turns:`)
    pub fn relay_servers(&self) -> impl Iterator<Item = &IceServer> {
        self.ice_servers.iter().filter(|s| s.is_relay())
    }

    pub fn validate(&self) -> TransportResult<()> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(TransportError::ConfigurationError(
                    "ICE server entry has no URLs".to_string(),
                ));
            }

            let urls = server
                .parsed_urls()
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

            let needs_credentials = urls.iter().any(|u| u.scheme.is_relay());
            if needs_credentials && (server.username.is_none() || server.credential.is_none()) {
                return Err(TransportError::ConfigurationError(format!(
                    "TURN server {} requires a username and credential",
                    server.urls.join(",")
                )));
            }
        }

        if self.policy == IceTransportPolicy::Relay && self.relay_servers().next().is_none() {
            return Err(TransportError::ConfigurationError(
                "Relay-only policy needs at least one TURN server".to_string(),
            ));
        }

        if self.failed_timeout < self.disconnected_timeout {
            return Err(TransportError::ConfigurationError(
                "ICE failed timeout must not be shorter than the disconnected timeout".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let ice_transport_policy = match self.policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        };

        RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        }
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut engine = SettingEngine::default();
        engine.set_ice_timeouts(
            Some(self.disconnected_timeout),
            Some(self.failed_timeout),
            Some(self.keep_alive_interval),
        );
        engine.set_include_loopback_candidate(self.include_loopback);
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RtcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_turn_requires_credentials() {
        let config = RtcConfig::default().with_ice_server(IceServer::new("turn:127.0.0.1:3478"));
        assert!(config.validate().is_err());

        let config = RtcConfig::default()
            .with_ice_server(IceServer::new("turn:127.0.0.1:3478").with_credentials("u", "p"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stun_needs_no_credentials() {
        let config = RtcConfig::default().with_ice_server(IceServer::new("stun:127.0.0.1"));
        assert!(config.validate().is_ok());
        assert_eq!(config.relay_servers().count(), 0);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let config = RtcConfig::default().with_ice_server(IceServer::new("turn:host:99999"));
        assert!(matches!(
            config.validate(),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_relay_policy_without_turn() {
        let config = RtcConfig::default()
            .with_ice_server(IceServer::new("stun:127.0.0.1"))
            .with_policy(IceTransportPolicy::Relay);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_order() {
        let config = RtcConfig::default().with_ice_timeouts(
            Duration::from_secs(10),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rtc_configuration_mapping() {
        let config = RtcConfig::default()
            .with_ice_server(IceServer::new("turn:127.0.0.1:3478").with_credentials("u", "p"))
            .with_policy(IceTransportPolicy::Relay);
        let rtc = config.rtc_configuration();

        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].username, "u");
        assert_eq!(rtc.ice_transport_policy, RTCIceTransportPolicy::Relay);
    }
}
