//! Relay and reflexive server configuration

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port for `stun:` and `turn:` URLs.
pub const DEFAULT_PORT: u16 = 3478;

/// Default port for `stuns:` and `turns:` URLs.
pub const DEFAULT_TLS_PORT: u16 = 5349;

/// One configured STUN/TURN server, possibly reachable through several URLs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }

    /// Parse every URL of this entry.
    pub fn parsed_urls(&self) -> Result<Vec<IceUrl>, IceUrlError> {
        self.urls.iter().map(|u| IceUrl::parse(u)).collect()
    }

    /// True when at least one URL points at a TURN relay.
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .filter_map(|u| IceUrl::parse(u).ok())
            .any(|u| u.scheme.is_relay())
    }
}

/// Which candidates the peer connection may use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IceTransportPolicy {
    #[default]
    All,
    /// Only relayed candidates; forces traffic through a TURN server.
    Relay,
}

/// URL scheme of an ICE server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl Scheme {
    /// Secured variant (TLS on the control connection).
    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Stuns | Scheme::Turns)
    }

    pub fn is_relay(self) -> bool {
        matches!(self, Scheme::Turn | Scheme::Turns)
    }

    /// The same role with the other security setting.
    pub fn counterpart(self) -> Scheme {
        match self {
            Scheme::Stun => Scheme::Stuns,
            Scheme::Stuns => Scheme::Stun,
            Scheme::Turn => Scheme::Turns,
            Scheme::Turns => Scheme::Turn,
        }
    }

    pub fn default_port(self) -> u16 {
        if self.is_secure() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Stun => "stun",
            Scheme::Stuns => "stuns",
            Scheme::Turn => "turn",
            Scheme::Turns => "turns",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport used to reach the ICE server itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IceProto {
    Udp,
    Tcp,
}

impl fmt::Display for IceProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceProto::Udp => f.write_str("udp"),
            IceProto::Tcp => f.write_str("tcp"),
        }
    }
}

/// URL parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IceUrlError {
    #[error("Unknown ICE URL scheme in {0:?}")]
    UnknownScheme(String),

    #[error("Missing host in {0:?}")]
    MissingHost(String),

    #[error("Invalid port in {0:?}")]
    InvalidPort(String),

    #[error("Invalid transport in {0:?}")]
    InvalidTransport(String),

    #[error("Query not allowed for STUN URL {0:?}")]
    UnexpectedQuery(String),
}

/// A parsed `stun:`, `stuns:`, `turn:` or `turns:` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub proto: IceProto,
}

impl IceUrl {
    pub fn parse(raw: &str) -> Result<Self, IceUrlError> {
        let (scheme_str, rest) = raw
            .split_once(':')
            .ok_or_else(|| IceUrlError::UnknownScheme(raw.to_string()))?;

        let scheme = match scheme_str.to_ascii_lowercase().as_str() {
            "stun" => Scheme::Stun,
            "stuns" => Scheme::Stuns,
            "turn" => Scheme::Turn,
            "turns" => Scheme::Turns,
            _ => return Err(IceUrlError::UnknownScheme(raw.to_string())),
        };

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let (host, port) = split_host_port(authority, raw)?;
        let port = port.unwrap_or_else(|| scheme.default_port());

        let proto = match query {
            None => {
                if scheme.is_secure() {
                    IceProto::Tcp
                } else {
                    IceProto::Udp
                }
            }
            Some(_) if !scheme.is_relay() => {
                return Err(IceUrlError::UnexpectedQuery(raw.to_string()))
            }
            Some(q) => match q.strip_prefix("transport=") {
                Some("udp") if !scheme.is_secure() => IceProto::Udp,
                Some("tcp") => IceProto::Tcp,
                _ => return Err(IceUrlError::InvalidTransport(raw.to_string())),
            },
        };

        Ok(Self {
            scheme,
            host,
            port,
            proto,
        })
    }

    /// `host:port` suitable for socket address resolution.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn split_host_port(authority: &str, raw: &str) -> Result<(String, Option<u16>), IceUrlError> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| IceUrlError::InvalidPort(raw.to_string()))
    };

    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, after) = stripped
            .split_once(']')
            .ok_or_else(|| IceUrlError::MissingHost(raw.to_string()))?;
        if host.is_empty() {
            return Err(IceUrlError::MissingHost(raw.to_string()));
        }
        let port = match after.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if after.is_empty() => None,
            None => return Err(IceUrlError::InvalidPort(raw.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, Some(parse_port(p)?)),
        None => (authority, None),
    };

    if host.is_empty() || host.contains(':') {
        return Err(IceUrlError::MissingHost(raw.to_string()));
    }

    Ok((host.to_string(), port))
}

impl fmt::Display for IceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.host_port())?;
        if self.scheme.is_relay() {
            write!(f, "?transport={}", self.proto)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_defaults() {
        let url = IceUrl::parse("turn:relay.example.com").unwrap();
        assert_eq!(url.scheme, Scheme::Turn);
        assert_eq!(url.host, "relay.example.com");
        assert_eq!(url.port, 3478);
        assert_eq!(url.proto, IceProto::Udp);
    }

    #[test]
    fn test_parse_turns_defaults_to_tcp() {
        let url = IceUrl::parse("turns:relay.example.com").unwrap();
        assert_eq!(url.port, 5349);
        assert_eq!(url.proto, IceProto::Tcp);
        assert!(url.scheme.is_secure());
    }

    #[test]
    fn test_parse_transport_query() {
        let url = IceUrl::parse("turn:127.0.0.1:3479?transport=tcp").unwrap();
        assert_eq!(url.port, 3479);
        assert_eq!(url.proto, IceProto::Tcp);
        assert_eq!(url.to_string(), "turn:127.0.0.1:3479?transport=tcp");
    }

    #[test]
    fn test_parse_ipv6() {
        let url = IceUrl::parse("stun:[::1]:19302").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 19302);
        assert_eq!(url.host_port(), "[::1]:19302");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            IceUrl::parse("http://example.com"),
            Err(IceUrlError::UnknownScheme(_))
        ));
        assert!(matches!(
            IceUrl::parse("turn:host:notaport"),
            Err(IceUrlError::InvalidPort(_))
        ));
        assert!(matches!(
            IceUrl::parse("turn:host?transport=sctp"),
            Err(IceUrlError::InvalidTransport(_))
        ));
        assert!(matches!(
            IceUrl::parse("turns:host?transport=udp"),
            Err(IceUrlError::InvalidTransport(_))
        ));
        assert!(matches!(
            IceUrl::parse("stun:host?transport=tcp"),
            Err(IceUrlError::UnexpectedQuery(_))
        ));
        assert!(matches!(
            IceUrl::parse("stun:"),
            Err(IceUrlError::MissingHost(_))
        ));
    }

    #[test]
    fn test_scheme_counterpart() {
        assert_eq!(Scheme::Turn.counterpart(), Scheme::Turns);
        assert_eq!(Scheme::Stuns.counterpart(), Scheme::Stun);
    }

    #[test]
    fn test_server_is_relay() {
        let stun = IceServer::new("stun:stun.example.com");
        assert!(!stun.is_relay());

        let turn = stun.clone().with_url("turn:relay.example.com");
        assert!(turn.is_relay());
        assert_eq!(turn.parsed_urls().unwrap().len(), 2);
    }
}
