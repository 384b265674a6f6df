//! Tunnel identities and transport kinds

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{TUNNEL_H2_PATH, TUNNEL_WS_PATH};

/// Key under which an agent's tunnel is registered and looked up
///
/// Derived from a host name: lowercased, trimmed, with any `:port` suffix
/// removed, so `App.Example.com:443` and `app.example.com` are the same
/// tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelIdentity(String);

impl TunnelIdentity {
    /// Derive an identity from a host or `Host` header value
    ///
    /// Returns `None` when nothing is left after normalization.
    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.trim();

        let name = if host.starts_with('[') {
            // Bracketed IPv6 literal, optionally followed by a port
            match host.find(']') {
                Some(end) => &host[..=end],
                None => host,
            }
        } else {
            match host.rsplit_once(':') {
                Some((name, port))
                    if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
                {
                    name
                }
                _ => host,
            }
        };

        if name.is_empty() {
            return None;
        }

        Some(Self(name.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TunnelIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Physical transport carrying a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One long-lived HTTP/2 request/response body pair
    H2,
    /// One WebSocket connection
    Ws,
}

impl TransportKind {
    /// Gateway route for this transport
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            TransportKind::H2 => TUNNEL_H2_PATH,
            TransportKind::Ws => TUNNEL_WS_PATH,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::H2 => "h2",
            TransportKind::Ws => "ws",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h2" => Ok(TransportKind::H2),
            "ws" => Ok(TransportKind::Ws),
            other => Err(format!("unknown transport type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_normalization() {
        let id = TunnelIdentity::from_host("  App.Example.COM:8443 ").unwrap();
        assert_eq!(id.as_str(), "app.example.com");

        let plain = TunnelIdentity::from_host("app.example.com").unwrap();
        assert_eq!(id, plain);
    }

    #[test]
    fn test_identity_ipv6() {
        let id = TunnelIdentity::from_host("[::1]:8080").unwrap();
        assert_eq!(id.as_str(), "[::1]");

        let bare = TunnelIdentity::from_host("[::1]").unwrap();
        assert_eq!(bare.as_str(), "[::1]");
    }

    #[test]
    fn test_identity_empty() {
        assert!(TunnelIdentity::from_host("").is_none());
        assert!(TunnelIdentity::from_host("   ").is_none());
        assert!(TunnelIdentity::from_host(":80").is_none());
    }

    #[test]
    fn test_identity_keeps_non_numeric_suffix() {
        let id = TunnelIdentity::from_host("my-agent:token").unwrap();
        assert_eq!(id.as_str(), "my-agent:token");
    }

    #[test]
    fn test_transport_kind_serde() {
        let kind: TransportKind = serde_json::from_str("\"ws\"").unwrap();
        assert_eq!(kind, TransportKind::Ws);
        assert_eq!(serde_json::to_string(&TransportKind::H2).unwrap(), "\"h2\"");
        assert!(serde_json::from_str::<TransportKind>("\"quic\"").is_err());
    }

    #[test]
    fn test_transport_kind_paths() {
        assert_eq!(TransportKind::H2.endpoint_path(), "/tunnel/h2");
        assert_eq!(TransportKind::Ws.endpoint_path(), "/tunnel/ws");
        assert_eq!("H2".parse::<TransportKind>().unwrap(), TransportKind::H2);
    }
}
