//! `tunnel.json` loading and validation

use backhaul_proto::{TransportKind, TunnelIdentity};
pub use backhaul_transport::link::DEFAULT_HEARTBEAT_INTERVAL;
use backhaul_transport::TunnelTarget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Reconnect delay used when the config gives none
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid server URL {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("Invalid tunnel name {0:?}")]
    InvalidName(String),

    #[error("Proxy rule #{index}: {reason}")]
    InvalidRule { index: usize, reason: String },
}

/// Agent tunnel configuration, as stored in `tunnel.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Shared secret presented to the gateway
    pub token: String,

    /// Transport used to reach the gateway
    #[serde(rename = "type")]
    pub transport: TransportKind,

    /// Gateway base URL (`http(s)://` or `ws(s)://`)
    pub server_url: String,

    /// Tunnel identity; end users reach this tunnel with it as their `Host`
    pub name: String,

    /// Seconds between reconnect attempts; zero or negative means default
    #[serde(default)]
    pub reconnect_interval: Option<i64>,

    /// Seconds between heartbeats; zero or negative means default
    #[serde(default)]
    pub heartbeat_interval: Option<i64>,

    #[serde(default)]
    pub proxy: Vec<ProxyRule>,
}

/// Maps a path prefix to a local upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRule {
    /// Host header to send upstream instead of the original one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Path prefix; empty means the catch-all `/`
    #[serde(default)]
    pub route: String,

    /// Upstream base URL
    pub local_remote: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn interval_or(seconds: Option<i64>, default: Duration) -> Duration {
    match seconds {
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => default,
    }
}

impl TunnelConfig {
    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a config document
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let mut config: TunnelConfig = serde_json::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for rule in &mut self.proxy {
            let route = rule.route.trim();
            rule.route = if route.is_empty() {
                "/".to_string()
            } else {
                route.to_string()
            };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingField("token"));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name"));
        }
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingField("serverUrl"));
        }

        self.server_url()?;
        self.identity()?;

        for (index, rule) in self.proxy.iter().enumerate() {
            rule.validate()
                .map_err(|reason| ConfigError::InvalidRule { index, reason })?;
        }

        Ok(())
    }

    pub fn server_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(self.server_url.trim()).map_err(|e| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: format!("unsupported scheme {:?}", other),
            }),
        }
    }

    pub fn identity(&self) -> Result<TunnelIdentity, ConfigError> {
        TunnelIdentity::from_host(&self.name).ok_or_else(|| ConfigError::InvalidName(self.name.clone()))
    }

    /// Where and as whom to dial the gateway
    pub fn target(&self) -> Result<TunnelTarget, ConfigError> {
        Ok(TunnelTarget {
            server_url: self.server_url()?,
            identity: self.identity()?,
            password: Some(self.token.clone()),
        })
    }

    pub fn reconnect_interval(&self) -> Duration {
        interval_or(self.reconnect_interval, DEFAULT_RECONNECT_INTERVAL)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        interval_or(self.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl ProxyRule {
    fn validate(&self) -> Result<(), String> {
        if !self.route.starts_with('/') {
            return Err(format!("route {:?} must start with '/'", self.route));
        }

        let url = Url::parse(self.local_remote.trim())
            .map_err(|e| format!("invalid localRemote {:?}: {}", self.local_remote, e))?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(format!(
                    "localRemote {:?} has unsupported scheme {:?}",
                    self.local_remote, other
                ))
            }
        }
        if url.host_str().is_none() {
            return Err(format!("localRemote {:?} has no host", self.local_remote));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "token": "s3cret",
        "type": "h2",
        "serverUrl": "https://gateway.example.com",
        "name": "App.Example.com",
        "reconnectInterval": 10,
        "heartbeatInterval": 15,
        "proxy": [
            { "route": "/api", "localRemote": "http://127.0.0.1:8080", "description": "api" },
            { "route": "", "localRemote": "ws://127.0.0.1:3000", "host": "frontend.local" },
            { "route": "/old", "localRemote": "http://127.0.0.1:9000", "enabled": false }
        ]
    }"#;

    #[test]
    fn test_parse_valid_config() {
        let config = TunnelConfig::from_json(VALID).unwrap();
        assert_eq!(config.transport, TransportKind::H2);
        assert_eq!(config.identity().unwrap().as_str(), "app.example.com");
        assert_eq!(config.reconnect_interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));

        assert_eq!(config.proxy.len(), 3);
        assert!(config.proxy[0].enabled);
        assert_eq!(config.proxy[1].route, "/");
        assert_eq!(config.proxy[1].host.as_deref(), Some("frontend.local"));
        assert!(!config.proxy[2].enabled);

        let target = config.target().unwrap();
        assert_eq!(target.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_interval_defaults() {
        let config = TunnelConfig::from_json(
            r#"{"token":"t","type":"ws","serverUrl":"ws://gw","name":"app",
                "reconnectInterval":0,"heartbeatInterval":-3}"#,
        )
        .unwrap();
        assert_eq!(config.reconnect_interval(), DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(config.heartbeat_interval(), DEFAULT_HEARTBEAT_INTERVAL);

        let config =
            TunnelConfig::from_json(r#"{"token":"t","type":"ws","serverUrl":"ws://gw","name":"app"}"#)
                .unwrap();
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.proxy.is_empty());
    }

    #[test]
    fn test_required_fields() {
        let missing_token = r#"{"token":"","type":"h2","serverUrl":"http://gw","name":"app"}"#;
        assert!(matches!(
            TunnelConfig::from_json(missing_token),
            Err(ConfigError::MissingField("token"))
        ));

        let missing_name = r#"{"token":"t","type":"h2","serverUrl":"http://gw","name":" "}"#;
        assert!(matches!(
            TunnelConfig::from_json(missing_name),
            Err(ConfigError::MissingField("name"))
        ));

        let absent_type = r#"{"token":"t","serverUrl":"http://gw","name":"app"}"#;
        assert!(matches!(
            TunnelConfig::from_json(absent_type),
            Err(ConfigError::Parse(_))
        ));

        let bad_type = r#"{"token":"t","type":"quic","serverUrl":"http://gw","name":"app"}"#;
        assert!(matches!(
            TunnelConfig::from_json(bad_type),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_server_url_scheme() {
        let ftp = r#"{"token":"t","type":"h2","serverUrl":"ftp://gw","name":"app"}"#;
        assert!(matches!(
            TunnelConfig::from_json(ftp),
            Err(ConfigError::InvalidServerUrl { .. })
        ));
    }

    #[test]
    fn test_rule_validation() {
        let bad_route = r#"{"token":"t","type":"h2","serverUrl":"http://gw","name":"app",
            "proxy":[{"route":"api","localRemote":"http://127.0.0.1:1"}]}"#;
        assert!(matches!(
            TunnelConfig::from_json(bad_route),
            Err(ConfigError::InvalidRule { index: 0, .. })
        ));

        let bad_remote = r#"{"token":"t","type":"h2","serverUrl":"http://gw","name":"app",
            "proxy":[{"route":"/","localRemote":"http://127.0.0.1:1"},
                     {"route":"/x","localRemote":"tcp://127.0.0.1:1"}]}"#;
        assert!(matches!(
            TunnelConfig::from_json(bad_remote),
            Err(ConfigError::InvalidRule { index: 1, .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = TunnelConfig::load("/nonexistent/tunnel.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
