//! Outbound TCP dialing for URLs

use std::time::Duration;
use tokio::net::TcpStream;
use url::{Host, Url};

use crate::{TransportError, TransportResult};

/// Host (without IPv6 brackets) and port to dial for a URL
pub fn host_and_port(url: &Url) -> TransportResult<(String, u16)> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => {
            return Err(TransportError::ConfigurationError(format!(
                "URL has no host: {}",
                url
            )))
        }
    };

    let port = url.port_or_known_default().ok_or_else(|| {
        TransportError::ConfigurationError(format!("URL has no port: {}", url))
    })?;

    Ok((host, port))
}

/// Open a TCP connection to the URL's host within `timeout`
pub async fn connect_tcp(url: &Url, timeout: Duration) -> TransportResult<TcpStream> {
    let (host, port) = host_and_port(url)?;

    let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| {
            TransportError::ConnectionError(format!("Failed to connect to {}:{}: {}", host, port, e))
        })?;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}
