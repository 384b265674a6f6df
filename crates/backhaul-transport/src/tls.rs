//! Client-side TLS configuration shared by the dialers

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

use crate::{TransportError, TransportResult};

/// Build a rustls client config trusting the webpki root store
///
/// `alpn` lists the protocols to offer, e.g. `[b"h2"]` for HTTP/2 tunnels.
pub fn client_config(alpn: &[&[u8]]) -> TransportResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::TlsError(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Parse a host into a TLS server name
pub fn server_name(host: &str) -> TransportResult<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::TlsError(format!("Invalid server name {}: {}", host, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_alpn() {
        let config = client_config(&[b"h2"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("gateway.example.com").is_ok());
        assert!(server_name("[::1]").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
