//! Transport selection for the configured tunnel type

use backhaul_proto::TransportKind;
use backhaul_transport::{TransportConnector, TransportResult};
use backhaul_transport_h2::H2Connector;
use backhaul_transport_websocket::WebSocketConnector;
use std::sync::Arc;

/// Build the connector for a transport kind
pub fn for_kind(kind: TransportKind) -> TransportResult<Arc<dyn TransportConnector>> {
    let connector: Arc<dyn TransportConnector> = match kind {
        TransportKind::H2 => Arc::new(H2Connector::new()?),
        TransportKind::Ws => Arc::new(WebSocketConnector::new()?),
    };
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_matches_kind() {
        assert_eq!(for_kind(TransportKind::H2).unwrap().kind(), TransportKind::H2);
        assert_eq!(for_kind(TransportKind::Ws).unwrap().kind(), TransportKind::Ws);
    }
}
