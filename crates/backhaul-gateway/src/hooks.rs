//! Per-request hooks injected into the forwarding pipeline

use backhaul_proto::TunnelIdentity;
use std::net::SocketAddr;

/// Sees the source of every end-user request before it is forwarded
///
/// Called inline on the request path, so implementations must return
/// immediately; anything slow belongs on a channel or a spawned task.
pub trait RequestClassifier: Send + Sync + 'static {
    fn classify(&self, peer: SocketAddr, identity: &TunnelIdentity);
}

/// Classifier that ignores every request
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClassifier;

impl RequestClassifier for NoopClassifier {
    fn classify(&self, _peer: SocketAddr, _identity: &TunnelIdentity) {}
}
