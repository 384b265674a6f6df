//! Listener view over the registry
//!
//! The forwarding pipeline treats a tunnel like a listening socket: each
//! `accept` yields one leased stream, which it then speaks HTTP/1.1 over.

use async_trait::async_trait;
use backhaul_proto::TunnelIdentity;
use backhaul_transport::{Lease, TransportListener};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::TunnelRegistry;
use crate::TunnelError;

/// Default bound on waiting for a tunnel stream
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts leased tunnel streams for one identity
#[derive(Debug)]
pub struct TunnelListener {
    registry: TunnelRegistry,
    identity: TunnelIdentity,
    wait_timeout: Duration,
    closed: CancellationToken,
}

impl TunnelListener {
    pub fn new(registry: TunnelRegistry, identity: TunnelIdentity) -> Self {
        let closed = registry.shutdown_token().child_token();
        Self {
            registry,
            identity,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            closed,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl TransportListener for TunnelListener {
    type Connection = TunnelConnection;
    type Error = TunnelError;

    async fn accept(&self) -> Result<TunnelConnection, TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::ListenerClosed);
        }

        let pair = self.registry.channel_pair(&self.identity);
        let result = pair.claim(self.wait_timeout, &self.closed).await;
        drop(pair);

        let lease = match result {
            Ok(lease) => lease,
            Err(e) => {
                if matches!(e, TunnelError::Timeout) {
                    self.registry.prune(&self.identity);
                }
                debug!(identity = %self.identity, "Tunnel accept failed: {}", e);
                return Err(e);
            }
        };

        let connection = TunnelConnection::new(lease, self.identity.clone());
        debug!(
            identity = %self.identity,
            connection_id = %connection.connection_id(),
            stream_id = %connection.stream_id(),
            "Accepted tunnel connection"
        );
        Ok(connection)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// A leased tunnel stream presented as an accepted connection
///
/// Dropping it ends the logical exchange and returns the stream to its
/// endpoint handler for reset.
#[derive(Debug)]
pub struct TunnelConnection {
    lease: Lease,
    identity: TunnelIdentity,
    connection_id: String,
}

impl TunnelConnection {
    fn new(lease: Lease, identity: TunnelIdentity) -> Self {
        Self {
            lease,
            identity,
            connection_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.identity
    }

    /// Id of the physical stream this exchange runs on
    pub fn stream_id(&self) -> &str {
        self.lease.stream_id()
    }

    /// Tear down the underlying physical connection
    pub fn abort(&self) {
        self.lease.abort();
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.lease).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.lease).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.lease).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.lease).poll_shutdown(cx)
    }
}
