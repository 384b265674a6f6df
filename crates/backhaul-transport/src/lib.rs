//! Transport abstraction layer for tunnel connections
//!
//! Every physical tunnel connection, whatever carries it (an HTTP/2
//! request/response body pair or a WebSocket), is turned into one
//! [`DuplexStream`]: a byte stream that serves one logical session at a time
//! and can be reset for the next one or aborted outright.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │ backhaul-transport-  │      │ backhaul-transport-  │
//! │ h2                   │      │ websocket            │
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            │  Stream<Frame> + Sink<Frame> │
//!            └──────────────┬───────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────┐
//! │ link pump: reader task · writer task · watchdog     │
//! └─────────────────────────────────────────────────────┘
//!                           │ mpsc<Frame>
//!                           ↓
//! ┌─────────────────────────────────────────────────────┐
//! │ DuplexStream (AsyncRead + AsyncWrite, reset, abort) │
//! │   └── Lease / LeaseCompletion                       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod dial;
pub mod flow;
pub mod lease;
pub mod link;
pub mod memory;
pub mod stream;
pub mod tls;

pub use flow::{FlowCounter, FlowDirection, FlowSink, NoopFlow};
pub use lease::{Lease, LeaseCompletion};
pub use link::{spawn_link, LinkConfig, LinkContext};
pub use stream::{AbortHandle, ConnectionStats, DuplexStream, StreamState};

use async_trait::async_trait;
use backhaul_proto::{FrameError, TransportKind, TunnelIdentity, HOST_PARAM, PASSWORD_PARAM};
use std::fmt::Debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream aborted")]
    Aborted,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl TransportError {
    /// Retrying cannot fix this without operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::AuthenticationFailed(_))
    }

    /// Classify a non-2xx answer to a tunnel handshake
    ///
    /// Only 400, 401 and 403 mean the gateway refused this tunnel outright.
    /// Other statuses (404 from a proxy in front, 429, 5xx) are retried.
    pub fn handshake_status(status: u16, display: impl std::fmt::Display) -> Self {
        match status {
            400 | 401 | 403 => TransportError::AuthenticationFailed(format!(
                "gateway rejected tunnel with {}",
                display
            )),
            _ => TransportError::ConnectionError(format!("Server returned {}", display)),
        }
    }
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => TransportError::IoError(e),
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Where and as whom an agent dials the gateway
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    /// Gateway base URL (`http(s)://` or `ws(s)://`)
    pub server_url: Url,
    /// Identity to register under
    pub identity: TunnelIdentity,
    /// Shared secret sent as the `password` query parameter
    pub password: Option<String>,
}

impl TunnelTarget {
    /// Full endpoint URL for the given transport, scheme adjusted to it
    pub fn endpoint_url(&self, kind: TransportKind) -> TransportResult<Url> {
        let mut url = self.server_url.clone();

        let scheme = match (kind, url.scheme()) {
            (TransportKind::H2, "http" | "ws") => "http",
            (TransportKind::H2, "https" | "wss") => "https",
            (TransportKind::Ws, "http" | "ws") => "ws",
            (TransportKind::Ws, "https" | "wss") => "wss",
            (_, other) => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported server URL scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            TransportError::ConfigurationError(format!("Cannot use scheme {} for {}", scheme, url))
        })?;

        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base, kind.endpoint_path()));

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair(HOST_PARAM, self.identity.as_str());
            if let Some(password) = &self.password {
                query.append_pair(PASSWORD_PARAM, password);
            }
        }

        Ok(url)
    }
}

/// Client-side: establishes outgoing tunnel connections
///
/// Used by agents to dial the gateway. A successful connect has already
/// passed the gateway's handshake.
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Dial the gateway and complete the tunnel handshake
    async fn connect(&self, target: &TunnelTarget, ctx: LinkContext)
        -> TransportResult<DuplexStream>;

    /// Transport this connector speaks
    fn kind(&self) -> TransportKind;
}

/// Server-side: the "accept a new inbound connection" contract
///
/// Implemented by the gateway's tunnel listener, which hands out leased
/// tunnel streams as if they were freshly accepted sockets.
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The connection type produced by this listener
    type Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Error returned when no connection can be produced
    type Error: std::error::Error + Send + Sync + 'static;

    /// Wait for the next connection
    async fn accept(&self) -> Result<Self::Connection, Self::Error>;

    /// Stop accepting; outstanding waits return an error
    async fn close(&self);
}
