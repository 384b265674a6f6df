//! Agent side of the WebSocket transport

use async_trait::async_trait;
use backhaul_proto::{Frame, TransportKind};
use backhaul_transport::{
    spawn_link, tls, DuplexStream, LinkContext, TransportConnector, TransportError,
    TransportResult, TunnelTarget,
};
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::Connector;
use tracing::{debug, info, trace};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials the gateway's WebSocket tunnel endpoint
#[derive(Clone)]
pub struct WebSocketConnector {
    tls_config: Arc<ClientConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector").finish()
    }
}

impl WebSocketConnector {
    pub fn new() -> TransportResult<Self> {
        let tls_config = tls::client_config(&[b"http/1.1"])?;
        debug!("WebSocket connector created");
        Ok(Self { tls_config })
    }

    pub fn with_tls_config(config: ClientConfig) -> Self {
        Self {
            tls_config: Arc::new(config),
        }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(
        &self,
        target: &TunnelTarget,
        ctx: LinkContext,
    ) -> TransportResult<DuplexStream> {
        let url = target.endpoint_url(TransportKind::Ws)?;
        debug!("Connecting to WebSocket tunnel endpoint: {}", redacted(&url));

        let connecting = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            true,
            Some(Connector::Rustls(self.tls_config.clone())),
        );

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(handshake_error)?;

        let (sink, stream) = ws_stream.split();

        let reader = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(data)) => {
                    Some(Frame::decode(Bytes::from(data)).map_err(TransportError::from))
                }
                Ok(Message::Close(_)) => Some(Err(TransportError::StreamClosed)),
                Ok(other) => {
                    trace!("Ignoring non-binary WebSocket message: {:?}", other);
                    None
                }
                Err(e) => Some(Err(TransportError::ConnectionError(format!(
                    "WebSocket read failed: {}",
                    e
                )))),
            })
        });

        let writer = sink
            .sink_map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket send failed: {}", e))
            })
            .with(|frame: Frame| {
                future::ready(
                    frame
                        .encode()
                        .map(|bytes| Message::Binary(bytes.to_vec()))
                        .map_err(TransportError::from),
                )
            });

        let stream = spawn_link(Box::pin(reader), writer, TransportKind::Ws, ctx);
        info!(stream_id = %stream.id(), "WebSocket tunnel established to {}", redacted(&url));
        Ok(stream)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ws
    }
}

/// Map a failed upgrade onto a fatal rejection or a retryable error
fn handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            TransportError::handshake_status(response.status().as_u16(), response.status())
        }
        tungstenite::Error::Io(e) => TransportError::IoError(e),
        tungstenite::Error::Url(e) => TransportError::ConfigurationError(e.to_string()),
        other => TransportError::ConnectionError(format!("WebSocket handshake failed: {}", other)),
    }
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
