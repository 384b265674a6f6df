//! Agent side of the HTTP/2 transport

use async_trait::async_trait;
use backhaul_proto::{Frame, FrameCodec, TransportKind};
use backhaul_transport::dial::{connect_tcp, host_and_port};
use backhaul_transport::{
    spawn_link, tls, DuplexStream, LinkContext, TransportConnector, TransportError,
    TransportResult, TunnelTarget,
};
use bytes::Bytes;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use url::Url;

use crate::body::{recv_stream_body, send_all};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials the gateway's HTTP/2 tunnel endpoint
#[derive(Clone)]
pub struct H2Connector {
    tls_config: Arc<ClientConfig>,
}

impl std::fmt::Debug for H2Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connector").finish()
    }
}

impl H2Connector {
    pub fn new() -> TransportResult<Self> {
        let tls_config = tls::client_config(&[b"h2"])?;
        debug!("HTTP/2 connector created");
        Ok(Self { tls_config })
    }

    /// Use a custom TLS configuration (its ALPN list is replaced with `h2`)
    pub fn with_tls_config(config: ClientConfig) -> Self {
        let mut config = config;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            tls_config: Arc::new(config),
        }
    }
}

#[async_trait]
impl TransportConnector for H2Connector {
    async fn connect(
        &self,
        target: &TunnelTarget,
        ctx: LinkContext,
    ) -> TransportResult<DuplexStream> {
        let url = target.endpoint_url(TransportKind::H2)?;
        debug!("Connecting to HTTP/2 tunnel endpoint: {}", redacted(&url));

        let tcp = connect_tcp(&url, CONNECT_TIMEOUT).await?;

        let stream = if url.scheme() == "https" {
            let (host, _) = host_and_port(&url)?;
            let server_name = tls::server_name(&host)?;
            let tls_stream = TlsConnector::from(self.tls_config.clone())
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
            open_tunnel(tls_stream, &url, ctx).await?
        } else {
            open_tunnel(tcp, &url, ctx).await?
        };

        info!(stream_id = %stream.id(), "HTTP/2 tunnel established to {}", redacted(&url));
        Ok(stream)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::H2
    }
}

/// Run the h2 handshake over `io` and open the tunnel request
async fn open_tunnel<T>(io: T, url: &Url, ctx: LinkContext) -> TransportResult<DuplexStream>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_request, h2_conn) = h2::client::handshake(io)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

    // The connection lives until the tunnel is aborted or the peer goes away
    let abort = ctx.abort.clone();
    let keep_alive = send_request.clone();
    tokio::spawn(async move {
        let _keep_alive = keep_alive;
        tokio::select! {
            result = h2_conn => {
                if let Err(e) = result {
                    if !e.is_go_away() && !e.is_io() {
                        debug!("H2 connection error: {}", e);
                    }
                }
            }
            _ = abort.cancelled() => {}
        }
        abort.cancel();
        debug!("H2 connection closed");
    });

    let result = send_tunnel_request(send_request, url, ctx.clone()).await;
    if result.is_err() {
        ctx.abort.cancel();
    }
    result
}

async fn send_tunnel_request(
    send_request: h2::client::SendRequest<Bytes>,
    url: &Url,
    ctx: LinkContext,
) -> TransportResult<DuplexStream> {
    let mut ready = send_request.ready().await.map_err(|e| {
        TransportError::ConnectionError(format!("H2 connection not ready: {}", e))
    })?;

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(url.as_str())
        .body(())
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid tunnel URL: {}", e)))?;

    let (response, send_stream) = ready
        .send_request(request, false)
        .map_err(|e| TransportError::ConnectionError(format!("Failed to open stream: {}", e)))?;

    let response = tokio::time::timeout(HANDSHAKE_TIMEOUT, response)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionError(format!("Failed to get response: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::handshake_status(status.as_u16(), status));
    }

    let body = Box::pin(recv_stream_body(response.into_body()));
    let reader = FramedRead::new(StreamReader::new(body), FrameCodec).map_err(TransportError::from);

    let writer = Box::pin(futures::sink::unfold(
        send_stream,
        |mut send, frame: Frame| async move {
            let bytes = frame.encode().map_err(TransportError::from)?;
            send_all(&mut send, bytes).await?;
            Ok::<_, TransportError>(send)
        },
    ));

    Ok(spawn_link(reader, writer, TransportKind::H2, ctx))
}

/// Endpoint URL without the password query value, for logs
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
