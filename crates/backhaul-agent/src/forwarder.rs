//! Relays tunnel requests to local upstreams
//!
//! Every request arriving on a tunnel session is matched against the proxy
//! rules, rewritten to the upstream's path, and sent over a pooled HTTP/1.1
//! connection. The upstream response streams back unchanged apart from
//! hop-by-hop headers.

use backhaul_transport::dial::{connect_tcp, host_and_port};
use backhaul_transport::{tls, TransportError};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::router::{ProxyRouter, RouteMatch};

/// Maximum number of idle pooled connections per upstream
const MAX_POOL_SIZE: usize = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that describe one hop and never cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Response body handed back to the tunnel session
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("No proxy rule matches {0}")]
    NoRoute(String),

    #[error("Failed to connect to upstream {upstream}: {reason}")]
    Connect { upstream: String, reason: String },

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("Invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TransportError),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::NoRoute(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

type Sender = http1::SendRequest<Incoming>;

/// HTTP forwarder with per-upstream connection pooling
pub struct Forwarder {
    router: ProxyRouter,
    pool: Arc<Mutex<HashMap<String, Vec<Sender>>>>,
    tls: TlsConnector,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    pub fn new(router: ProxyRouter) -> Result<Self, ForwardError> {
        let tls_config = tls::client_config(&[b"http/1.1"])?;
        Ok(Self {
            router,
            pool: Arc::new(Mutex::new(HashMap::new())),
            tls: TlsConnector::from(tls_config),
        })
    }

    pub fn router(&self) -> &ProxyRouter {
        &self.router
    }

    /// Forward a request, turning failures into 404/502 responses
    pub async fn handle(&self, request: Request<Incoming>) -> Response<ProxyBody> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        match self.forward(request).await {
            Ok(response) => {
                debug!("{} {} -> {}", method, path, response.status());
                response
            }
            Err(e) => {
                match &e {
                    ForwardError::NoRoute(_) => debug!("{} {}: {}", method, path, e),
                    _ => warn!("{} {}: {}", method, path, e),
                }
                error_response(e.status(), &e.to_string())
            }
        }
    }

    /// Forward a request to the upstream its path routes to
    pub async fn forward(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let route = self
            .router
            .resolve(request.uri().path(), request.uri().query())
            .ok_or_else(|| ForwardError::NoRoute(request.uri().path().to_string()))?;

        let request = rewrite_request(request, &route)?;
        let key = route.authority();

        let mut sender = self.checkout(&key, &route).await?;
        sender.ready().await?;
        let response = sender.send_request(request).await?;

        // Headers are in; the connection goes back once hyper frees it
        self.checkin(key, sender).await;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    async fn checkout(&self, key: &str, route: &RouteMatch) -> Result<Sender, ForwardError> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(idle) = pool.get_mut(key) {
                // Senders still streaming a previous response stay pooled
                let mut busy = Vec::new();
                let mut found = None;
                while let Some(sender) = idle.pop() {
                    if sender.is_ready() {
                        found = Some(sender);
                        break;
                    }
                    if sender.is_closed() {
                        debug!("Discarding stale connection to {}", key);
                    } else {
                        busy.push(sender);
                    }
                }
                idle.extend(busy);
                if let Some(sender) = found {
                    debug!("Reusing pooled connection to {}", key);
                    return Ok(sender);
                }
            }
        }

        debug!("Creating new connection to {}", key);
        self.connect(&route.upstream).await
    }

    async fn checkin(&self, key: String, sender: Sender) {
        if sender.is_closed() {
            return;
        }

        let mut pool = self.pool.lock().await;
        let idle = pool.entry(key).or_default();
        if idle.len() < MAX_POOL_SIZE {
            idle.push(sender);
        }
    }

    async fn connect(&self, upstream: &url::Url) -> Result<Sender, ForwardError> {
        let connect_err = |reason: String| ForwardError::Connect {
            upstream: upstream.to_string(),
            reason,
        };

        let tcp = connect_tcp(upstream, CONNECT_TIMEOUT)
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        if upstream.scheme() == "https" {
            let (host, _) = host_and_port(upstream).map_err(|e| connect_err(e.to_string()))?;
            let server_name = tls::server_name(&host).map_err(|e| connect_err(e.to_string()))?;
            let stream = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(|e| connect_err(format!("TLS handshake failed: {}", e)))?;
            handshake(TokioIo::new(stream))
                .await
                .map_err(|e| connect_err(e.to_string()))
        } else {
            handshake(TokioIo::new(tcp))
                .await
                .map_err(|e| connect_err(e.to_string()))
        }
    }
}

async fn handshake<T>(io: T) -> Result<Sender, hyper::Error>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection closed: {}", e);
        }
    });
    Ok(sender)
}

fn rewrite_request(
    request: Request<Incoming>,
    route: &RouteMatch,
) -> Result<Request<Incoming>, ForwardError> {
    let (mut parts, body) = request.into_parts();

    parts.uri = route
        .path_and_query()
        .parse::<Uri>()
        .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers);

    if let Some(host) = &route.host {
        let value = HeaderValue::from_str(host)
            .map_err(|e| ForwardError::InvalidRequest(format!("bad host override: {}", e)))?;
        parts.headers.insert(HOST, value);
    }

    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Connection may name extra per-hop headers
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status() {
        assert_eq!(
            ForwardError::NoRoute("/x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ForwardError::Connect {
                upstream: "http://127.0.0.1:1/".into(),
                reason: "refused".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-request-id"], "abc");
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
