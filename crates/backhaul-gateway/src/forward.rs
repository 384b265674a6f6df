//! End-user request forwarding
//!
//! Every request that is not a tunnel handshake is matched to a tunnel by
//! its host, waits for a leased stream and is replayed over it as one
//! HTTP/1.1 exchange. The response streams back as it arrives.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Uri, Version};
use axum::response::Response;
use backhaul_control::{TunnelConnection, TunnelError, TunnelListener};
use backhaul_proto::TunnelIdentity;
use backhaul_transport::TransportListener;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::server::GatewayState;
use crate::GatewayError;

/// Tunnel identity a request is addressed to
///
/// HTTP/1.1 requests carry it in `Host`; HTTP/2 requests in the URI
/// authority.
pub fn request_identity(request: &Request) -> Option<TunnelIdentity> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
        .and_then(TunnelIdentity::from_host)
}

pub(crate) async fn forward(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Response, GatewayError> {
    let identity = request_identity(&request)
        .ok_or_else(|| GatewayError::BadRequest("missing Host header".to_string()))?;

    state.classifier.classify(peer, &identity);

    let listener = TunnelListener::new(state.registry.clone(), identity.clone())
        .with_wait_timeout(state.config.wait_timeout);

    let connection = match listener.accept().await {
        Ok(connection) => connection,
        Err(e) => {
            match &e {
                TunnelError::Timeout => {
                    warn!(identity = %identity, peer = %peer, "No tunnel available in time")
                }
                _ => warn!(identity = %identity, peer = %peer, "Tunnel unavailable: {}", e),
            }
            return Err(e.into());
        }
    };

    let connection_id = connection.connection_id().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match exchange(connection, request).await {
        Ok(response) => {
            debug!(
                identity = %identity,
                connection_id = %connection_id,
                status = response.status().as_u16(),
                "{} {}",
                method,
                path
            );
            Ok(response)
        }
        Err(e) => {
            warn!(
                identity = %identity,
                connection_id = %connection_id,
                "{} {} failed: {}",
                method,
                path,
                e
            );
            Err(e)
        }
    }
}

/// Send one HTTP/1.1 request over a tunnel connection
///
/// The connection is owned by the exchange task and released once the
/// response body has been fully relayed or abandoned.
async fn exchange(connection: TunnelConnection, request: Request) -> Result<Response, GatewayError> {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(connection)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Tunnel exchange connection error: {}", e);
        }
    });

    let request = into_origin_form(request);
    let response = sender.send_request(request).await?;

    // The tunnel hop's close does not apply to the end user's connection
    let (mut parts, body) = response.into_parts();
    parts.headers.remove(header::CONNECTION);
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Rewrite a request for the single-use HTTP/1.1 hop through the tunnel
fn into_origin_form(request: Request) -> Request {
    let (mut parts, body) = request.into_parts();

    if !parts.headers.contains_key(header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(header::HOST, host);
            }
        }
    }

    let origin = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = origin.parse::<Uri>().unwrap_or_else(|_| Uri::from_static("/"));
    parts.version = Version::HTTP_11;
    // One exchange per lease
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    Request::from_parts(parts, body)
}
