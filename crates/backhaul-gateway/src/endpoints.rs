//! Tunnel handshake endpoints
//!
//! A handshake names the tunnel identity in the `host` query parameter and,
//! when the gateway has a secret, proves it with `password`. Anything wrong
//! with it is answered with `400 Bad Request` before the identity is
//! registered.

use axum::body::Body;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, Method, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use backhaul_control::serve_tunnel;
use backhaul_proto::TunnelIdentity;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::server::GatewayState;
use crate::GatewayError;

#[derive(Debug, Default, Deserialize)]
pub struct TunnelParams {
    pub host: Option<String>,
    pub password: Option<String>,
}

/// Check a handshake and derive the identity it registers
pub(crate) fn authorize(
    state: &GatewayState,
    params: &TunnelParams,
) -> Result<TunnelIdentity, GatewayError> {
    let identity = params
        .host
        .as_deref()
        .and_then(TunnelIdentity::from_host)
        .ok_or_else(|| GatewayError::Handshake("missing host parameter".to_string()))?;

    if !state.config.password_matches(params.password.as_deref()) {
        return Err(GatewayError::Handshake(format!(
            "invalid password for {}",
            identity
        )));
    }

    Ok(identity)
}

fn reject(peer: SocketAddr, err: GatewayError) -> Response {
    warn!(peer = %peer, "Rejected tunnel handshake: {}", err);
    err.into_response()
}

/// `POST /tunnel/h2`: the request body carries agent frames, the streamed
/// response body carries gateway frames
pub(crate) async fn h2_tunnel(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<TunnelParams>,
    request: Request,
) -> Response {
    if request.version() != Version::HTTP_2 || request.method() != Method::POST {
        return reject(
            peer,
            GatewayError::Handshake(format!(
                "{} {:?} is not an HTTP/2 POST",
                request.method(),
                request.version()
            )),
        );
    }

    let identity = match authorize(&state, &params) {
        Ok(identity) => identity,
        Err(e) => return reject(peer, e),
    };

    let registration = state.registry.register(&identity);
    let ctx = state.link_context(&registration);
    let body = request.into_body().into_data_stream();
    let (stream, body) = backhaul_transport_h2::accept(body, ctx);
    debug!(
        peer = %peer,
        identity = %identity,
        stream_id = %stream.id(),
        "HTTP/2 tunnel accepted"
    );

    tokio::spawn(async move {
        if let Err(e) = serve_tunnel(registration, stream).await {
            debug!(identity = %identity, "HTTP/2 tunnel ended: {}", e);
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

/// `GET /tunnel/ws`: one WebSocket, one binary message per frame
pub(crate) async fn ws_tunnel(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<TunnelParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return reject(
                peer,
                GatewayError::Handshake(format!("not a WebSocket upgrade: {}", rejection)),
            )
        }
    };

    let identity = match authorize(&state, &params) {
        Ok(identity) => identity,
        Err(e) => return reject(peer, e),
    };

    ws.on_upgrade(move |socket| async move {
        let registration = state.registry.register(&identity);
        let ctx = state.link_context(&registration);
        let stream = backhaul_transport_websocket::accept(socket, ctx);
        debug!(
            peer = %peer,
            identity = %identity,
            stream_id = %stream.id(),
            "WebSocket tunnel accepted"
        );

        if let Err(e) = serve_tunnel(registration, stream).await {
            debug!(identity = %identity, "WebSocket tunnel ended: {}", e);
        }
    })
}
