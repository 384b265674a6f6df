//! Backhaul gateway
//!
//! Public HTTP entry point of the tunnel system. Agents dial in on the
//! tunnel endpoints and park their connections in the registry; every other
//! request is end-user traffic, routed by its `Host` header to the matching
//! tunnel and replayed over it as HTTP/1.1.

pub mod config;
pub mod endpoints;
pub mod forward;
pub mod hooks;
pub mod server;

pub use config::GatewayConfig;
pub use hooks::{NoopClassifier, RequestClassifier};
pub use server::Gateway;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use backhaul_control::TunnelError;
use std::net::SocketAddr;
use thiserror::Error;

/// Gateway errors
///
/// Request-scoped variants map onto the status returned to the caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Tunnel handshake rejected: {0}")]
    Handshake(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Tunnel exchange failed: {0}")]
    Exchange(#[from] hyper::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Handshake(_) | GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Tunnel(TunnelError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Tunnel(_) | GatewayError::Exchange(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
