//! Tunnel control plane for the gateway
//!
//! This crate pairs parked tunnel streams with end-user requests:
//! - [`TunnelRegistry`]: per-identity rendezvous channels and registrations
//! - [`TunnelListener`]: the "accept a connection" view used by the
//!   forwarding pipeline
//! - [`handler`]: the loop that parks one physical tunnel connection

pub mod handler;
pub mod listener;
pub mod registry;

pub use handler::serve_tunnel;
pub use listener::{TunnelConnection, TunnelListener};
pub use registry::{ChannelPair, Registration, TunnelRegistry};

use backhaul_transport::TransportError;
use thiserror::Error;

/// Errors from claiming or serving tunnel streams
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No stream became available within the wait bound
    #[error("Timed out waiting for a tunnel stream")]
    Timeout,

    /// The agent behind the identity went away
    #[error("Tunnel disconnected: {0}")]
    Disconnected(String),

    /// The listener was closed or the gateway is shutting down
    #[error("Listener closed")]
    ListenerClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
