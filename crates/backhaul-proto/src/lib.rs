//! Tunnel protocol definitions
//!
//! This crate defines the framing carried inside every physical tunnel
//! connection and the small vocabulary shared by the gateway and the agent:
//! tunnel identities, transport kinds and endpoint paths.

pub mod frame;
pub mod identity;

pub use frame::{Frame, FrameCodec, FrameError, FrameType};
pub use identity::{TransportKind, TunnelIdentity};

/// Maximum frame payload size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Gateway route accepting HTTP/2 tunnel connections
pub const TUNNEL_H2_PATH: &str = "/tunnel/h2";

/// Gateway route accepting WebSocket tunnel connections
pub const TUNNEL_WS_PATH: &str = "/tunnel/ws";

/// Query parameter carrying the tunnel identity
pub const HOST_PARAM: &str = "host";

/// Query parameter carrying the shared secret
pub const PASSWORD_PARAM: &str = "password";
