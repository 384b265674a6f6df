//! WebSocket tunnel transport
//!
//! Each binary WebSocket message carries exactly one encoded frame. Text
//! messages are ignored; WebSocket-level ping/pong is left to the libraries
//! and plays no part in tunnel liveness, which runs on frame heartbeats the
//! same way the HTTP/2 transport does.
//!
//! - [`WebSocketConnector`] dials the gateway from the agent side.
//! - [`server::accept`] wraps an upgraded axum socket on the gateway side.

pub mod client;
pub mod server;

pub use client::WebSocketConnector;
pub use server::accept;
