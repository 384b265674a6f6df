//! Backhaul agent
//!
//! Runs next to the private services. It dials the gateway, keeps one
//! tunnel connection alive, and serves every logical session the gateway
//! opens on it as an HTTP/1.1 exchange relayed to a local upstream chosen
//! by the proxy rules in `tunnel.json`.

pub mod config;
pub mod connector;
pub mod forwarder;
pub mod router;
pub mod worker;

pub use config::{ConfigError, ProxyRule, TunnelConfig};
pub use forwarder::{ForwardError, Forwarder};
pub use router::{ProxyRouter, RouteMatch};
pub use worker::{AgentError, AgentWorker, WorkerState};
