//! HTTP/2 tunnel transport
//!
//! One physical tunnel connection is one long-lived HTTP/2 request: the
//! agent streams frames up in the request body and the gateway streams
//! frames down in the response body. Both bodies carry the byte-oriented
//! frame codec, so frame boundaries do not depend on DATA frame boundaries.
//!
//! - [`H2Connector`] dials the gateway from the agent side.
//! - [`server::accept`] turns a request body into a tunnel stream on the
//!   gateway side and hands back the response body to return.

pub mod body;
pub mod client;
pub mod server;

pub use client::H2Connector;
pub use server::{accept, ResponseBody};
