//! Gateway side of the WebSocket transport

use axum::extract::ws::{Message, WebSocket};
use backhaul_proto::{Frame, TransportKind};
use backhaul_transport::{spawn_link, DuplexStream, LinkContext, TransportError};
use futures_util::{future, SinkExt, StreamExt};
use tracing::trace;

/// Wrap an upgraded WebSocket into a duplex stream
pub fn accept(socket: WebSocket, ctx: LinkContext) -> DuplexStream {
    let (sink, stream) = socket.split();

    let reader = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Binary(data)) => Some(Frame::decode(data).map_err(TransportError::from)),
            Ok(Message::Close(_)) => Some(Err(TransportError::StreamClosed)),
            Ok(other) => {
                trace!("Ignoring non-binary WebSocket message: {:?}", other);
                None
            }
            Err(e) => Some(Err(TransportError::ConnectionError(format!(
                "WebSocket read failed: {}",
                e
            )))),
        })
    });

    let writer = sink
        .sink_map_err(|e| TransportError::ConnectionError(format!("WebSocket send failed: {}", e)))
        .with(|frame: Frame| {
            future::ready(
                frame
                    .encode()
                    .map(Message::Binary)
                    .map_err(TransportError::from),
            )
        });

    spawn_link(Box::pin(reader), writer, TransportKind::Ws, ctx)
}
