//! In-process transport
//!
//! Connects two duplex streams through channels instead of a socket. Used by
//! tests across the workspace to exercise the registry and endpoint logic
//! without a network.

use backhaul_proto::{Frame, TransportKind};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;

use crate::link::{spawn_link, LinkContext};
use crate::stream::DuplexStream;
use crate::TransportError;

const PIPE_CAPACITY: usize = 64;

/// Create two streams wired to each other
///
/// Aborting or dropping either side closes the other one, as a dropped
/// socket would.
pub fn pair(kind: TransportKind, a: LinkContext, b: LinkContext) -> (DuplexStream, DuplexStream) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel::<Frame>(PIPE_CAPACITY);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel::<Frame>(PIPE_CAPACITY);

    let a_stream = spawn_link(
        ReceiverStream::new(b_to_a_rx).map(Ok),
        PollSender::new(a_to_b_tx).sink_map_err(|_| TransportError::StreamClosed),
        kind,
        a,
    );
    let b_stream = spawn_link(
        ReceiverStream::new(a_to_b_rx).map(Ok),
        PollSender::new(b_to_a_tx).sink_map_err(|_| TransportError::StreamClosed),
        kind,
        b,
    );

    (a_stream, b_stream)
}
