//! Gateway side of the HTTP/2 transport

use backhaul_proto::{Frame, FrameCodec, TransportKind};
use backhaul_transport::{spawn_link, DuplexStream, LinkContext, TransportError};
use bytes::Bytes;
use futures::{future, SinkExt, Stream, StreamExt, TryStreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;

/// Encoded frames buffered for the response body
const RESPONSE_BUFFER: usize = 32;

/// Streaming response body carrying gateway-to-agent frames
///
/// Ends when the tunnel stream is aborted or dropped.
#[derive(Debug)]
pub struct ResponseBody {
    inner: ReceiverStream<Bytes>,
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx).map(|chunk| chunk.map(Ok))
    }
}

/// Turn an inbound tunnel request body into a duplex stream
///
/// The returned [`ResponseBody`] must be sent back as the streaming
/// response to the same request.
pub fn accept<S, E>(body: S, ctx: LinkContext) -> (DuplexStream, ResponseBody)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = Box::pin(body.map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e)));
    let reader = FramedRead::new(StreamReader::new(body), FrameCodec).map_err(TransportError::from);

    let (tx, rx) = mpsc::channel::<Bytes>(RESPONSE_BUFFER);
    let writer = PollSender::new(tx)
        .sink_map_err(|_| TransportError::StreamClosed)
        .with(|frame: Frame| future::ready(frame.encode().map_err(TransportError::from)));

    let stream = spawn_link(reader, writer, TransportKind::H2, ctx);

    (
        stream,
        ResponseBody {
            inner: ReceiverStream::new(rx),
        },
    )
}
