//! Leases: one logical exchange on a duplex stream

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::stream::{AbortHandle, DuplexStream};
use crate::{TransportError, TransportResult};

/// A duplex stream on loan to a consumer for one logical exchange
///
/// Dropping the lease ends the exchange and returns the stream to whoever
/// holds the matching [`LeaseCompletion`].
#[derive(Debug)]
pub struct Lease {
    stream: Option<DuplexStream>,
    done: Option<oneshot::Sender<DuplexStream>>,
    abort: AbortHandle,
    stream_id: String,
}

impl Lease {
    pub(crate) fn new(stream: DuplexStream) -> (Self, LeaseCompletion) {
        let (tx, rx) = oneshot::channel();
        let abort = stream.abort_handle();
        let stream_id = stream.id().to_string();

        let lease = Self {
            stream: Some(stream),
            done: Some(tx),
            abort,
            stream_id,
        };

        (lease, LeaseCompletion { rx })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Force the underlying transport closed
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    fn stream_mut(&mut self) -> io::Result<&mut DuplexStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "lease already released"))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let (Some(stream), Some(done)) = (self.stream.take(), self.done.take()) {
            // Nobody waiting means the connection is being torn down; the
            // returned stream is dropped, which aborts it.
            let _ = done.send(stream);
        }
    }
}

impl AsyncRead for Lease {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for Lease {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Resolves exactly once, when the matching lease is released
///
/// Yields the stream back so it can be reset and offered again.
#[derive(Debug)]
pub struct LeaseCompletion {
    rx: oneshot::Receiver<DuplexStream>,
}

impl Future for LeaseCompletion {
    type Output = TransportResult<DuplexStream>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| TransportError::StreamClosed))
    }
}
