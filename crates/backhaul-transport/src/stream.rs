//! Duplex stream over one physical tunnel connection

use backhaul_proto::{Frame, TransportKind};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use crate::flow::{FlowDirection, FlowSink};
use crate::lease::{Lease, LeaseCompletion};
use crate::{TransportError, TransportResult};

/// Largest DATA frame produced by a single write
pub const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// Lifecycle of a duplex stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Ready to be handed to a consumer
    Idle,
    /// Serving one logical exchange
    Leased,
    /// Exchange finished, draining the peer's remaining bytes
    Resetting,
    /// Permanently closed
    Aborted,
}

/// Counters shared between a stream and its pump tasks
#[derive(Debug)]
pub(crate) struct LinkStats {
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) created_at: Instant,
}

impl LinkStats {
    pub(crate) fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }
}

/// Statistics about a physical tunnel connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Frame payload bytes written to the transport
    pub bytes_sent: u64,

    /// Frame payload bytes read from the transport
    pub bytes_received: u64,

    /// Logical sessions served so far
    pub leases: u64,

    /// Connection uptime (seconds)
    pub uptime_secs: u64,
}

/// Cloneable handle that force-closes a stream from anywhere
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the stream is aborted or its connection is gone
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// Bidirectional byte stream over one physical tunnel connection
///
/// The stream serves one logical session at a time. A session ends when
/// both sides have sent FIN; [`DuplexStream::reset`] waits for that and
/// makes the stream usable again. Dropping the stream aborts the
/// underlying connection.
pub struct DuplexStream {
    id: String,
    kind: TransportKind,
    state: StreamState,
    inbound: mpsc::Receiver<Frame>,
    outbound: PollSender<Frame>,
    control: mpsc::Sender<Frame>,
    read_buf: Bytes,
    read_closed: bool,
    write_closed: bool,
    leases: u64,
    abort: CancellationToken,
    flow: Arc<dyn FlowSink>,
    stats: Arc<LinkStats>,
}

impl std::fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl DuplexStream {
    pub(crate) fn new(
        id: String,
        kind: TransportKind,
        inbound: mpsc::Receiver<Frame>,
        outbound: mpsc::Sender<Frame>,
        control: mpsc::Sender<Frame>,
        abort: CancellationToken,
        flow: Arc<dyn FlowSink>,
        stats: Arc<LinkStats>,
    ) -> Self {
        Self {
            id,
            kind,
            state: StreamState::Idle,
            inbound,
            outbound: PollSender::new(outbound),
            control,
            read_buf: Bytes::new(),
            read_closed: false,
            write_closed: false,
            leases: 0,
            abort,
            flow,
            stats,
        }
    }

    /// Unique identifier of the physical connection
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        if self.abort.is_cancelled() {
            StreamState::Aborted
        } else {
            self.state
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Force the underlying transport closed, even mid read/write
    pub fn abort(&self) {
        if !self.abort.is_cancelled() {
            debug!(stream_id = %self.id, "Aborting tunnel stream");
        }
        self.abort.cancel();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.abort.clone(),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            leases: self.leases,
            uptime_secs: self.stats.created_at.elapsed().as_secs(),
        }
    }

    /// Hand the stream to a consumer for one logical exchange
    ///
    /// The returned completion resolves with the stream once the lease is
    /// dropped.
    pub fn lease(mut self) -> (Lease, LeaseCompletion) {
        self.state = StreamState::Leased;
        self.leases += 1;
        Lease::new(self)
    }

    /// Finish the current logical session and become Idle again
    ///
    /// Sends FIN if not yet sent, then discards whatever the peer still
    /// sends for this session until its FIN arrives.
    pub async fn reset(&mut self) -> TransportResult<()> {
        if self.is_aborted() {
            return Err(TransportError::Aborted);
        }

        self.state = StreamState::Resetting;

        if !self.write_closed {
            self.send_frame(Frame::Fin).await?;
            self.write_closed = true;
        }

        let mut discarded = 0usize;
        while !self.read_closed {
            let frame = tokio::select! {
                _ = self.abort.cancelled() => return Err(TransportError::Aborted),
                frame = self.inbound.recv() => frame,
            };

            match frame {
                Some(Frame::Data(data)) => {
                    discarded += data.len();
                    self.notify_backlog();
                }
                Some(Frame::Fin) => self.read_closed = true,
                Some(_) => {}
                None => return Err(self.closed_error()),
            }
        }

        if discarded > 0 || !self.read_buf.is_empty() {
            trace!(
                stream_id = %self.id,
                discarded = discarded + self.read_buf.len(),
                "Discarded unread session bytes on reset"
            );
        }

        self.read_buf.clear();
        self.read_closed = false;
        self.write_closed = false;
        self.state = StreamState::Idle;
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> TransportResult<()> {
        let reserved = std::future::poll_fn(|cx| self.outbound.poll_reserve(cx)).await;
        if reserved.is_err() {
            return Err(self.closed_error());
        }
        self.outbound
            .send_item(frame)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> TransportError {
        if self.abort.is_cancelled() {
            TransportError::Aborted
        } else {
            TransportError::StreamClosed
        }
    }

    /// Tell the peer we are still consuming when frames queue up locally
    fn notify_backlog(&self) {
        if !self.inbound.is_empty() {
            // A full control queue already carries frames for the peer
            let _ = self.control.try_send(Frame::Pong(crate::link::DRAIN_NOTICE));
        }
    }

    fn io_error(&self) -> io::Error {
        if self.abort.is_cancelled() {
            io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel stream aborted")
        } else {
            io::Error::new(io::ErrorKind::ConnectionReset, "tunnel connection closed")
        }
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                this.flow.on_flow(FlowDirection::Inbound, n);
                return Poll::Ready(Ok(()));
            }

            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inbound.poll_recv(cx)) {
                Some(Frame::Data(data)) => {
                    this.read_buf = data;
                    this.notify_backlog();
                }
                Some(Frame::Fin) => {
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Some(_) => {}
                None => return Poll::Ready(Err(this.io_error())),
            }
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after tunnel session shutdown",
            )));
        }
        if this.abort.is_cancelled() {
            return Poll::Ready(Err(this.io_error()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.io_error()));
        }

        let n = buf.len().min(MAX_WRITE_CHUNK);
        let frame = Frame::Data(Bytes::copy_from_slice(&buf[..n]));
        if this.outbound.send_item(frame).is_err() {
            return Poll::Ready(Err(this.io_error()));
        }

        this.flow.on_flow(FlowDirection::Outbound, n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.abort.is_cancelled() {
            return Poll::Ready(Err(self.io_error()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.io_error()));
        }
        if this.outbound.send_item(Frame::Fin).is_err() {
            return Poll::Ready(Err(this.io_error()));
        }

        this.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for DuplexStream {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}
