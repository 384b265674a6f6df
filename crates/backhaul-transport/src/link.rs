//! Link pump: drives a framed transport behind a [`DuplexStream`]
//!
//! Transport adapters only have to produce a `Stream` of inbound frames and
//! a `Sink` for outbound frames. The pump spawns:
//! - a reader task: answers PINGs, forwards DATA/FIN to the stream
//! - a writer task: drains the control queue (PING/PONG) ahead of the
//!   session data queue into the transport
//! - a watchdog (optional): sends heartbeat PINGs and aborts the link when
//!   the link made no progress for too long
//!
//! Progress is any inbound frame or any session frame the transport accepted
//! outbound. Frames arrive in order, so a PING can sit behind a backlog of
//! DATA for longer than the grace window. While the local consumer works
//! through such a backlog, the stream emits `DRAIN_NOTICE` PONGs to show
//! the peer it is still draining.
//!
//! All three stop when the stream's abort token is cancelled, and the reader
//! and writer cancel it when the transport goes away.

use backhaul_proto::{Frame, TransportKind};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::flow::{FlowSink, NoopFlow};
use crate::stream::{DuplexStream, LinkStats};
use crate::{TransportError, TransportResult};

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default idle timeout for links that do not send heartbeats themselves
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Unsolicited PONG nonce sent while the receiver works through a backlog.
/// Heartbeat PINGs count up from 1 and never use it.
pub(crate) const DRAIN_NOTICE: u64 = 0;

const CHANNEL_CAPACITY: usize = 64;
const CONTROL_CAPACITY: usize = 8;
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive behaviour of a link
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Send a PING this often
    pub heartbeat_interval: Option<Duration>,

    /// Abort when no frame at all arrived for this long
    pub idle_timeout: Option<Duration>,
}

impl LinkConfig {
    /// Agent side: ping on an interval, give up after two silent intervals
    pub fn heartbeat(interval: Duration) -> Self {
        Self {
            heartbeat_interval: Some(interval),
            idle_timeout: Some(interval * 2),
        }
    }

    /// Gateway side: only watch for silence, the agent drives heartbeats
    pub fn idle_timeout(timeout: Duration) -> Self {
        Self {
            heartbeat_interval: None,
            idle_timeout: Some(timeout),
        }
    }
}

/// Everything a transport adapter needs to build a stream
#[derive(Clone)]
pub struct LinkContext {
    pub config: LinkConfig,
    /// Cancelling this token aborts the link
    pub abort: CancellationToken,
    /// Receives byte counts for every read/write
    pub flow: Arc<dyn FlowSink>,
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("config", &self.config)
            .field("aborted", &self.abort.is_cancelled())
            .finish()
    }
}

impl Default for LinkContext {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkContext {
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
            abort: CancellationToken::new(),
            flow: Arc::new(NoopFlow),
        }
    }

    pub fn with_config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_flow(mut self, flow: Arc<dyn FlowSink>) -> Self {
        self.flow = flow;
        self
    }
}

/// Spawn the pump tasks for a framed transport and return its stream
pub fn spawn_link<R, W>(reader: R, writer: W, kind: TransportKind, ctx: LinkContext) -> DuplexStream
where
    R: Stream<Item = TransportResult<Frame>> + Send + Unpin + 'static,
    W: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
{
    let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
    let stats = Arc::new(LinkStats::new());

    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
    let (activity_tx, activity_rx) = watch::channel(Instant::now());
    let activity_tx = Arc::new(activity_tx);

    tokio::spawn(writer_task(
        writer,
        Queues {
            control: control_rx,
            data: outbound_rx,
        },
        activity_tx.clone(),
        ctx.abort.clone(),
        stats.clone(),
        id.clone(),
    ));

    tokio::spawn(reader_task(
        reader,
        inbound_tx,
        control_tx.clone(),
        activity_tx,
        ctx.abort.clone(),
        stats.clone(),
        id.clone(),
    ));

    if ctx.config.heartbeat_interval.is_some() || ctx.config.idle_timeout.is_some() {
        tokio::spawn(watchdog_task(
            ctx.config.clone(),
            control_tx.clone(),
            activity_rx,
            ctx.abort.clone(),
            id.clone(),
        ));
    }

    debug!(stream_id = %id, "Tunnel link established");

    DuplexStream::new(
        id,
        kind,
        inbound_rx,
        outbound_tx,
        control_tx,
        ctx.abort,
        ctx.flow,
        stats,
    )
}

/// Outbound queues drained by the writer
struct Queues {
    /// PING/PONG, never behind session data
    control: mpsc::Receiver<Frame>,
    /// DATA/FIN written by the stream
    data: mpsc::Receiver<Frame>,
}

/// Writer task - sends queued frames to the transport, control frames first
async fn writer_task<W>(
    mut writer: W,
    mut queues: Queues,
    activity: Arc<watch::Sender<Instant>>,
    abort: CancellationToken,
    stats: Arc<LinkStats>,
    id: String,
) where
    W: Sink<Frame, Error = TransportError> + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            Some(frame) = queues.control.recv() => frame,
            frame = queues.data.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let session = matches!(frame, Frame::Data(_) | Frame::Fin);
        let len = frame.payload_len() as u64;
        let result = tokio::select! {
            _ = abort.cancelled() => break,
            result = writer.send(frame) => result,
        };

        if let Err(e) = result {
            debug!(stream_id = %id, "Tunnel write failed: {}", e);
            break;
        }
        stats.bytes_sent.fetch_add(len, Ordering::Relaxed);

        // The peer is draining what we send
        if session {
            activity.send_replace(Instant::now());
        }
    }

    abort.cancel();
    let _ = tokio::time::timeout(WRITER_CLOSE_TIMEOUT, writer.close()).await;
    trace!(stream_id = %id, "Tunnel writer task ended");
}

/// Reader task - answers pings and hands session frames to the stream
async fn reader_task<R>(
    mut reader: R,
    inbound: mpsc::Sender<Frame>,
    control: mpsc::Sender<Frame>,
    activity: Arc<watch::Sender<Instant>>,
    abort: CancellationToken,
    stats: Arc<LinkStats>,
    id: String,
) where
    R: Stream<Item = TransportResult<Frame>> + Send + Unpin + 'static,
{
    loop {
        let next = tokio::select! {
            _ = abort.cancelled() => break,
            next = reader.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(stream_id = %id, "Tunnel read failed: {}", e);
                break;
            }
            None => {
                debug!(stream_id = %id, "Tunnel connection closed by peer");
                break;
            }
        };

        activity.send_replace(Instant::now());
        stats
            .bytes_received
            .fetch_add(frame.payload_len() as u64, Ordering::Relaxed);

        match frame {
            Frame::Ping(nonce) => {
                // A full control queue already holds PONGs for the peer
                match control.try_send(Frame::Pong(nonce)) {
                    Ok(()) => trace!(stream_id = %id, nonce, "Ping answered"),
                    Err(_) => trace!(stream_id = %id, nonce, "Pong queue full, ping dropped"),
                }
            }
            Frame::Pong(nonce) => {
                trace!(stream_id = %id, nonce, "Pong received");
            }
            frame @ (Frame::Data(_) | Frame::Fin) => {
                let sent = tokio::select! {
                    _ = abort.cancelled() => break,
                    sent = inbound.send(frame) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    abort.cancel();
    trace!(stream_id = %id, "Tunnel reader task ended");
}

/// Watchdog task - heartbeats and silence detection
async fn watchdog_task(
    config: LinkConfig,
    control: mpsc::Sender<Frame>,
    activity: watch::Receiver<Instant>,
    abort: CancellationToken,
    id: String,
) {
    let period = match (config.heartbeat_interval, config.idle_timeout) {
        (Some(interval), _) => interval,
        (None, Some(timeout)) => timeout / 4,
        (None, None) => return,
    }
    .max(Duration::from_millis(10));

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let mut nonce: u64 = 0;

    loop {
        tokio::select! {
            _ = abort.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(timeout) = config.idle_timeout {
            let idle_for = activity.borrow().elapsed();
            if idle_for >= timeout {
                warn!(
                    stream_id = %id,
                    idle_ms = idle_for.as_millis() as u64,
                    "No link progress within the heartbeat grace window, aborting link"
                );
                abort.cancel();
                break;
            }
        }

        if config.heartbeat_interval.is_some() {
            nonce = nonce.wrapping_add(1);
            // Unsent pings are still queued ahead of any data
            if control.try_send(Frame::Ping(nonce)).is_ok() {
                trace!(stream_id = %id, nonce, "Ping sent");
            }
        }
    }
}
