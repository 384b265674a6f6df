//! Flow statistics sink
//!
//! Streams report every read and write to a [`FlowSink`] supplied at
//! construction. Sinks are called synchronously from poll functions, so an
//! implementation must not block.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Direction of a byte transfer, seen from the side owning the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    /// Bytes read out of the tunnel
    Inbound,
    /// Bytes written into the tunnel
    Outbound,
}

/// Receives byte counts for every stream read/write
pub trait FlowSink: Send + Sync + 'static {
    fn on_flow(&self, direction: FlowDirection, bytes: usize);
}

/// Discards all flow events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlow;

impl FlowSink for NoopFlow {
    fn on_flow(&self, _direction: FlowDirection, _bytes: usize) {}
}

/// Lock-free running totals per direction
#[derive(Default)]
pub struct FlowCounter {
    inbound: AtomicU64,
    outbound: AtomicU64,
}

impl FlowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inbound_bytes(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn outbound_bytes(&self) -> u64 {
        self.outbound.load(Ordering::Relaxed)
    }
}

impl FlowSink for FlowCounter {
    fn on_flow(&self, direction: FlowDirection, bytes: usize) {
        let counter = match direction {
            FlowDirection::Inbound => &self.inbound,
            FlowDirection::Outbound => &self.outbound,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for FlowCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowCounter")
            .field("inbound", &self.inbound_bytes())
            .field("outbound", &self.outbound_bytes())
            .finish()
    }
}
