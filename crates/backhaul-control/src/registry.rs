//! Tunnel session registry
//!
//! Every tunnel identity gets one [`ChannelPair`]: a ready-signal channel and
//! a stream-supply channel, both of capacity one. A consumer that needs a
//! stream signals ready; an endpoint handler that sees the signal leases its
//! idle stream and publishes it on the supply channel. Streams are therefore
//! only handed out on demand, one per signal.
//!
//! Several physical connections may register under the same identity. They
//! share the pair and serve consumers as a pool.

use backhaul_proto::TunnelIdentity;
use backhaul_transport::Lease;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::TunnelError;

/// Rendezvous channels for one tunnel identity
#[derive(Debug)]
pub struct ChannelPair {
    identity: TunnelIdentity,
    ready_tx: mpsc::Sender<()>,
    // Handlers take turns waiting for demand
    ready_rx: Mutex<mpsc::Receiver<()>>,
    supply_tx: mpsc::Sender<Lease>,
    // Consumers queue here in arrival order
    supply_rx: Mutex<mpsc::Receiver<Lease>>,
    token: CancellationToken,
    connections: AtomicUsize,
}

impl ChannelPair {
    fn new(identity: TunnelIdentity, token: CancellationToken) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (supply_tx, supply_rx) = mpsc::channel(1);

        Self {
            identity,
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            supply_tx,
            supply_rx: Mutex::new(supply_rx),
            token,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.identity
    }

    /// True once the pair was removed; every wait on it fails
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Physical connections currently registered on this pair
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// True while a published lease waits in the supply slot
    pub fn has_parked_lease(&self) -> bool {
        self.supply_tx.capacity() == 0
    }

    fn disconnected(&self) -> TunnelError {
        TunnelError::Disconnected(self.identity.to_string())
    }

    /// Handler side: wait until some consumer declares demand
    pub async fn wait_ready(&self) -> Result<(), TunnelError> {
        let mut ready = tokio::select! {
            _ = self.token.cancelled() => return Err(self.disconnected()),
            ready = self.ready_rx.lock() => ready,
        };

        tokio::select! {
            _ = self.token.cancelled() => Err(self.disconnected()),
            signal = ready.recv() => signal.ok_or_else(|| self.disconnected()),
        }
    }

    /// Handler side: hand a lease to the consumer that signalled
    pub async fn publish(&self, lease: Lease) -> Result<(), TunnelError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(self.disconnected()),
            sent = self.supply_tx.send(lease) => sent.map_err(|_| self.disconnected()),
        }
    }

    /// Consumer side: obtain a leased stream within `wait`
    ///
    /// A lease left behind by a consumer that gave up is taken first, before
    /// signalling again. Leases whose connection died while parked are
    /// skipped. `cancel` ends the wait with [`TunnelError::ListenerClosed`].
    pub async fn claim(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Lease, TunnelError> {
        let claim = async {
            let mut supply = self.supply_rx.lock().await;

            while let Ok(lease) = supply.try_recv() {
                if !lease.is_aborted() {
                    debug!(
                        identity = %self.identity,
                        stream_id = %lease.stream_id(),
                        "Claimed parked lease"
                    );
                    return Ok(lease);
                }
            }

            loop {
                self.ready_tx
                    .send(())
                    .await
                    .map_err(|_| self.disconnected())?;

                match supply.recv().await {
                    Some(lease) if !lease.is_aborted() => return Ok(lease),
                    Some(lease) => {
                        debug!(
                            identity = %self.identity,
                            stream_id = %lease.stream_id(),
                            "Skipping aborted lease"
                        );
                    }
                    None => return Err(self.disconnected()),
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::ListenerClosed),
            _ = self.token.cancelled() => Err(self.disconnected()),
            result = tokio::time::timeout(wait, claim) => result.unwrap_or(Err(TunnelError::Timeout)),
        }
    }

    /// Cancel every wait and abort every stream on this pair
    fn close(&self) {
        self.token.cancel();

        // Leases nobody claimed go back to their (now exiting) handlers
        if let Ok(mut supply) = self.supply_rx.try_lock() {
            while let Ok(lease) = supply.try_recv() {
                lease.abort();
            }
        }
        if let Ok(mut ready) = self.ready_rx.try_lock() {
            while ready.try_recv().is_ok() {}
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    pairs: DashMap<TunnelIdentity, Arc<ChannelPair>>,
    shutdown: CancellationToken,
}

/// Registry of rendezvous pairs keyed by tunnel identity
#[derive(Debug, Clone)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl TunnelRegistry {
    /// Create a registry whose pairs all end when `shutdown` is cancelled
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pairs: DashMap::new(),
                shutdown,
            }),
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Cancel every pair and wait in the registry
    pub fn shutdown(&self) {
        info!("Shutting down tunnel registry");
        self.inner.shutdown.cancel();
    }

    fn new_pair(&self, identity: &TunnelIdentity) -> Arc<ChannelPair> {
        Arc::new(ChannelPair::new(
            identity.clone(),
            self.inner.shutdown.child_token(),
        ))
    }

    /// Get the pair for an identity, creating it on first use
    pub fn channel_pair(&self, identity: &TunnelIdentity) -> Arc<ChannelPair> {
        match self.inner.pairs.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(self.new_pair(identity));
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(self.new_pair(identity)).clone(),
        }
    }

    /// Register one physical connection under `identity`
    ///
    /// The returned guard keeps the identity registered; dropping the last
    /// guard for an identity removes it.
    pub fn register(&self, identity: &TunnelIdentity) -> Registration {
        let pair = match self.inner.pairs.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(self.new_pair(identity));
                }
                let pair = entry.get().clone();
                pair.connections.fetch_add(1, Ordering::SeqCst);
                pair
            }
            Entry::Vacant(entry) => {
                let pair = entry.insert(self.new_pair(identity)).clone();
                pair.connections.fetch_add(1, Ordering::SeqCst);
                pair
            }
        };

        info!(
            identity = %identity,
            connections = pair.connection_count(),
            "Tunnel registered"
        );

        Registration {
            registry: self.clone(),
            pair,
        }
    }

    /// Remove an identity, failing its waiters and aborting its streams
    pub fn remove_all(&self, identity: &TunnelIdentity) {
        if let Some((_, pair)) = self.inner.pairs.remove(identity) {
            pair.close();
            info!(identity = %identity, "Tunnel removed");
        }
    }

    /// Drop a pair nobody registered on once its last waiter left
    pub(crate) fn prune(&self, identity: &TunnelIdentity) {
        let removed = self.inner.pairs.remove_if(identity, |_, pair| {
            pair.connection_count() == 0 && Arc::strong_count(pair) == 1
        });
        if removed.is_some() {
            debug!(identity = %identity, "Pruned unused channel pair");
        }
    }

    fn release(&self, pair: &Arc<ChannelPair>) {
        let remaining = pair.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(
            identity = %pair.identity,
            connections = remaining,
            "Tunnel connection released"
        );

        if remaining > 0 {
            return;
        }

        let removed = self.inner.pairs.remove_if(&pair.identity, |_, current| {
            Arc::ptr_eq(current, pair) && current.connection_count() == 0
        });
        if removed.is_some() {
            pair.close();
            info!(identity = %pair.identity, "Tunnel removed");
        }
    }

    /// Identities with at least one registered connection
    pub fn identities(&self) -> Vec<TunnelIdentity> {
        let mut identities: Vec<_> = self
            .inner
            .pairs
            .iter()
            .filter(|entry| entry.value().connection_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        identities.sort();
        identities
    }

    /// Physical connections registered under an identity
    pub fn connection_count(&self, identity: &TunnelIdentity) -> usize {
        self.inner
            .pairs
            .get(identity)
            .map(|pair| pair.connection_count())
            .unwrap_or(0)
    }
}

/// A physical connection's claim on its identity
///
/// Dropping the last registration for an identity runs
/// [`TunnelRegistry::remove_all`] semantics for it.
#[derive(Debug)]
pub struct Registration {
    registry: TunnelRegistry,
    pair: Arc<ChannelPair>,
}

impl Registration {
    pub fn identity(&self) -> &TunnelIdentity {
        &self.pair.identity
    }

    pub fn pair(&self) -> &Arc<ChannelPair> {
        &self.pair
    }

    /// Abort token for a stream served under this registration
    pub fn stream_token(&self) -> CancellationToken {
        self.pair.token.child_token()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.pair);
    }
}
