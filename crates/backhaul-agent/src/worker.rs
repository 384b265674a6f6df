//! Agent worker: connect, serve sessions, reconnect
//!
//! The worker keeps exactly one tunnel connection to the gateway. While
//! connected it serves the sessions the gateway opens, one at a time, each
//! as an HTTP/1.1 exchange handed to the [`Forwarder`]. When the connection
//! fails or drops it waits the configured reconnect interval and dials
//! again. Only an authentication rejection or shutdown ends the loop.

use backhaul_transport::{
    DuplexStream, FlowSink, LinkConfig, LinkContext, NoopFlow, TransportConnector,
    TransportError, TunnelTarget,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, TunnelConfig};
use crate::connector;
use crate::forwarder::{ForwardError, Forwarder};
use crate::router::ProxyRouter;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Gateway rejected the tunnel: {0}")]
    Rejected(TransportError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Forwarder error: {0}")]
    Forward(#[from] ForwardError),
}

/// Connection lifecycle of the worker
///
/// There is no separate handshaking state: a [`TransportConnector`] dials
/// and completes the tunnel handshake in one call, so `Connecting` spans
/// both and ends in `Streaming` or, after a rejection, `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting to (re)connect
    Disconnected,
    /// Dialing the gateway and completing the tunnel handshake
    Connecting,
    /// Tunnel established, serving sessions
    Streaming,
    /// Shut down or rejected; the worker will not connect again
    Stopped,
}

pub struct AgentWorker {
    config: TunnelConfig,
    target: TunnelTarget,
    connector: Arc<dyn TransportConnector>,
    forwarder: Arc<Forwarder>,
    flow: Arc<dyn FlowSink>,
    shutdown: CancellationToken,
    state: watch::Sender<WorkerState>,
}

impl AgentWorker {
    pub fn new(config: TunnelConfig, shutdown: CancellationToken) -> Result<Self, AgentError> {
        config.validate()?;

        let target = config.target()?;
        let router = ProxyRouter::new(&config.proxy)?;
        if router.is_empty() {
            warn!("[{}] No enabled proxy rules; every request will get 404", config.name);
        }
        let forwarder = Arc::new(Forwarder::new(router)?);
        let connector = connector::for_kind(config.transport)?;
        let (state, _) = watch::channel(WorkerState::Disconnected);

        Ok(Self {
            config,
            target,
            connector,
            forwarder,
            flow: Arc::new(NoopFlow),
            shutdown,
            state,
        })
    }

    /// Replace the transport connector
    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Report tunnel byte counts to `flow`
    pub fn with_flow_sink(mut self, flow: Arc<dyn FlowSink>) -> Self {
        self.flow = flow;
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Watch the worker's connection state
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn stopped(&self) -> Result<(), AgentError> {
        info!("[{}] Agent stopped", self.config.name);
        self.set_state(WorkerState::Stopped);
        Ok(())
    }

    /// Run until shutdown or until the gateway rejects the credentials
    pub async fn run(&self) -> Result<(), AgentError> {
        let name = &self.config.name;
        let interval = self.config.reconnect_interval();
        let mut attempt = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                return self.stopped();
            }

            attempt += 1;
            self.set_state(WorkerState::Connecting);
            info!(
                "[{}] Connecting to {} over {} (attempt {})",
                name,
                self.target.server_url,
                self.connector.kind(),
                attempt
            );

            let ctx = LinkContext::new()
                .with_config(LinkConfig::heartbeat(self.config.heartbeat_interval()))
                .with_abort(self.shutdown.child_token())
                .with_flow(self.flow.clone());

            let connected = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return self.stopped(),
                result = self.connector.connect(&self.target, ctx) => result,
            };

            match connected {
                Ok(stream) => {
                    attempt = 0;
                    info!("[{}] ✅ Tunnel established ({})", name, stream.id());
                    self.set_state(WorkerState::Streaming);

                    let sessions = self.serve(stream).await;

                    if self.shutdown.is_cancelled() {
                        return self.stopped();
                    }
                    info!(
                        "[{}] 🔄 Connection lost after {} sessions, reconnecting in {:?}",
                        name, sessions, interval
                    );
                }
                Err(e) if e.is_fatal() => {
                    error!("[{}] 🚫 {}; not reconnecting", name, e);
                    self.set_state(WorkerState::Stopped);
                    return Err(AgentError::Rejected(e));
                }
                Err(e) => {
                    error!(
                        "[{}] ❌ Failed to connect: {}; retrying in {:?}",
                        name, e, interval
                    );
                }
            }

            self.set_state(WorkerState::Disconnected);
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return self.stopped(),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Serve sessions until the tunnel goes away; returns how many completed
    async fn serve(&self, mut stream: DuplexStream) -> u64 {
        let abort = stream.abort_handle();
        let mut sessions = 0u64;

        loop {
            let forwarder = self.forwarder.clone();
            let service = service_fn(move |request| {
                let forwarder = forwarder.clone();
                async move { Ok::<_, Infallible>(forwarder.handle(request).await) }
            });

            // One exchange per session; the response ends with our FIN
            let served = tokio::select! {
                _ = abort.aborted() => break,
                served = http1::Builder::new()
                    .keep_alive(false)
                    .half_close(true)
                    .serve_connection(TokioIo::new(&mut stream), service) => served,
            };

            if let Err(e) = served {
                debug!("Session on {} ended with error: {}", stream.id(), e);
            }
            if stream.is_aborted() {
                break;
            }

            match stream.reset().await {
                Ok(()) => sessions += 1,
                Err(e) => {
                    debug!("Tunnel {} closed during reset: {}", stream.id(), e);
                    break;
                }
            }
        }

        stream.abort();
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backhaul_proto::TransportKind;
    use backhaul_transport::{memory, TransportResult};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    /// Fails a number of times, then hands out in-memory tunnels
    #[derive(Debug, Default)]
    struct FakeConnector {
        failures: usize,
        reject: bool,
        attempts: Mutex<Vec<Instant>>,
        peers: Mutex<Vec<DuplexStream>>,
    }

    impl FakeConnector {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }

        fn rejecting() -> Self {
            Self {
                reject: true,
                ..Default::default()
            }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn take_peer(&self) -> Option<DuplexStream> {
            self.peers.lock().unwrap().pop()
        }
    }

    #[async_trait]
    impl TransportConnector for FakeConnector {
        async fn connect(
            &self,
            _target: &TunnelTarget,
            ctx: LinkContext,
        ) -> TransportResult<DuplexStream> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(Instant::now());
                attempts.len()
            };

            if self.reject {
                return Err(TransportError::AuthenticationFailed("HTTP 401".into()));
            }
            if attempt <= self.failures {
                return Err(TransportError::ConnectionError("connection refused".into()));
            }

            let (agent, gateway) = memory::pair(TransportKind::H2, ctx, LinkContext::new());
            self.peers.lock().unwrap().push(gateway);
            Ok(agent)
        }

        fn kind(&self) -> TransportKind {
            TransportKind::H2
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig::from_json(
            r#"{"token":"t","type":"h2","serverUrl":"http://gateway.test","name":"app",
                "reconnectInterval":5}"#,
        )
        .unwrap()
    }

    fn worker(connector: Arc<FakeConnector>, shutdown: CancellationToken) -> Arc<AgentWorker> {
        Arc::new(
            AgentWorker::new(config(), shutdown)
                .unwrap()
                .with_connector(connector),
        )
    }

    fn assert_interval(from: Instant, to: Instant) {
        let gap = to - from;
        assert!(
            gap >= Duration::from_secs(5) && gap < Duration::from_millis(5050),
            "expected a 5s reconnect interval, got {:?}",
            gap
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_on_fixed_interval() {
        let connector = Arc::new(FakeConnector::failing(3));
        let shutdown = CancellationToken::new();
        let worker = worker(connector.clone(), shutdown.clone());
        let mut state = worker.state();

        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        state.wait_for(|s| *s == WorkerState::Streaming).await.unwrap();
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert_interval(pair[0], pair[1]);
        }

        // Losing the established tunnel waits the same interval
        let lost_at = Instant::now();
        drop(connector.take_peer());
        state.wait_for(|s| *s == WorkerState::Disconnected).await.unwrap();
        state.wait_for(|s| *s == WorkerState::Streaming).await.unwrap();

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 5);
        assert_interval(lost_at, attempts[4]);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_is_fatal() {
        let connector = Arc::new(FakeConnector::rejecting());
        let worker = worker(connector.clone(), CancellationToken::new());

        let result = tokio::time::timeout(Duration::from_secs(60), worker.run())
            .await
            .expect("a rejected agent must stop on its own");

        assert!(matches!(result, Err(AgentError::Rejected(_))));
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(*worker.state().borrow(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_to_reconnect() {
        let connector = Arc::new(FakeConnector::failing(usize::MAX));
        let shutdown = CancellationToken::new();
        let worker = worker(connector.clone(), shutdown.clone());

        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("shutdown must interrupt the reconnect wait")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(connector.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_sessions_are_served_and_reset() {
        let connector = Arc::new(FakeConnector::default());
        let shutdown = CancellationToken::new();
        let worker = worker(connector.clone(), shutdown.clone());
        let mut state = worker.state();

        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        state.wait_for(|s| *s == WorkerState::Streaming).await.unwrap();
        let mut gateway = connector.take_peer().unwrap();

        for _ in 0..3 {
            let (mut lease, completion) = gateway.lease();
            lease
                .write_all(b"GET /missing HTTP/1.1\r\nHost: app\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            lease.shutdown().await.unwrap();

            let mut response = Vec::new();
            lease.read_to_end(&mut response).await.unwrap();
            let response = String::from_utf8_lossy(&response);
            assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
            drop(lease);

            gateway = completion.await.unwrap();
            gateway.reset().await.unwrap();
        }

        assert!(!gateway.is_aborted());
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
