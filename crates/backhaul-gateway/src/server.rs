//! Gateway assembly: router, shared state and the serve loop

use axum::routing::any;
use axum::Router;
use backhaul_control::{Registration, TunnelRegistry};
use backhaul_proto::{TUNNEL_H2_PATH, TUNNEL_WS_PATH};
use backhaul_transport::{FlowSink, LinkContext, NoopFlow};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::GatewayConfig;
use crate::hooks::{NoopClassifier, RequestClassifier};
use crate::{endpoints, forward, GatewayError};

/// State shared by every route
#[derive(Clone)]
pub(crate) struct GatewayState {
    pub(crate) registry: TunnelRegistry,
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) flow: Arc<dyn FlowSink>,
    pub(crate) classifier: Arc<dyn RequestClassifier>,
}

impl GatewayState {
    /// Link settings for a tunnel connection parked under `registration`
    pub(crate) fn link_context(&self, registration: &Registration) -> LinkContext {
        LinkContext::new()
            .with_config(self.config.link_config())
            .with_abort(registration.stream_token())
            .with_flow(self.flow.clone())
    }
}

/// The gateway server
pub struct Gateway {
    state: GatewayState,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.state.config)
            .field("tunnels", &self.state.registry.identities())
            .finish()
    }
}

impl Gateway {
    /// Create a gateway that stops when `shutdown` is cancelled
    pub fn new(config: GatewayConfig, shutdown: CancellationToken) -> Result<Self, GatewayError> {
        config.validate()?;

        Ok(Self {
            state: GatewayState {
                registry: TunnelRegistry::new(shutdown),
                config: Arc::new(config),
                flow: Arc::new(NoopFlow),
                classifier: Arc::new(NoopClassifier),
            },
        })
    }

    /// Receive byte counts for all tunnel traffic
    pub fn with_flow_sink(mut self, flow: Arc<dyn FlowSink>) -> Self {
        self.state.flow = flow;
        self
    }

    /// Observe the source of every forwarded request
    pub fn with_classifier(mut self, classifier: Arc<dyn RequestClassifier>) -> Self {
        self.state.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.state.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    /// Tunnel endpoints plus the catch-all forwarding route
    pub fn router(&self) -> Router {
        Router::new()
            .route(TUNNEL_H2_PATH, any(endpoints::h2_tunnel))
            .route(TUNNEL_WS_PATH, any(endpoints::ws_tunnel))
            .fallback(forward::forward)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = self.state.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        let local_addr = listener.local_addr()?;
        let shutdown = self.state.registry.shutdown_token().clone();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        info!(
            "Gateway listening on {} (tunnel endpoints {} and {})",
            local_addr, TUNNEL_H2_PATH, TUNNEL_WS_PATH
        );
        if self.state.config.password.is_none() {
            info!("No tunnel password configured; any agent may register");
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        self.state.registry.shutdown();
        info!("Gateway stopped");
        Ok(())
    }
}
