//! Gateway, agent and a local upstream wired together over real sockets

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use axum::routing::{get, post};
use axum::Router;
use backhaul_agent::{AgentError, AgentWorker, TunnelConfig, WorkerState};
use backhaul_control::TunnelRegistry;
use backhaul_gateway::{Gateway, GatewayConfig};
use backhaul_proto::TunnelIdentity;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const HOST: &str = "app.example.com";

async fn inspect(method: Method, uri: Uri, headers: HeaderMap) -> String {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    format!("{} {} host={}", method, uri, host)
}

async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/echo", post(|body: Bytes| async move { body }))
        .fallback(inspect);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

async fn start_gateway(config: GatewayConfig, shutdown: CancellationToken) -> (SocketAddr, TunnelRegistry) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Gateway::new(config, shutdown).unwrap();
    let registry = gateway.registry().clone();
    tokio::spawn(gateway.serve(listener));
    (addr, registry)
}

fn agent_config(transport: &str, gateway: SocketAddr, token: &str, proxy: &str) -> TunnelConfig {
    TunnelConfig::from_json(&format!(
        r#"{{"token":"{}","type":"{}","serverUrl":"http://{}","name":"{}",
            "reconnectInterval":1,"heartbeatInterval":5,"proxy":{}}}"#,
        token, transport, gateway, HOST, proxy
    ))
    .unwrap()
}

/// Start an agent and wait until the gateway has its tunnel
async fn start_agent(config: TunnelConfig, registry: &TunnelRegistry, shutdown: CancellationToken) {
    let worker = AgentWorker::new(config, shutdown).unwrap();
    let mut state = worker.state();
    tokio::spawn(async move { worker.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        state.wait_for(|s| *s == WorkerState::Streaming).await.unwrap();
        let identity = TunnelIdentity::from_host(HOST).unwrap();
        while registry.connection_count(&identity) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("agent should connect");
}

fn client(gateway: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve(HOST, gateway)
        .build()
        .unwrap()
}

fn public_url(gateway: SocketAddr, path: &str) -> String {
    format!("http://{}:{}{}", HOST, gateway.port(), path)
}

#[tokio::test]
async fn test_requests_reach_local_upstream_over_both_transports() {
    let upstream = start_upstream().await;
    let proxy = format!(
        r#"[{{"route":"/api","localRemote":"http://{up}"}},
            {{"route":"/","localRemote":"http://{up}/site","host":"frontend.local"}}]"#,
        up = upstream
    );

    for transport in ["h2", "ws"] {
        let shutdown = CancellationToken::new();
        let (gateway, registry) = start_gateway(GatewayConfig::default(), shutdown.clone()).await;
        start_agent(
            agent_config(transport, gateway, "token", &proxy),
            &registry,
            shutdown.clone(),
        )
        .await;
        let client = client(gateway);

        // Same bytes as asking the upstream directly
        let direct = reqwest::get(format!("http://{}/ping", upstream))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let tunneled = client
            .get(public_url(gateway, "/api/ping"))
            .send()
            .await
            .unwrap();
        assert_eq!(tunneled.status(), 200, "{}", transport);
        assert_eq!(tunneled.bytes().await.unwrap(), direct);

        let body = client
            .get(public_url(gateway, "/api/items?id=7"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(
            body.starts_with(&format!("GET /items?id=7 host={}", HOST)),
            "{}: {}",
            transport,
            body
        );

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let echoed = client
            .post(public_url(gateway, "/api/echo"))
            .body(payload.clone())
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(echoed.len(), payload.len());
        assert_eq!(&echoed[..], &payload[..]);

        let body = client
            .get(public_url(gateway, "/index.html"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "GET /site/index.html host=frontend.local");

        shutdown.cancel();
    }
}

#[tokio::test]
async fn test_unmatched_path_gets_404_from_agent() {
    let upstream = start_upstream().await;
    let shutdown = CancellationToken::new();
    let (gateway, registry) = start_gateway(GatewayConfig::default(), shutdown.clone()).await;
    let proxy = format!(r#"[{{"route":"/api","localRemote":"http://{}"}}]"#, upstream);
    start_agent(agent_config("h2", gateway, "token", &proxy), &registry, shutdown.clone()).await;

    let response = client(gateway)
        .get(public_url(gateway, "/apix/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // The tunnel survives for the next request
    let response = client(gateway)
        .get(public_url(gateway, "/api/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_upstream_gets_502() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let shutdown = CancellationToken::new();
    let (gateway, registry) = start_gateway(GatewayConfig::default(), shutdown.clone()).await;
    let proxy = format!(r#"[{{"route":"/","localRemote":"http://{}"}}]"#, closed);
    start_agent(agent_config("ws", gateway, "token", &proxy), &registry, shutdown.clone()).await;

    let response = client(gateway)
        .get(public_url(gateway, "/anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_token_stops_agent() {
    for transport in ["h2", "ws"] {
        let shutdown = CancellationToken::new();
        let config = GatewayConfig::default().with_password("correct");
        let (gateway, _registry) = start_gateway(config, shutdown.clone()).await;

        let worker =
            AgentWorker::new(agent_config(transport, gateway, "wrong", "[]"), shutdown.clone())
                .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("rejected agent must not keep retrying");

        assert!(
            matches!(result, Err(AgentError::Rejected(_))),
            "{}: {:?}",
            transport,
            result
        );
        assert_eq!(*worker.state().borrow(), WorkerState::Stopped);

        shutdown.cancel();
    }
}
