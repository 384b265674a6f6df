//! HTTP/2 tunnel round trips against an in-test h2 server

use backhaul_proto::TunnelIdentity;
use backhaul_transport::{DuplexStream, LinkContext, TransportConnector, TransportError, TunnelTarget};
use backhaul_transport_h2::body::{recv_stream_body, send_all};
use backhaul_transport_h2::{accept, H2Connector};
use futures::StreamExt;
use http::{Response, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

/// Minimal gateway: answers every tunnel request with `status`, and on 200
/// hands the resulting stream to the test
async fn spawn_gateway(status: StatusCode) -> (SocketAddr, mpsc::Receiver<(String, DuplexStream)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut conn = h2::server::handshake(socket).await.unwrap();

        while let Some(Ok((request, mut respond))) = conn.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                if status != StatusCode::OK {
                    let response = Response::builder().status(status).body(()).unwrap();
                    let _ = respond.send_response(response, true);
                    return;
                }

                let query = request.uri().query().unwrap_or_default().to_string();
                let (stream, mut body) =
                    accept(recv_stream_body(request.into_body()), LinkContext::new());
                let mut send = respond.send_response(Response::new(()), false).unwrap();
                tx.send((query, stream)).await.unwrap();

                while let Some(Ok(chunk)) = body.next().await {
                    if send_all(&mut send, chunk).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, rx)
}

fn target(addr: SocketAddr) -> TunnelTarget {
    TunnelTarget {
        server_url: Url::parse(&format!("http://{}", addr)).unwrap(),
        identity: TunnelIdentity::from_host("app.example.com").unwrap(),
        password: Some("pw".to_string()),
    }
}

#[tokio::test]
async fn test_h2_tunnel_sessions() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (addr, mut accepted) = spawn_gateway(StatusCode::OK).await;
    let connector = H2Connector::new().unwrap();

    let mut agent = connector
        .connect(&target(addr), LinkContext::new())
        .await
        .unwrap();
    let (query, mut gateway) = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(query, "host=app.example.com&password=pw");

    for i in 0..3 {
        let request = format!("GET /{} HTTP/1.1\r\n\r\n", i);
        gateway.write_all(request.as_bytes()).await.unwrap();
        gateway.shutdown().await.unwrap();

        let mut received = Vec::new();
        agent.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, request.as_bytes());

        let payload = vec![b'x'; 200 * 1024];
        agent.write_all(&payload).await.unwrap();
        agent.shutdown().await.unwrap();

        let mut response = Vec::new();
        gateway.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, payload);

        let (a, b) = tokio::join!(agent.reset(), gateway.reset());
        a.unwrap();
        b.unwrap();
    }

    agent.abort();
    tokio::time::timeout(Duration::from_secs(5), gateway.abort_handle().aborted())
        .await
        .expect("gateway side must notice the agent going away");
}

#[tokio::test]
async fn test_h2_rejected_handshake_is_fatal() {
    let (addr, _accepted) = spawn_gateway(StatusCode::BAD_REQUEST).await;
    let connector = H2Connector::new().unwrap();

    let err = connector
        .connect(&target(addr), LinkContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::AuthenticationFailed(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_h2_not_found_handshake_is_retryable() {
    let (addr, _accepted) = spawn_gateway(StatusCode::NOT_FOUND).await;
    let connector = H2Connector::new().unwrap();

    let err = connector
        .connect(&target(addr), LinkContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionError(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_h2_unreachable_gateway_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector = H2Connector::new().unwrap();
    let err = connector
        .connect(&target(addr), LinkContext::new())
        .await
        .unwrap_err();
    assert!(!err.is_fatal());
}
