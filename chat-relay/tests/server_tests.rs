// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server Tests
//!
//! End-to-end over loopback sockets: real clients, the relay server and a
//! WebSocket backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::backend_stub;
use chat_relay::envelope::{BACKEND_DISCONNECTED, BACKEND_ERROR_PREFIX};
use chat_relay::{
    RelayConfig, RelayError, RelayMetrics, RelayServer, SessionId, SessionRegistry,
    ShutdownHandle, WsDialer,
};

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct RunningRelay {
    addr: SocketAddr,
    registry: SessionRegistry,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), RelayError>>,
}

async fn start_relay(backend_url: String, configure: impl FnOnce(&mut RelayConfig)) -> RunningRelay {
    let mut config = RelayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        backend_url: backend_url.clone(),
        reconnect_base_delay_ms: 50,
        ..RelayConfig::default()
    };
    configure(&mut config);

    let dialer = Arc::new(WsDialer::new(backend_url));
    let server = RelayServer::bind(&config, dialer, RelayMetrics::new().unwrap())
        .await
        .unwrap();

    RunningRelay {
        addr: server.local_addr().unwrap(),
        registry: server.registry(),
        shutdown: server.shutdown_handle(),
        task: tokio::spawn(server.run()),
    }
}

async fn start_stub_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(backend_stub::serve(listener));
    format!("ws://{addr}/ws")
}

/// How the recording backend treats each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendMode {
    /// Echo every message back.
    Echo,
    /// Complete the handshake, then close right away.
    HangUp,
    /// Refuse the handshake.
    Reject,
}

/// Backend that reports the request path and time of every connection
/// attempt and then behaves according to `mode`.
async fn start_recording_backend(
    mode: BackendMode,
) -> (String, mpsc::UnboundedReceiver<(String, Instant)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let record = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let _ = tx.send((req.uri().path().to_string(), Instant::now()));
                    if mode == BackendMode::Reject {
                        let mut rejection = ErrorResponse::new(Some("backend unavailable".into()));
                        *rejection.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                        return Err(rejection);
                    }
                    Ok(resp)
                };
                let Ok(mut ws) = accept_hdr_async(stream, record).await else {
                    return;
                };
                if mode == BackendMode::HangUp {
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let received: Value = serde_json::from_str(&text).unwrap();
                    let reply = json!({ "text": format!("echo: {}", received["text"].as_str().unwrap()) });
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (format!("ws://{addr}/ws"), rx)
}

async fn connect(relay: &RunningRelay) -> Client {
    let (client, _) = connect_async(format!("ws://{}", relay.addr)).await.unwrap();
    client
}

async fn recv_text(client: &mut Client) -> String {
    loop {
        match timeout(WAIT, client.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(Message::Close(_))) | None => panic!("relay closed the connection"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("client connection failed: {e}"),
        }
    }
}

/// Sends `text` until the backend is connected and a reply comes back.
async fn ask(client: &mut Client, text: &str) -> String {
    for _ in 0..50 {
        let message = json!({ "text": text }).to_string();
        client.send(Message::Text(message)).await.unwrap();
        let reply: Value = serde_json::from_str(&recv_text(client).await).unwrap();
        let reply = reply["text"].as_str().unwrap().to_string();
        if reply != BACKEND_DISCONNECTED {
            return reply;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("backend never became available");
}

async fn wait_for_sessions(registry: &SessionRegistry, count: usize) {
    timeout(WAIT, async {
        while registry.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_hello_through_stub_backend() {
    let backend_url = start_stub_backend().await;
    let relay = start_relay(backend_url, |_| {}).await;
    let mut client = connect(&relay).await;

    assert_eq!(
        ask(&mut client, "hello").await,
        "Hi there! How can I assist you with paper manufacturing today?"
    );
    assert_eq!(
        ask(&mut client, "something else").await,
        backend_stub::FALLBACK_REPLY
    );
}

#[tokio::test]
async fn test_backend_path_carries_session_id() {
    let (backend_url, mut connections) = start_recording_backend(BackendMode::Echo).await;
    let relay = start_relay(backend_url, |_| {}).await;
    let mut client = connect(&relay).await;

    let (path, _) = timeout(WAIT, connections.recv()).await.unwrap().unwrap();
    let id: SessionId = path.strip_prefix("/ws/").unwrap().parse().unwrap();
    wait_for_sessions(&relay.registry, 1).await;
    assert!(relay.registry.contains(&id));

    assert_eq!(ask(&mut client, "ping").await, "echo: ping");
}

#[tokio::test]
async fn test_each_client_gets_own_session() {
    let (backend_url, mut connections) = start_recording_backend(BackendMode::Echo).await;
    let relay = start_relay(backend_url, |_| {}).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(&relay).await);
    }

    let mut paths = Vec::new();
    for _ in 0..3 {
        let (path, _) = timeout(WAIT, connections.recv()).await.unwrap().unwrap();
        paths.push(path);
    }
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);
    wait_for_sessions(&relay.registry, 3).await;

    for (i, client) in clients.iter_mut().enumerate() {
        let question = format!("client {i}");
        assert_eq!(ask(client, &question).await, format!("echo: {question}"));
    }
}

async fn attempt_gaps(
    connections: &mut mpsc::UnboundedReceiver<(String, Instant)>,
    attempts: usize,
) -> Vec<Duration> {
    let mut times = Vec::new();
    for _ in 0..attempts {
        let (_, at) = timeout(WAIT, connections.recv()).await.unwrap().unwrap();
        times.push(at);
    }
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test]
async fn test_refused_backend_is_redialed_linearly() {
    let (backend_url, mut connections) = start_recording_backend(BackendMode::Reject).await;
    let relay = start_relay(backend_url, |config| config.reconnect_base_delay_ms = 100).await;
    let mut client = connect(&relay).await;

    let gaps = attempt_gaps(&mut connections, 3).await;
    assert!(gaps[0] >= Duration::from_millis(100), "gaps: {gaps:?}");
    assert!(gaps[0] < Duration::from_millis(200), "gaps: {gaps:?}");
    assert!(gaps[1] >= Duration::from_millis(200), "gaps: {gaps:?}");

    let error: Value = serde_json::from_str(&recv_text(&mut client).await).unwrap();
    assert!(error["text"]
        .as_str()
        .unwrap()
        .starts_with(BACKEND_ERROR_PREFIX));
}

#[tokio::test]
async fn test_backend_hang_up_redials_after_base_delay() {
    let (backend_url, mut connections) = start_recording_backend(BackendMode::HangUp).await;
    let relay = start_relay(backend_url, |config| config.reconnect_base_delay_ms = 100).await;
    let mut client = connect(&relay).await;

    // Every hang-up follows a successful open, so each retry waits the base delay.
    let gaps = attempt_gaps(&mut connections, 3).await;
    for gap in &gaps {
        assert!(*gap >= Duration::from_millis(100), "gaps: {gaps:?}");
        assert!(*gap < Duration::from_millis(200), "gaps: {gaps:?}");
    }

    // The client session outlives every backend connection.
    assert_eq!(relay.registry.len(), 1);
    client.close(None).await.unwrap();
    wait_for_sessions(&relay.registry, 0).await;
}

#[tokio::test]
async fn test_message_during_backend_gap_is_refused() {
    let (backend_url, mut connections) = start_recording_backend(BackendMode::HangUp).await;
    let relay = start_relay(backend_url, |config| config.reconnect_base_delay_ms = 500).await;
    let mut client = connect(&relay).await;

    let (_, first) = timeout(WAIT, connections.recv()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .send(Message::Text(json!({ "text": "anyone there?" }).to_string()))
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&recv_text(&mut client).await).unwrap();
    assert_eq!(reply, json!({ "text": BACKEND_DISCONNECTED }));

    let (_, second) = timeout(WAIT, connections.recv()).await.unwrap().unwrap();
    assert!(second - first >= Duration::from_millis(500));
}

#[tokio::test]
async fn test_client_disconnect_removes_session() {
    let backend_url = start_stub_backend().await;
    let relay = start_relay(backend_url, |_| {}).await;

    let mut client = connect(&relay).await;
    wait_for_sessions(&relay.registry, 1).await;

    client.close(None).await.unwrap();
    wait_for_sessions(&relay.registry, 0).await;
}

#[tokio::test]
async fn test_shutdown_closes_clients_and_returns() {
    let backend_url = start_stub_backend().await;
    let relay = start_relay(backend_url, |_| {}).await;
    let mut client = connect(&relay).await;
    ask(&mut client, "hello").await;

    relay.shutdown.shutdown();
    timeout(WAIT, relay.task).await.unwrap().unwrap().unwrap();

    match timeout(WAIT, client.next()).await.unwrap() {
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {}
        other => panic!("expected close, got {other:?}"),
    }
    assert!(relay.registry.is_empty());
}

#[tokio::test]
async fn test_shutdown_before_run_stops_immediately() {
    let backend_url = start_stub_backend().await;
    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        backend_url: backend_url.clone(),
        ..RelayConfig::default()
    };
    let server = RelayServer::bind(
        &config,
        Arc::new(WsDialer::new(backend_url)),
        RelayMetrics::new().unwrap(),
    )
    .await
    .unwrap();

    server.shutdown_handle().shutdown();
    timeout(WAIT, server.run()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connections_over_limit_are_dropped() {
    let backend_url = start_stub_backend().await;
    let relay = start_relay(backend_url, |config| config.max_connections = 1).await;

    let _first = connect(&relay).await;
    wait_for_sessions(&relay.registry, 1).await;

    let second = timeout(WAIT, connect_async(format!("ws://{}", relay.addr)))
        .await
        .unwrap();
    assert!(second.is_err());
}

#[tokio::test]
async fn test_health_check_on_websocket_port() {
    let backend_url = start_stub_backend().await;
    let relay = start_relay(backend_url, |_| {}).await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let health: Value = serde_json::from_str(body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(relay.registry.is_empty());
}
