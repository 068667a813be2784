//! End-to-end tests using real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use relay_core::{BinaryResponse, EventBus, RequestKind, Response, ResponseBody};
use relay_server::{ConnectionRegistry, RelayServer, SHUTDOWN_MESSAGE, ServerConfig, ServerHandle};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    handle: ServerHandle,
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/api/ws", self.handle.port())
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.handle.port())
    }

    async fn connect(&self) -> WsStream {
        let before = self.registry.len();
        let (ws, _) = connect_async(self.ws_url()).await.unwrap();
        wait_until(|| self.registry.len() > before).await;
        ws
    }
}

/// Boot a server with a tiny responder standing in for business logic.
async fn boot_server(config: ServerConfig) -> TestServer {
    let bus = EventBus::new(64);
    spawn_responder(bus.clone());

    let server = RelayServer::new(config, bus.clone());
    let registry = Arc::clone(server.registry());
    let handle = server.start().await.unwrap();
    TestServer {
        handle,
        bus,
        registry,
    }
}

fn spawn_responder(bus: EventBus) {
    let mut requests = bus.subscribe_requests();
    let _ = tokio::spawn(async move {
        while let Ok(request) = requests.recv().await {
            let id = request.id;
            match request.kind {
                RequestKind::Ping => {
                    let _ = bus.publish_response(Response::reply(id, ResponseBody::Pong));
                }
                RequestKind::GetFile { path, .. } => {
                    let _ = bus.publish_response(Response::reply(
                        id,
                        ResponseBody::FileInfo { path, size: 4 },
                    ));
                    let _ = bus.publish_binary(BinaryResponse::new(id, Bytes::from_static(b"data")));
                }
                other => {
                    let _ = bus.publish_response(Response::reply(
                        id,
                        ResponseBody::Error {
                            message: format!("unsupported: {}", other.name()),
                        },
                    ));
                }
            }
        }
    });
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next text or binary frame, skipping control frames.
async fn next_frame(ws: &mut WsStream, wait: Duration) -> Option<Message> {
    timeout(wait, async {
        while let Some(msg) = ws.next().await {
            match msg.ok()? {
                m @ (Message::Text(_) | Message::Binary(_)) => return Some(m),
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn recv_json(ws: &mut WsStream) -> Value {
    let msg = next_frame(ws, TIMEOUT).await.expect("expected a frame");
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

async fn send(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn correlated_response_reaches_only_originator() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    send(&mut a, json!({"id": 42, "kind": "ping"})).await;

    let reply = recv_json(&mut a).await;
    assert_eq!(reply["requestId"], 42);
    assert_eq!(reply["kind"], "pong");
    assert!(next_frame(&mut b, QUIET).await.is_none());
}

#[tokio::test]
async fn same_request_id_from_two_clients_last_writer_wins() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    send(&mut a, json!({"id": 5, "kind": "list-watches"})).await;
    let first = recv_json(&mut a).await;
    assert_eq!(first["kind"], "error");

    send(&mut b, json!({"id": 5, "kind": "ping"})).await;
    let second = recv_json(&mut b).await;
    assert_eq!(second["kind"], "pong");
    assert!(next_frame(&mut a, QUIET).await.is_none());
}

#[tokio::test]
async fn uncorrelated_response_is_broadcast() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    let _ = server
        .bus
        .publish_response(Response::broadcast(ResponseBody::Notification {
            message: "index rebuilt".into(),
        }));

    for ws in [&mut a, &mut b] {
        let msg = recv_json(ws).await;
        assert_eq!(msg["kind"], "notification");
        assert_eq!(msg["message"], "index rebuilt");
        assert!(msg.get("requestId").is_none());
    }
}

#[tokio::test]
async fn bad_request_is_broadcast_and_connection_survives() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    a.send(Message::text("this is not json")).await.unwrap();

    for ws in [&mut a, &mut b] {
        let msg = recv_json(ws).await;
        assert_eq!(msg["kind"], "bad-request");
        assert_eq!(msg["requestId"], -1);
        assert_eq!(msg["message"], "Invalid request.");
    }

    send(&mut a, json!({"id": 1, "kind": "ping"})).await;
    assert_eq!(recv_json(&mut a).await["kind"], "pong");
}

#[tokio::test]
async fn binary_follows_its_header_and_reads_resume() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    send(&mut a, json!({"id": 7, "kind": "get-file", "root": "/srv", "path": "a.txt"})).await;

    let header = recv_json(&mut a).await;
    assert_eq!(header["kind"], "file-info");
    assert_eq!(header["requestId"], 7);
    match next_frame(&mut a, TIMEOUT).await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], b"data"),
        other => panic!("expected binary frame, got {other:?}"),
    }
    assert!(next_frame(&mut b, QUIET).await.is_none());

    send(&mut a, json!({"id": 8, "kind": "ping"})).await;
    let reply = recv_json(&mut a).await;
    assert_eq!(reply["requestId"], 8);
}

#[tokio::test]
async fn inbound_binary_is_ignored() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;

    a.send(Message::Binary(Bytes::from_static(b"\x01\x02"))).await.unwrap();
    send(&mut a, json!({"id": 9, "kind": "ping"})).await;

    let reply = recv_json(&mut a).await;
    assert_eq!(reply["requestId"], 9);
}

#[tokio::test]
async fn disconnect_unregisters_client() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;
    let _b = server.connect().await;
    assert_eq!(server.registry.len(), 2);

    a.close(None).await.unwrap();
    wait_until(|| server.registry.len() == 1).await;
}

#[tokio::test]
async fn health_reports_connections() {
    let server = boot_server(ServerConfig::default()).await;
    let _a = server.connect().await;
    let _b = server.connect().await;

    let body: Value = reqwest::get(server.http_url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 2);
}

#[tokio::test]
async fn connection_limit_rejects_upgrade() {
    let server = boot_server(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let _a = server.connect().await;

    assert!(connect_async(server.ws_url()).await.is_err());
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn connection_limit_holds_under_a_burst() {
    let server = boot_server(ServerConfig {
        max_connections: 2,
        ..ServerConfig::default()
    })
    .await;

    let attempts: Vec<_> = (0..8).map(|_| connect_async(server.ws_url())).collect();
    let results = futures::future::join_all(attempts).await;
    let accepted: Vec<_> = results.into_iter().filter_map(Result::ok).collect();

    assert_eq!(accepted.len(), 2);
    wait_until(|| server.registry.len() == 2).await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(server.registry.len(), 2);
}

#[tokio::test]
async fn closed_connection_frees_its_slot() {
    let server = boot_server(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let mut a = server.connect().await;
    a.close(None).await.unwrap();
    wait_until(|| server.registry.is_empty()).await;

    let mut b = timeout(TIMEOUT, async {
        loop {
            if let Ok((ws, _)) = connect_async(server.ws_url()).await {
                return ws;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot was never released");

    send(&mut b, json!({"id": 3, "kind": "ping"})).await;
    assert_eq!(recv_json(&mut b).await["kind"], "pong");
}

#[tokio::test]
async fn shutdown_notifies_then_disconnects_clients() {
    let server = boot_server(ServerConfig::default()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    let registry = Arc::clone(&server.registry);

    server.handle.shutdown(TIMEOUT).await;

    for ws in [&mut a, &mut b] {
        let notice = recv_json(ws).await;
        assert_eq!(notice["kind"], "notification");
        assert_eq!(notice["message"], SHUTDOWN_MESSAGE);
        assert!(notice.get("requestId").is_none());
        assert!(next_frame(ws, TIMEOUT).await.is_none());
    }
    wait_until(|| registry.is_empty()).await;
}
