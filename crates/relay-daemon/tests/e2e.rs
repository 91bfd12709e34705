//! End-to-end tests for relay-daemon.
//!
//! Starts the relay in-process on random ports and drives it with real
//! WebSocket clients: admission, session presence, drawing relay,
//! signaling, malformed input and abrupt disconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_core::{ChannelSink, Relay, SignalingHandler, TokenGrant};
use relay_daemon::{api, Config, RelayServer};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Test client connected to the relay.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect with `token`, auto-joining `session` if given.
    async fn connect(addr: SocketAddr, token: &str, session: Option<&str>) -> Self {
        let url = match session {
            Some(session) => format!("ws://{}/ws/{}?session_id={}", addr, token, session),
            None => format!("ws://{}/ws/{}", addr, token),
        };
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        Self { ws }
    }

    /// Connect and auto-join, consuming the `current_users` snapshot.
    async fn join(addr: SocketAddr, token: &str, session: &str) -> (Self, Value) {
        let mut client = Self::connect(addr, token, Some(session)).await;
        let snapshot = client.expect_event("current_users").await;
        (client, snapshot)
    }

    /// Receive the next JSON message.
    async fn recv_json(&mut self) -> Value {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).expect("Relay sent invalid JSON");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Ok(other)) => panic!("Unexpected message: {:?}", other),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
            }
        }
    }

    /// Receive the next message and check its type.
    async fn expect_event(&mut self, event_type: &str) -> Value {
        let value = timeout(RECV_TIMEOUT, self.recv_json())
            .await
            .unwrap_or_else(|_| panic!("Timeout waiting for {}", event_type));
        assert_eq!(value["type"], event_type, "unexpected message: {}", value);
        value
    }

    /// Assert nothing arrives for a short while.
    async fn expect_silence(&mut self) {
        if let Ok(value) = timeout(QUIET_PERIOD, self.recv_json()).await {
            panic!("Expected no message, got {}", value);
        }
    }

    /// Wait for the relay to close the connection.
    async fn expect_closed(&mut self) {
        let result = timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => panic!("Expected close, got {}", text),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(result.is_ok(), "Connection was not closed");
    }

    async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("Failed to send message");
    }

    /// Close connection gracefully.
    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct TestRelay {
    relay: Arc<Relay>,
    addr: SocketAddr,
    http_addr: SocketAddr,
}

/// Start the WebSocket server and HTTP API on random ports.
async fn start_relay(config: Config) -> TestRelay {
    let relay = Arc::new(Relay::new());
    let mut handler = SignalingHandler::new(Arc::clone(&relay));
    if let Some(store) = config.whiteboard_store().expect("Failed to open store") {
        handler = handler.with_store(store);
    }

    let server = Arc::new(RelayServer::new(
        Arc::new(handler),
        config.identity_provider(),
        config.relay.clone(),
    ));
    let listener = RelayServer::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(server.run(listener));

    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind HTTP");
    let http_addr = http_listener.local_addr().expect("Failed to get HTTP addr");
    let app = api::router(Arc::clone(&relay));
    tokio::spawn(async move {
        let _ = axum::serve(http_listener, app).await;
    });

    TestRelay {
        relay,
        addr,
        http_addr,
    }
}

/// Poll until `check` holds or the timeout expires.
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Minimal HTTP/1.1 GET returning the parsed JSON body.
async fn http_get_json(addr: SocketAddr, path: &str) -> Value {
    let mut stream = TcpStream::connect(addr).await.expect("Failed to connect HTTP");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "response: {}", response);
    let (_, body) = response.split_once("\r\n\r\n").expect("No HTTP body");
    serde_json::from_str(body).expect("Body is not JSON")
}

fn user_ids(snapshot: &Value) -> Vec<String> {
    snapshot["users"]
        .as_array()
        .expect("users must be an array")
        .iter()
        .map(|user| user["user_id"].as_str().unwrap().to_string())
        .collect()
}

// ============================================================================
// Session presence
// ============================================================================

#[tokio::test]
async fn test_first_member_gets_empty_snapshot() {
    let relay = start_relay(Config::default()).await;

    let (alice, snapshot) = TestClient::join(relay.addr, "alice", "board1").await;
    assert!(user_ids(&snapshot).is_empty());
    assert_eq!(relay.relay.get_session_users("board1"), vec!["alice"]);

    alice.close().await;
}

#[tokio::test]
async fn test_second_member_sees_first() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (bob, snapshot) = TestClient::join(relay.addr, "bob", "board1").await;

    assert_eq!(user_ids(&snapshot), vec!["alice"]);
    assert_eq!(snapshot["users"][0]["user_info"]["display_name"], "alice");

    let joined = alice.expect_event("user_joined").await;
    assert_eq!(joined["user_id"], "bob");
    assert_eq!(joined["user_info"]["display_name"], "bob");

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_join_by_message() {
    let relay = start_relay(Config::default()).await;

    let mut alice = TestClient::connect(relay.addr, "alice", None).await;
    assert!(relay.relay.get_session_users("board1").is_empty());

    alice
        .send_json(json!({"type": "join_session", "session_id": "board1"}))
        .await;
    let snapshot = alice.expect_event("current_users").await;
    assert!(user_ids(&snapshot).is_empty());

    let (bob, snapshot) = TestClient::join(relay.addr, "bob", "board1").await;
    assert_eq!(user_ids(&snapshot), vec!["alice"]);
    alice.expect_event("user_joined").await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_leave_session_notifies_members() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    bob.send_json(json!({"type": "leave_session"})).await;
    let left = alice.expect_event("user_left").await;
    assert_eq!(left["user_id"], "bob");
    assert!(wait_until(|| relay.relay.get_session_users("board1") == vec!["alice"]).await);

    // Still connected, just not in a session
    assert!(relay.relay.is_connected("bob"));
    bob.expect_silence().await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_graceful_close_notifies_members() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    bob.close().await;
    let left = alice.expect_event("user_left").await;
    assert_eq!(left["user_id"], "bob");
    assert!(wait_until(|| !relay.relay.is_connected("bob")).await);

    alice.close().await;
}

// ============================================================================
// Drawing and signaling
// ============================================================================

#[tokio::test]
async fn test_drawing_relayed_without_echo() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    let stroke = json!({"tool": "pen", "coordinates": [{"x": 1.0, "y": 2.0}], "style": {"color": "#000"}});
    alice
        .send_json(json!({"type": "drawing_data", "data": stroke}))
        .await;

    let drawing = bob.expect_event("drawing_data").await;
    assert_eq!(drawing["user_id"], "alice");
    assert_eq!(drawing["data"], stroke);
    assert!(drawing["timestamp"].as_str().unwrap().ends_with('Z'));

    alice.expect_silence().await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_drawing_stays_in_session() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut carol, _) = TestClient::join(relay.addr, "carol", "board2").await;

    alice
        .send_json(json!({"type": "drawing_data", "data": {"tool": "line"}}))
        .await;
    carol.expect_silence().await;

    alice.close().await;
    carol.close().await;
}

#[tokio::test]
async fn test_signal_forwarded_to_target() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    alice
        .send_json(json!({"type": "offer", "target_peer_id": "bob", "sdp": "v=0"}))
        .await;
    let offer = bob.expect_event("offer").await;
    assert_eq!(offer["source_peer_id"], "alice");
    assert_eq!(offer["target_peer_id"], "bob");
    assert_eq!(offer["sdp"], "v=0");

    bob.send_json(json!({"type": "answer", "target_user_id": "alice", "sdp": "v=0"}))
        .await;
    let answer = alice.expect_event("answer").await;
    assert_eq!(answer["source_peer_id"], "bob");

    bob.send_json(json!({"type": "ice_candidate", "target_peer_id": "alice", "candidate": {"sdpMid": "0"}}))
        .await;
    let candidate = alice.expect_event("ice_candidate").await;
    assert_eq!(candidate["candidate"]["sdpMid"], "0");

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_signal_to_unknown_peer_is_dropped() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    alice
        .send_json(json!({"type": "offer", "target_peer_id": "carol", "sdp": "v=0"}))
        .await;
    alice.expect_silence().await;
    bob.expect_silence().await;

    // Alice is still served normally
    bob.send_json(json!({"type": "drawing_data", "data": {"tool": "pen"}}))
        .await;
    alice.expect_event("drawing_data").await;

    alice.close().await;
    bob.close().await;
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_failed_delivery_removes_peer() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;

    // Bob is admitted straight into the relay with a queue nobody drains,
    // so his socket never closes: only a failed send can remove him.
    let (sink, outbox) = ChannelSink::channel(8);
    relay.relay.connect("bob", Box::new(sink), None);
    relay.relay.join_session("bob", "board1");
    alice.expect_event("user_joined").await;
    drop(outbox);
    assert!(relay.relay.is_connected("bob"));

    alice
        .send_json(json!({"type": "drawing_data", "data": {"tool": "pen"}}))
        .await;

    let left = alice.expect_event("user_left").await;
    assert_eq!(left["user_id"], "bob");
    assert!(!relay.relay.is_connected("bob"));
    assert_eq!(relay.relay.get_session_users("board1"), vec!["alice"]);

    alice.close().await;
}

#[tokio::test]
async fn test_abrupt_disconnect_removes_peer() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    // Drop the socket without a close handshake
    drop(bob);

    alice
        .send_json(json!({"type": "drawing_data", "data": {"tool": "pen"}}))
        .await;

    let left = alice.expect_event("user_left").await;
    assert_eq!(left["user_id"], "bob");
    assert!(wait_until(|| relay.relay.get_session_users("board1") == vec!["alice"]).await);

    alice.close().await;
}

#[tokio::test]
async fn test_malformed_messages_are_tolerated() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    alice.send_json(json!({"type": "teleport"})).await;
    alice.send_json(json!({"type": "offer", "sdp": "v=0"})).await;
    alice.send_json(json!({"type": "join_session"})).await;
    alice.send_json(json!({"session_id": "board1"})).await;

    alice
        .send_json(json!({"type": "drawing_data", "data": {"tool": "circle"}}))
        .await;
    let drawing = bob.expect_event("drawing_data").await;
    assert_eq!(drawing["data"]["tool"], "circle");
    assert_eq!(relay.relay.session_of("alice").as_deref(), Some("board1"));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_invalid_json_disconnects() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    bob.send_text("{ not json").await;
    bob.expect_closed().await;

    let left = alice.expect_event("user_left").await;
    assert_eq!(left["user_id"], "bob");
    assert!(wait_until(|| !relay.relay.is_connected("bob")).await);

    alice.close().await;
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let relay = start_relay(Config::default()).await;

    let (mut first, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut second, snapshot) = TestClient::join(relay.addr, "alice", "board1").await;
    assert!(user_ids(&snapshot).is_empty());

    // The superseded socket is closed by the relay
    first.expect_closed().await;

    // ...and its teardown does not evict the replacement
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(relay.relay.get_session_users("board1"), vec!["alice"]);

    let (bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    second.expect_event("user_joined").await;

    second.close().await;
    bob.close().await;
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_token_grants_resolve_identity() {
    let mut config = Config::default();
    config.identity.trust_unknown_tokens = false;
    config.identity.tokens.push(TokenGrant {
        token: "t-alice".into(),
        peer_id: "alice".into(),
        display_name: Some("Alice".into()),
        active: true,
    });
    config.identity.tokens.push(TokenGrant {
        token: "t-bob".into(),
        peer_id: "bob".into(),
        display_name: None,
        active: true,
    });
    let relay = start_relay(config).await;

    let (mut alice, _) = TestClient::join(relay.addr, "t-alice", "board1").await;
    let (bob, snapshot) = TestClient::join(relay.addr, "t-bob", "board1").await;

    assert_eq!(user_ids(&snapshot), vec!["alice"]);
    assert_eq!(snapshot["users"][0]["user_info"]["display_name"], "Alice");
    let joined = alice.expect_event("user_joined").await;
    assert_eq!(joined["user_id"], "bob");

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    let mut config = Config::default();
    config.identity.trust_unknown_tokens = false;
    let relay = start_relay(config).await;

    let mut mallory = TestClient::connect(relay.addr, "mallory", Some("board1")).await;
    mallory.expect_closed().await;

    assert!(!relay.relay.is_connected("mallory"));
    assert!(relay.relay.get_session_users("board1").is_empty());
}

#[tokio::test]
async fn test_bad_path_rejected() {
    let relay = start_relay(Config::default()).await;
    let url = format!("ws://{}/not-a-socket", relay.addr);
    assert!(connect_async(&url).await.is_err());
}

// ============================================================================
// HTTP API and persistence
// ============================================================================

#[tokio::test]
async fn test_http_session_users() {
    let relay = start_relay(Config::default()).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    let body = http_get_json(relay.http_addr, "/sessions/board1/users").await;
    assert_eq!(body["session_id"], "board1");
    assert_eq!(body["active_users"], json!(["alice", "bob"]));

    let health = http_get_json(relay.http_addr, "/health").await;
    assert_eq!(health["status"], "healthy");

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_drawings_persisted_to_data_dir() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.persist_drawings = true;
    config.storage.data_dir = Some(dir.path().to_path_buf());
    let relay = start_relay(config).await;

    let (mut alice, _) = TestClient::join(relay.addr, "alice", "board1").await;
    let (mut bob, _) = TestClient::join(relay.addr, "bob", "board1").await;
    alice.expect_event("user_joined").await;

    alice
        .send_json(json!({"type": "drawing_data", "data": {"tool": "rectangle", "coordinates": [{"x": 0.0, "y": 0.0}, {"x": 4.0, "y": 3.0}]}}))
        .await;
    bob.expect_event("drawing_data").await;

    let path = dir.path().join("board1.jsonl");
    assert!(wait_until(|| std::fs::read_to_string(&path).is_ok_and(|c| c.ends_with('\n'))).await);
    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let saved: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(saved["type"], "rectangle");
    assert_eq!(saved["coordinates"][1]["x"], 4.0);

    alice.close().await;
    bob.close().await;
}
