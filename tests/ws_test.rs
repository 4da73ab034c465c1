//! End-to-end WebSocket tests: in-band authentication, conversation
//! fan-out, duplicate logins, direct notifications, and failure
//! containment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use portal_chat_server::db;
use portal_chat_server::db::models::{ChatMessage, ConversationRow, ParticipantRow};
use portal_chat_server::routes;
use portal_chat_server::state::AppState;
use portal_chat_server::store::{
    ChatStore, NewChatMessage, SharedChatStore, SqliteChatStore, StoreError,
};
use portal_chat_server::ws::{broadcast, ConnectionRegistry};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Start the server on a random port with a fresh database. Returns the
/// state so tests can seed the store and inspect the registry.
async fn start_test_server() -> (AppState, SocketAddr, tempfile::TempDir) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();
    let db = db::init_db(&data_dir).expect("Failed to init DB");
    let store: SharedChatStore = Arc::new(SqliteChatStore::new(db));
    start_with_store(store, tmp_dir).await
}

async fn start_with_store(
    store: SharedChatStore,
    tmp_dir: tempfile::TempDir,
) -> (AppState, SocketAddr, tempfile::TempDir) {
    let state = AppState {
        store,
        registry: Arc::new(ConnectionRegistry::new()),
    };

    let app = routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, addr, tmp_dir)
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to WebSocket");
    stream
}

async fn send_json(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Receive the next JSON frame, skipping transport-level ping/pong.
async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("Invalid JSON frame")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text frame, got: {:?}", other),
        }
    }
}

async fn expect_silence(ws: &mut WsStream) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "Expected no frame, got: {:?}", result);
}

async fn authenticate(ws: &mut WsStream, user_id: &str) {
    send_json(ws, json!({"type": "auth", "userId": user_id})).await;
    let reply = recv_json(ws).await;
    assert_eq!(reply["type"], "auth_success", "auth reply: {}", reply);
}

fn seed_conversation(store: &SharedChatStore, users: &[&str]) -> String {
    let conversation_id = store
        .create_conversation(None)
        .expect("Failed to create conversation");
    for user in users {
        store
            .add_participant(&conversation_id, user, "member")
            .expect("Failed to add participant");
    }
    conversation_id
}

#[tokio::test]
async fn auth_registers_connection() {
    let (state, addr, _tmp) = start_test_server().await;
    seed_conversation(&state.store, &["u1"]);

    let mut ws = connect(addr).await;
    authenticate(&mut ws, "u1").await;

    assert!(state.registry.contains("u1"));
    assert_eq!(state.registry.connection_count(), 1);
}

#[tokio::test]
async fn message_fans_out_to_subscribed_participants_only() {
    let (state, addr, _tmp) = start_test_server().await;
    let c1 = seed_conversation(&state.store, &["u1", "u2"]);
    seed_conversation(&state.store, &["u3"]);

    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    let mut carol = connect(addr).await;
    authenticate(&mut alice, "u1").await;
    authenticate(&mut bob, "u2").await;
    authenticate(&mut carol, "u3").await;

    send_json(
        &mut alice,
        json!({
            "type": "send_message",
            "conversationId": c1,
            "senderName": "Alice",
            "content": "hi",
        }),
    )
    .await;

    // Both subscribed participants (sender included) receive exactly the
    // persisted record, with server-assigned identity and timestamp.
    let to_alice = recv_json(&mut alice).await;
    let to_bob = recv_json(&mut bob).await;
    for frame in [&to_alice, &to_bob] {
        assert_eq!(frame["type"], "new_message");
        let message = &frame["message"];
        assert_eq!(message["conversationId"], c1);
        assert_eq!(message["senderId"], "u1");
        assert_eq!(message["senderName"], "Alice");
        assert_eq!(message["content"], "hi");
        assert_eq!(message["messageType"], "text");
        assert!(message["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(message["createdAt"]
            .as_str()
            .is_some_and(|ts| !ts.is_empty()));
    }
    assert_eq!(to_alice["message"]["id"], to_bob["message"]["id"]);

    // u3 is only in the other conversation.
    expect_silence(&mut carol).await;
    expect_silence(&mut alice).await;
}

#[tokio::test]
async fn send_message_before_auth_is_rejected() {
    let (state, addr, _tmp) = start_test_server().await;
    let c1 = seed_conversation(&state.store, &["u1", "u2"]);

    let mut observer = connect(addr).await;
    authenticate(&mut observer, "u2").await;

    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        json!({
            "type": "send_message",
            "conversationId": c1,
            "senderName": "Alice",
            "content": "hi",
        }),
    )
    .await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Not authenticated");

    // Nothing was persisted or broadcast.
    expect_silence(&mut observer).await;

    // The rejection did not close the socket: auth and send now succeed.
    authenticate(&mut ws, "u1").await;
    send_json(
        &mut ws,
        json!({
            "type": "send_message",
            "conversationId": c1,
            "senderName": "Alice",
            "content": "after auth",
        }),
    )
    .await;
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["message"]["content"], "after auth");
}

#[tokio::test]
async fn join_and_mark_read_before_auth_are_rejected() {
    let (_state, addr, _tmp) = start_test_server().await;

    let mut ws = connect(addr).await;

    send_json(&mut ws, json!({"type": "join_conversation", "conversationId": "c1"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Not authenticated");

    send_json(&mut ws, json!({"type": "mark_read", "conversationId": "c1"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Not authenticated");
}

#[tokio::test]
async fn join_conversation_extends_broadcast_audience() {
    let (state, addr, _tmp) = start_test_server().await;
    let c1 = seed_conversation(&state.store, &["u1"]);

    let mut alice = connect(addr).await;
    let mut late = connect(addr).await;
    authenticate(&mut alice, "u1").await;
    authenticate(&mut late, "u9").await;

    // Not a participant at auth time — no delivery.
    send_json(
        &mut alice,
        json!({
            "type": "send_message",
            "conversationId": c1,
            "senderName": "Alice",
            "content": "first",
        }),
    )
    .await;
    assert_eq!(recv_json(&mut alice).await["type"], "new_message");
    expect_silence(&mut late).await;

    // An explicit join updates the subscription snapshot. Join has no
    // acknowledgement frame, so give the server a moment to process it.
    send_json(&mut late, json!({"type": "join_conversation", "conversationId": c1})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_json(
        &mut alice,
        json!({
            "type": "send_message",
            "conversationId": c1,
            "senderName": "Alice",
            "content": "second",
        }),
    )
    .await;
    assert_eq!(recv_json(&mut alice).await["message"]["content"], "second");
    assert_eq!(recv_json(&mut late).await["message"]["content"], "second");
}

#[tokio::test]
async fn duplicate_login_replaces_older_socket() {
    let (state, addr, _tmp) = start_test_server().await;
    let c1 = seed_conversation(&state.store, &["u1", "u2"]);

    let mut older = connect(addr).await;
    authenticate(&mut older, "u1").await;
    let mut newer = connect(addr).await;
    authenticate(&mut newer, "u1").await;

    let mut sender = connect(addr).await;
    authenticate(&mut sender, "u2").await;
    send_json(
        &mut sender,
        json!({
            "type": "send_message",
            "conversationId": c1,
            "senderName": "Blake",
            "content": "anyone there?",
        }),
    )
    .await;

    // Only the latest login for u1 receives the broadcast.
    let frame = recv_json(&mut newer).await;
    assert_eq!(frame["message"]["content"], "anyone there?");
    expect_silence(&mut older).await;

    // The older socket's close must not evict the newer registration.
    older.close(None).await.expect("Failed to close");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.registry.contains("u1"));
}

#[tokio::test]
async fn notify_reaches_connected_user_and_skips_absent() {
    let (state, addr, _tmp) = start_test_server().await;
    seed_conversation(&state.store, &["u1"]);

    let mut ws = connect(addr).await;
    authenticate(&mut ws, "u1").await;

    let payload = json!({"type": "notification", "title": "Policy renewal due"});
    broadcast::notify_user(&state.registry, "u1", &payload);
    assert_eq!(recv_json(&mut ws).await, payload);

    // Nobody by that name is connected — silent no-op.
    broadcast::notify_user(&state.registry, "u2", &payload);

    ws.close(None).await.expect("Failed to close");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!state.registry.contains("u1"));

    // Gone after disconnect as well; nothing is queued for later.
    broadcast::notify_user(&state.registry, "u1", &payload);
}

#[tokio::test]
async fn malformed_frames_keep_connection_alive() {
    let (state, addr, _tmp) = start_test_server().await;
    seed_conversation(&state.store, &["u1"]);

    let mut ws = connect(addr).await;

    ws.send(Message::Text("not json at all".into()))
        .await
        .expect("Failed to send");
    send_json(&mut ws, json!({"missing": "type tag"})).await;
    send_json(&mut ws, json!({"type": "bogus_command"})).await;

    // No error frames, no close — and the protocol still works.
    expect_silence(&mut ws).await;
    authenticate(&mut ws, "u1").await;
}

#[tokio::test]
async fn mark_read_writes_through_to_store() {
    let (state, addr, _tmp) = start_test_server().await;
    let c1 = seed_conversation(&state.store, &["u1"]);

    let mut ws = connect(addr).await;
    authenticate(&mut ws, "u1").await;

    send_json(&mut ws, json!({"type": "mark_read", "conversationId": c1})).await;

    // mark_read has no acknowledgement frame; poll the store instead.
    let mut last_read = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        last_read = state
            .store
            .participant(&c1, "u1")
            .expect("Failed to look up participant")
            .and_then(|row| row.last_read_at);
        if last_read.is_some() {
            break;
        }
    }
    assert!(last_read.is_some(), "last_read_at was never written");
}

/// Gateway double whose message writes always fail. Membership reads
/// succeed so sockets can authenticate into conversation "c1".
struct RejectingStore;

impl ChatStore for RejectingStore {
    fn create_chat_message(&self, _message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        Err(StoreError::Database(rusqlite::Error::QueryReturnedNoRows))
    }

    fn conversations_for_user(&self, _user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(vec!["c1".to_string()])
    }

    fn update_last_read_at(&self, _user_id: &str, _conversation_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn create_conversation(&self, _title: Option<&str>) -> Result<String, StoreError> {
        Err(StoreError::Database(rusqlite::Error::QueryReturnedNoRows))
    }

    fn add_participant(
        &self,
        _conversation_id: &str,
        _user_id: &str,
        _role: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn participant(
        &self,
        _conversation_id: &str,
        _user_id: &str,
    ) -> Result<Option<ParticipantRow>, StoreError> {
        Ok(None)
    }

    fn conversation(&self, _conversation_id: &str) -> Result<Option<ConversationRow>, StoreError> {
        Ok(None)
    }
}

#[tokio::test]
async fn persistence_failure_produces_no_frames_and_keeps_connection_usable() {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let (_state, addr, _tmp) = start_with_store(Arc::new(RejectingStore), tmp_dir).await;

    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    authenticate(&mut alice, "u1").await;
    authenticate(&mut bob, "u2").await;

    send_json(
        &mut alice,
        json!({
            "type": "send_message",
            "conversationId": "c1",
            "senderName": "Alice",
            "content": "hi",
        }),
    )
    .await;

    // The failed write is contained: no frame to the sender, no broadcast
    // to any participant.
    expect_silence(&mut alice).await;
    expect_silence(&mut bob).await;

    // The connection is still usable for subsequent commands.
    send_json(&mut alice, json!({"type": "mark_read", "conversationId": "c1"})).await;
    authenticate(&mut alice, "u1").await;
}
