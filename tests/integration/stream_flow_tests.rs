// ====================================
// tests/integration/stream_flow_tests.rs
// ====================================
//! End-to-end flows over HTTP: stream greeting, presence, fan-out and emit
//! rejections, plus the multiplexer's one-stream-per-room behavior.

use std::sync::Arc;
use std::time::Duration;

use client_lib::transport::{HttpTransport, Transport};
use client_lib::{ClientError, ConnectionState};
use relay_common::{kinds, EmitRequest, Envelope, Presence, Ready, StreamParams};
use serde_json::json;

use crate::test_utils::{next_frame, test_settings, user, wait_until, TestServer};

const ROOM: &str = "company:acme:main";

fn transport(server: &TestServer) -> HttpTransport {
    HttpTransport::new(&server.client_config()).expect("Failed to build transport")
}

fn emit(room: &str, event: &str, from: &str, payload: serde_json::Value) -> EmitRequest {
    EmitRequest {
        room: room.to_string(),
        event: event.to_string(),
        payload,
        user: user(from),
    }
}

#[tokio::test]
async fn test_snapshot_and_ready_precede_events() {
    let server = TestServer::start().await;
    let http = transport(&server);

    let mut alice = http
        .open_stream(&StreamParams::new(ROOM, &user("alice")))
        .await
        .unwrap();

    let first = next_frame(&mut alice).await;
    assert_eq!(first.event, kinds::PRESENCE);
    let Presence::State { members } = serde_json::from_str(&first.data).unwrap() else {
        panic!("expected a presence snapshot, got {}", first.data);
    };
    assert_eq!(members, vec![user("alice")]);

    let second = next_frame(&mut alice).await;
    assert_eq!(second.event, kinds::READY);
    let ready: Ready = serde_json::from_str(&second.data).unwrap();
    assert_eq!(ready.room, ROOM);
    assert!(!ready.connection_id.is_empty());
}

#[tokio::test]
async fn test_join_chat_and_leave() {
    let server = TestServer::start().await;
    let http = transport(&server);

    let mut alice = http
        .open_stream(&StreamParams::new(ROOM, &user("alice")))
        .await
        .unwrap();
    next_frame(&mut alice).await;
    next_frame(&mut alice).await;

    let mut bob = http
        .open_stream(&StreamParams::new(ROOM, &user("bob")))
        .await
        .unwrap();
    let Presence::State { members } = serde_json::from_str(&next_frame(&mut bob).await.data).unwrap() else {
        panic!("expected a presence snapshot");
    };
    assert_eq!(members.len(), 2);

    let join = next_frame(&mut alice).await;
    assert_eq!(
        serde_json::from_str::<Presence>(&join.data).unwrap(),
        Presence::Join { user: user("bob") }
    );

    http.emit(&emit(ROOM, "chat", "bob", json!({"id": "m1", "text": "hello"})))
        .await
        .unwrap();
    let chat = next_frame(&mut alice).await;
    assert_eq!(chat.event, "chat");
    let envelope: Envelope = serde_json::from_str(&chat.data).unwrap();
    assert_eq!(envelope.user.id, "bob");
    assert_eq!(envelope.payload["text"], "hello");
    assert!(envelope.ts > 0);

    drop(bob);
    let leave = next_frame(&mut alice).await;
    assert_eq!(
        serde_json::from_str::<Presence>(&leave.data).unwrap(),
        Presence::Leave { user: user("bob") }
    );
    assert_eq!(server.state.registry.connection_count(ROOM), 1);
}

#[tokio::test]
async fn test_sender_does_not_receive_own_event() {
    let server = TestServer::start().await;
    let http = transport(&server);

    let mut alice = http
        .open_stream(&StreamParams::new(ROOM, &user("alice")))
        .await
        .unwrap();
    next_frame(&mut alice).await;
    next_frame(&mut alice).await;

    http.emit(&emit(ROOM, "chat", "alice", json!({"id": "m1", "text": "self"})))
        .await
        .unwrap();
    http.emit(&emit(ROOM, "chat", "bob", json!({"id": "m2", "text": "other"})))
        .await
        .unwrap();

    let frame = next_frame(&mut alice).await;
    let envelope: Envelope = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(envelope.payload["id"], "m2");
}

#[tokio::test]
async fn test_echo_to_sender_when_enabled() {
    let mut settings = test_settings();
    settings.broker.echo_to_sender = true;
    let server = TestServer::start_with(settings).await;
    let http = transport(&server);

    let mut alice = http
        .open_stream(&StreamParams::new(ROOM, &user("alice")))
        .await
        .unwrap();
    next_frame(&mut alice).await;
    next_frame(&mut alice).await;

    http.emit(&emit(ROOM, "chat", "alice", json!({"id": "m1", "text": "self"})))
        .await
        .unwrap();
    let frame = next_frame(&mut alice).await;
    assert_eq!(frame.event, "chat");
}

#[tokio::test]
async fn test_events_arrive_in_publish_order() {
    let server = TestServer::start().await;
    let http = transport(&server);

    let mut alice = http
        .open_stream(&StreamParams::new(ROOM, &user("alice")))
        .await
        .unwrap();
    next_frame(&mut alice).await;
    next_frame(&mut alice).await;

    for seq in 0..20 {
        http.emit(&emit(ROOM, "cursor", "bob", json!({"x": seq, "y": 0})))
            .await
            .unwrap();
    }
    for seq in 0..20 {
        let envelope: Envelope = serde_json::from_str(&next_frame(&mut alice).await.data).unwrap();
        assert_eq!(envelope.payload["x"], seq);
    }
}

#[tokio::test]
async fn test_rooms_do_not_leak_into_each_other() {
    let server = TestServer::start().await;
    let http = transport(&server);

    let mut alice = http
        .open_stream(&StreamParams::new("company:acme:design", &user("alice")))
        .await
        .unwrap();
    next_frame(&mut alice).await;
    next_frame(&mut alice).await;
    let mut carol = http
        .open_stream(&StreamParams::new(ROOM, &user("carol")))
        .await
        .unwrap();
    next_frame(&mut carol).await;
    next_frame(&mut carol).await;

    http.emit(&emit(ROOM, "chat", "bob", json!({"id": "m1", "text": "main only"})))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut carol).await.event, "chat");
    http.emit(&emit("company:acme:design", "chat", "bob", json!({"id": "m2", "text": "design"})))
        .await
        .unwrap();

    // the first thing alice sees is the event of her own room
    let frame = next_frame(&mut alice).await;
    let envelope: Envelope = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(envelope.payload["id"], "m2");
}

#[tokio::test]
async fn test_snapshot_omits_user_whose_tabs_all_closed() {
    let server = TestServer::start().await;
    let http = transport(&server);

    let tab1 = http
        .open_stream(&StreamParams::new(ROOM, &user("alice")))
        .await
        .unwrap();
    let tab2 = http
        .open_stream(&StreamParams::new(ROOM, &user("alice")))
        .await
        .unwrap();
    let registry = Arc::clone(&server.state.registry);
    wait_until("both tabs registered", || registry.connection_count(ROOM) == 2).await;

    drop(tab1);
    drop(tab2);
    wait_until("tabs unregistered", || registry.connection_count(ROOM) == 0).await;

    let mut bob = http
        .open_stream(&StreamParams::new(ROOM, &user("bob")))
        .await
        .unwrap();
    let Presence::State { members } = serde_json::from_str(&next_frame(&mut bob).await.data).unwrap() else {
        panic!("expected a presence snapshot");
    };
    assert_eq!(members, vec![user("bob")]);
}

#[tokio::test]
async fn test_emit_to_empty_room_succeeds() {
    let server = TestServer::start().await;
    let http = transport(&server);
    http.emit(&emit("nobody:here", "chat", "alice", json!({"text": "hi"})))
        .await
        .unwrap();
    assert_eq!(server.state.registry.room_count(), 0);
}

#[tokio::test]
async fn test_invalid_emit_is_rejected() {
    let server = TestServer::start().await;
    let http = transport(&server);

    let err = http.emit(&emit("", "chat", "alice", json!({}))).await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 400, .. }), "{err:?}");
    assert!(err.is_rejection());
}

#[tokio::test]
async fn test_emit_rate_limit() {
    let mut settings = test_settings();
    settings.rate_limit.max_requests = 2;
    let server = TestServer::start_with(settings).await;
    let http = transport(&server);

    for _ in 0..2 {
        http.emit(&emit(ROOM, "chat", "alice", json!({}))).await.unwrap();
    }
    let err = http.emit(&emit(ROOM, "chat", "alice", json!({}))).await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 429, .. }), "{err:?}");
}

#[tokio::test]
async fn test_stream_without_identity_is_rejected() {
    let server = TestServer::start().await;
    let http = transport(&server);
    let params = StreamParams {
        room: ROOM.to_string(),
        id: String::new(),
        name: String::new(),
        role: Default::default(),
    };
    let err = http.open_stream(&params).await.err().expect("stream should be refused");
    assert!(matches!(err, ClientError::Status { status: 400, .. }), "{err:?}");
}

#[tokio::test]
async fn test_multiplexer_shares_one_stream_per_room() {
    let server = TestServer::start().await;
    let mux = server.multiplexer("alice");

    let chat = mux.subscribe(ROOM, "chat", |_| {});
    let typing = mux.subscribe(ROOM, "typing", |_| {});
    let presence = mux.subscribe(ROOM, "presence", |_| {});
    let registry = Arc::clone(&server.state.registry);
    wait_until("stream registered", || registry.connection_count(ROOM) == 1).await;

    let mut state = mux.watch_state(ROOM).unwrap();
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    drop(chat);
    drop(typing);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.connection_count(ROOM), 1);

    drop(presence);
    wait_until("stream unregistered", || registry.connection_count(ROOM) == 0).await;
}

#[tokio::test]
async fn test_multiplexer_delivers_by_type() {
    let server = TestServer::start().await;
    let alice = server.multiplexer("alice");
    let bob = server.multiplexer("bob");

    let chats = Arc::new(counter::Counter::default());
    let typing = Arc::new(counter::Counter::default());
    let (c, t) = (Arc::clone(&chats), Arc::clone(&typing));
    let _chat = alice.subscribe(ROOM, "chat", move |_| c.bump());
    let _typing = alice.subscribe(ROOM, "typing", move |_| t.bump());
    let registry = Arc::clone(&server.state.registry);
    wait_until("alice connected", || registry.connection_count(ROOM) == 1).await;

    bob.trigger(ROOM, "chat", json!({"id": "m1", "text": "hi"}))
        .await
        .unwrap();
    wait_until("chat delivered", || chats.get() == 1).await;
    assert_eq!(typing.get(), 0);
}

mod counter {
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct Counter(AtomicUsize);

    impl Counter {
        pub fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        pub fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }
}
