// ==================================
// tests/integration/team_sync_tests.rs
// ==================================
//! Two team sync engines talking through a live relay.

use std::sync::Arc;

use client_lib::transport::{HttpTransport, Transport};
use client_lib::{LogNotifier, Notifier, SyncConfig, TeamSync};
use inbox::Inbox;
use relay_common::{dm_key, kinds, PresenceStatus, StreamParams};

use crate::test_utils::{next_frame, user, wait_until, TestServer};

const ROOM: &str = "company:acme:main";

fn start(server: &TestServer, user_id: &str, notifier: Arc<dyn Notifier>) -> TeamSync {
    TeamSync::start(server.multiplexer(user_id), SyncConfig::new(ROOM), notifier)
}

async fn connected_pair(server: &TestServer) -> (TeamSync, TeamSync) {
    let alice = start(server, "alice", Arc::new(LogNotifier));
    let bob = start(server, "bob", Arc::new(LogNotifier));
    wait_until("alice sees bob", || {
        alice
            .member("bob")
            .is_some_and(|m| m.status == PresenceStatus::Online)
    })
    .await;
    wait_until("bob sees alice", || bob.member("alice").is_some()).await;
    (alice, bob)
}

#[tokio::test]
async fn test_roster_follows_presence() {
    let server = TestServer::start().await;
    let (alice, bob) = connected_pair(&server).await;

    let roster = alice.roster();
    assert_eq!(roster[0].user.id, "alice");
    assert_eq!(roster[1].user.id, "bob");
    assert_eq!(roster[1].user.name, "Bob");

    bob.shutdown();
    wait_until("bob offline", || {
        alice
            .member("bob")
            .is_some_and(|m| m.status == PresenceStatus::Offline)
    })
    .await;
}

#[tokio::test]
async fn test_direct_messages_count_as_unread() {
    let server = TestServer::start().await;
    let (alice, bob) = connected_pair(&server).await;
    let registry = Arc::clone(&server.state.registry);
    wait_until("personal channels open", || {
        registry.connection_count("user:alice") == 1 && registry.connection_count("user:bob") == 1
    })
    .await;

    let sent = bob.send_private_message("alice", "lunch?").await.unwrap();
    assert_eq!(sent.conversation.as_deref(), Some(dm_key("alice", "bob").as_str()));
    bob.send_private_message("alice", "12:30").await.unwrap();

    wait_until("two unread", || alice.unread_count("bob") == 2).await;
    assert_eq!(alice.total_unread(), 2);
    assert_eq!(bob.total_unread(), 0);

    alice.mark_dm_as_read("bob");
    assert_eq!(alice.unread_count("bob"), 0);
}

#[tokio::test]
async fn test_direct_message_skips_bystanders() {
    let server = TestServer::start().await;
    let (alice, bob) = connected_pair(&server).await;
    let registry = Arc::clone(&server.state.registry);
    wait_until("personal channel open", || registry.connection_count("user:alice") == 1).await;

    let http = HttpTransport::new(&server.client_config()).unwrap();
    let mut carol = http.open_stream(&StreamParams::new(ROOM, &user("carol"))).await.unwrap();
    next_frame(&mut carol).await;
    next_frame(&mut carol).await;

    bob.send_private_message("alice", "just us").await.unwrap();
    wait_until("alice got the dm", || alice.unread_count("bob") == 1).await;
    bob.send_public_message("hello all").await.unwrap();

    // everything carol sees up to the public message, none of it private
    loop {
        let frame = next_frame(&mut carol).await;
        assert_ne!(frame.event, kinds::DM, "private message reached the main room");
        assert!(!frame.data.contains("just us"));
        if frame.event == kinds::CHAT {
            assert!(frame.data.contains("hello all"));
            break;
        }
    }
}

#[tokio::test]
async fn test_typing_and_status_propagate() {
    let server = TestServer::start().await;
    let (alice, bob) = connected_pair(&server).await;

    bob.set_typing(true, None).await.unwrap();
    wait_until("bob typing", || alice.typing_users(Some(ROOM)).len() == 1).await;
    bob.set_typing(false, None).await.unwrap();
    wait_until("bob stopped", || alice.typing_users(None).is_empty()).await;

    bob.change_status(PresenceStatus::Busy).await.unwrap();
    wait_until("bob busy", || {
        alice
            .member("bob")
            .is_some_and(|m| m.status == PresenceStatus::Busy)
    })
    .await;
}

#[tokio::test]
async fn test_public_message_notifies_unfocused_peer() {
    let server = TestServer::start().await;
    let inbox = Arc::new(Inbox::default());
    let alice = start(&server, "alice", inbox.clone());
    let bob = start(&server, "bob", Arc::new(LogNotifier));
    wait_until("bob sees alice", || bob.member("alice").is_some()).await;

    alice.set_focused(false);
    bob.send_public_message("standup in 5").await.unwrap();

    wait_until("notification", || !inbox.is_empty()).await;
    let notification = inbox.first();
    assert_eq!(notification.kind, "chat");
    assert_eq!(notification.from.id, "bob");
    assert_eq!(notification.preview, "standup in 5");
}

mod inbox {
    use std::sync::Mutex;

    use client_lib::{Notification, Notifier};

    #[derive(Default)]
    pub struct Inbox(Mutex<Vec<Notification>>);

    impl Inbox {
        pub fn is_empty(&self) -> bool {
            self.0.lock().unwrap().is_empty()
        }

        pub fn first(&self) -> Notification {
            self.0.lock().unwrap()[0].clone()
        }
    }

    impl Notifier for Inbox {
        fn notify(&self, notification: Notification) {
            self.0.lock().unwrap().push(notification);
        }
    }
}

