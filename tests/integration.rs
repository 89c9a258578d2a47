//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use notesync::client::{SyncClient, SyncEvent};
use notesync::protocol::{ChangeMessage, ClientId, SessionInfo, WireMessage, unix_millis};
use notesync::server::{ServerConfig, SyncServer};
use notesync::storage::{DocumentStorage, MemoryStore};
use notesync::supervisor::SyncStatus;
use notesync::transport::connect_ws;
use std::sync::Arc;
use tokio::time::{Duration, timeout};

/// Start a server on an OS-assigned port, return the ws URL plus handles
/// into its shared state.
async fn start_test_server() -> (String, Arc<SyncServer>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        room_capacity: 64,
        max_members_per_room: 10,
        coalesce_window: Duration::from_millis(100),
        storage_path: None,
    };
    let server = Arc::new(SyncServer::with_storage(config, store.clone()));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://{addr}"), server, store)
}

async fn drain_connected(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>) {
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("expected Connected event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _server, _store) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_client_joins_room() {
    let (url, server, _store) = start_test_server().await;

    let client = SyncClient::new(SessionInfo::new("doc-join", "alice"));
    let mut events = client.take_event_rx().unwrap();
    client.connect(&url).await.unwrap();
    drain_connected(&mut events).await;

    // Membership becomes visible once the join frame is processed.
    let mut members = 0;
    for _ in 0..50 {
        members = server.broker().members("doc-join").await;
        if members == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(members, 1);
    assert_eq!(client.status(), SyncStatus::Synchronized);
}

#[tokio::test]
async fn test_peer_join_notification() {
    let (url, _server, _store) = start_test_server().await;

    let alice = SyncClient::new(SessionInfo::new("doc-peers", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut alice_events).await;

    let bob = SyncClient::new(SessionInfo::new("doc-peers", "bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(&url).await.unwrap();
    drain_connected(&mut bob_events).await;

    match timeout(Duration::from_secs(2), alice_events.recv()).await {
        Ok(Some(SyncEvent::PeerJoined { username })) => assert_eq!(username, "bob"),
        other => panic!("expected PeerJoined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_change_broadcast_between_clients() {
    let (url, _server, _store) = start_test_server().await;

    let alice = SyncClient::new(SessionInfo::new("doc-bcast", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut alice_events).await;

    let bob = SyncClient::new(SessionInfo::new("doc-bcast", "bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(&url).await.unwrap();
    drain_connected(&mut bob_events).await;
    let _ = timeout(Duration::from_secs(1), alice_events.recv()).await; // PeerJoined

    // Word boundary: flushes immediately and round-trips an ack.
    alice.emit_local_change("hello ");
    alice.flush_now().await;

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(SyncEvent::RemoteChange(change))) => {
            assert_eq!(change.content, "hello ");
            assert_eq!(change.document_id, "doc-bcast");
        }
        other => panic!("expected RemoteChange, got {other:?}"),
    }
    // Sender exclusion: alice never hears her own update back.
    assert!(
        timeout(Duration::from_millis(200), alice_events.recv())
            .await
            .is_err()
    );
    assert_eq!(alice.status(), SyncStatus::Synchronized);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, _server, _store) = start_test_server().await;

    let alice = SyncClient::new(SessionInfo::new("doc-a", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut alice_events).await;

    let carol = SyncClient::new(SessionInfo::new("doc-b", "carol"));
    let mut carol_events = carol.take_event_rx().unwrap();
    carol.connect(&url).await.unwrap();
    drain_connected(&mut carol_events).await;

    alice.emit_local_change("isolated text ");
    alice.flush_now().await;

    assert!(
        timeout(Duration::from_millis(300), carol_events.recv())
            .await
            .is_err(),
        "change must not leak across rooms"
    );
}

#[tokio::test]
async fn test_cursor_relay() {
    let (url, _server, _store) = start_test_server().await;

    let alice = SyncClient::new(SessionInfo::new("doc-cursor", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut alice_events).await;

    let bob = SyncClient::new(SessionInfo::new("doc-cursor", "bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(&url).await.unwrap();
    drain_connected(&mut bob_events).await;
    let _ = timeout(Duration::from_secs(1), alice_events.recv()).await; // PeerJoined

    alice.set_local_cursor(7, 56.0, 12.0).await;

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(SyncEvent::CursorMoved(cursor))) => {
            assert_eq!(cursor.offset, 7);
            assert_eq!(cursor.username, "alice");
        }
        other => panic!("expected CursorMoved, got {other:?}"),
    }
    assert_eq!(bob.remote_cursors().len(), 1);
}

#[tokio::test]
async fn test_title_broadcast() {
    let (url, _server, _store) = start_test_server().await;

    let alice = SyncClient::new(SessionInfo::new("doc-title", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut alice_events).await;

    let bob = SyncClient::new(SessionInfo::new("doc-title", "bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(&url).await.unwrap();
    drain_connected(&mut bob_events).await;
    let _ = timeout(Duration::from_secs(1), alice_events.recv()).await; // PeerJoined

    alice.emit_title_change("Retro agenda").await;

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(SyncEvent::RemoteTitle { title, .. })) => assert_eq!(title, "Retro agenda"),
        other => panic!("expected RemoteTitle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_close_notifies_peers() {
    let (url, server, _store) = start_test_server().await;

    let alice = SyncClient::new(SessionInfo::new("doc-leave", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut alice_events).await;

    let bob = SyncClient::new(SessionInfo::new("doc-leave", "bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(&url).await.unwrap();
    drain_connected(&mut bob_events).await;
    let _ = timeout(Duration::from_secs(1), alice_events.recv()).await; // PeerJoined

    bob.close().await;

    match timeout(Duration::from_secs(2), alice_events.recv()).await {
        Ok(Some(SyncEvent::PeerLeft)) => {}
        other => panic!("expected PeerLeft, got {other:?}"),
    }

    let mut members = usize::MAX;
    for _ in 0..50 {
        members = server.broker().members("doc-leave").await;
        if members == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(members, 1);
}

#[tokio::test]
async fn test_acked_change_is_persisted() {
    let (url, _server, store) = start_test_server().await;

    let alice = SyncClient::new(SessionInfo::new("doc-persist", "alice"));
    alice.set_user("u-1", "alice@example.com");
    let mut events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut events).await;

    alice.emit_local_change("meeting notes ");
    alice.flush_now().await;
    assert_eq!(alice.status(), SyncStatus::Synchronized);

    // Persistence runs after the ack, on the background worker.
    let mut record = None;
    for _ in 0..50 {
        record = store.load_document("doc-persist").unwrap();
        if record.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = record.expect("document should be persisted after ack");
    assert_eq!(record.snapshot_text, "meeting notes ");
    assert_eq!(record.revision, 1);
}

#[tokio::test]
async fn test_burst_coalesces_into_one_history_entry() {
    let (url, _server, store) = start_test_server().await;
    let doc = "doc-history";

    let alice = SyncClient::new(SessionInfo::new(doc, "alice"));
    alice.set_user("u-1", "alice@example.com");
    let mut events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut events).await;

    // Establish a first version, then let its (empty-before) burst expire.
    alice.emit_local_change("hello world ");
    alice.flush_now().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(store.load_document(doc).unwrap().is_some());
    assert!(store.history(doc).unwrap().is_empty());

    // A burst of saves within the window: one history entry.
    alice.emit_local_change("hello there world ");
    alice.flush_now().await;
    alice.emit_local_change("hello there big world ");
    alice.flush_now().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let history = store.history(doc).unwrap();
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(entry.before.as_deref(), Some("hello world "));
    assert_eq!(entry.after, "hello there big world ");
    assert_eq!(entry.user_id.as_deref(), Some("u-1"));
}

#[tokio::test]
async fn test_delivery_survives_persistence_failure() {
    let (url, _server, store) = start_test_server().await;
    store.set_fail_writes(true);

    let alice = SyncClient::new(SessionInfo::new("doc-failstore", "alice"));
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut alice_events).await;

    let bob = SyncClient::new(SessionInfo::new("doc-failstore", "bob"));
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect(&url).await.unwrap();
    drain_connected(&mut bob_events).await;
    let _ = timeout(Duration::from_secs(1), alice_events.recv()).await; // PeerJoined

    // The ack precedes persistence, so a broken store never blocks a save.
    alice.emit_local_change("doomed write ");
    alice.flush_now().await;
    assert_eq!(alice.status(), SyncStatus::Synchronized);
    assert!(!alice.has_unsynced());

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(SyncEvent::RemoteChange(change))) => {
            assert_eq!(change.content, "doomed write ");
        }
        other => panic!("expected RemoteChange, got {other:?}"),
    }

    // The background upsert failed and was only logged.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.load_document("doc-failstore").unwrap().is_none());
}

#[tokio::test]
async fn test_offline_gap_recovers_with_spanning_history() {
    let (url, _server, store) = start_test_server().await;
    let doc = "doc-gap";

    let alice = SyncClient::new(SessionInfo::new(doc, "alice"));
    alice.set_user("u-1", "alice@example.com");
    let mut events = alice.take_event_rx().unwrap();
    alice.connect(&url).await.unwrap();
    drain_connected(&mut events).await;

    // First version lands; let its (history-less) burst expire.
    alice.emit_local_change("hello");
    alice.flush_now().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(store.load_document(doc).unwrap().is_some());
    assert!(store.history(doc).unwrap().is_empty());

    // The host drops; the next edit lands in the offline fallback.
    alice.set_host_online(false);
    assert!(alice.is_offline());
    alice.emit_local_change("hello world!");
    assert_eq!(alice.cache().get(doc).unwrap().content, "hello world!");
    assert!(alice.has_unsynced());

    // Reconnect; the unsent state drains through the normal flush path.
    alice.set_host_online(true);
    alice.connect(&url).await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::Connected)) => break,
            Ok(Some(_)) => continue,
            other => panic!("expected Connected, got {other:?}"),
        }
    }
    alice.flush_now().await;
    assert_eq!(alice.status(), SyncStatus::Synchronized);
    assert!(alice.cache().get(doc).is_none());

    // One history entry spans the whole offline gap.
    let mut history = Vec::new();
    for _ in 0..50 {
        history = store.history(doc).unwrap();
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].before.as_deref(), Some("hello"));
    assert_eq!(history[0].after, "hello world!");
    assert_eq!(history[0].added.as_deref(), Some(" world!"));
    assert_eq!(history[0].removed.as_deref(), Some(""));
}

#[tokio::test]
async fn test_rejoin_then_single_leave_clears_membership() {
    let (url, server, _store) = start_test_server().await;
    let room = "doc-rejoin";

    let (handle, mut incoming) = connect_ws(&url).await.unwrap();
    let client_id = ClientId::generate();
    let join = WireMessage::JoinRoom {
        room_id: room.to_string(),
        client_id: client_id.clone(),
        username: "carol".to_string(),
    };
    handle.send(join.encode().unwrap()).await.unwrap();
    handle.send(join.encode().unwrap()).await.unwrap();

    let mut members = 0;
    for _ in 0..50 {
        members = server.broker().members(room).await;
        if members == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(members, 1, "rejoin must not duplicate the member");

    let leave = WireMessage::LeaveRoom {
        room_id: room.to_string(),
        client_id: client_id.clone(),
    };
    handle.send(leave.encode().unwrap()).await.unwrap();
    for _ in 0..50 {
        if server.broker().members(room).await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // One leave after a rejoin fully revokes membership: a further update
    // is refused, not relayed.
    let update = WireMessage::TextUpdate {
        seq: Some(7),
        change: ChangeMessage {
            client_id: client_id.clone(),
            timestamp: unix_millis(),
            document_id: room.to_string(),
            user_id: None,
            user_email: None,
            content: "late edit ".to_string(),
            title: None,
            tags: None,
            persist_snapshot: None,
            cursor: None,
        },
    };
    handle.send(update.encode().unwrap()).await.unwrap();

    loop {
        let frame = timeout(Duration::from_secs(2), incoming.recv())
            .await
            .expect("expected an ack")
            .expect("connection closed");
        match WireMessage::decode(&frame).unwrap() {
            WireMessage::Ack { seq, response } => {
                assert_eq!(seq, 7);
                assert!(!response.is_ok(), "update after leave must be refused");
                break;
            }
            // A rejoin may echo presence frames first.
            _ => continue,
        }
    }
}
