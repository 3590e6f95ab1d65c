//! End-to-end tests: a real server, real WebSocket clients.

mod common;

use common::*;
use serde_json::json;
use tandem_collab::protocol::{ConnectedPayload, MessageType, Permission, UserJoinPayload};
use tandem_collab::storage::DocumentStore;
use tandem_collab::ServerConfig;
use tokio::time::{sleep, Duration};

fn insert(position: usize, content: &str) -> serde_json::Value {
    json!({
        "type": "edit",
        "payload": {"operation": "insert", "position": position, "content": content}
    })
}

#[tokio::test]
async fn test_connect_receives_confirmation() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store, None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    let confirmation = alice.next().await;

    assert_eq!(confirmation.kind, MessageType::Connected);
    assert_eq!(confirmation.document_id, doc);
    assert_eq!(confirmation.user_id, ALICE);
    let payload: ConnectedPayload = confirmation.payload_as().unwrap();
    assert_eq!(payload.permission, Permission::Owner);
    assert_eq!(payload.active_users, 1);

    server.wait_for_clients(doc, 1).await;
    assert_eq!(server.server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_join_and_leave_notices() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store, None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;

    let mut bob = server.connect(doc, "bob-token").await;
    let confirmation = bob.next().await;
    assert_eq!(confirmation.kind, MessageType::Connected);
    let payload: ConnectedPayload = confirmation.payload_as().unwrap();
    assert_eq!(payload.permission, Permission::Edit);
    assert_eq!(payload.active_users, 2);

    let join = alice.next().await;
    assert_eq!(join.kind, MessageType::UserJoin);
    let payload: UserJoinPayload = join.payload_as().unwrap();
    assert_eq!(payload.user_id, BOB);
    assert_eq!(payload.permission, Permission::Edit);

    // Bob never hears about his own arrival
    assert!(bob.is_quiet(Duration::from_millis(200)).await);

    bob.close().await;
    let leave = alice.next().await;
    assert_eq!(leave.kind, MessageType::UserLeave);
    assert_eq!(leave.payload["user_id"], BOB);

    server.wait_for_clients(doc, 1).await;
}

#[tokio::test]
async fn test_edits_are_versioned_and_broadcast() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store.clone(), None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;
    let mut bob = server.connect(doc, "bob-token").await;
    bob.next_of(MessageType::Connected).await;
    alice.next_of(MessageType::UserJoin).await;

    alice.send_json(insert(0, "Hello")).await;

    for peer in [&mut alice, &mut bob] {
        let edit = peer.next_of(MessageType::Edit).await;
        assert_eq!(edit.version, 1);
        assert_eq!(edit.user_id, ALICE);
        assert_eq!(edit.document_id, doc);
        assert_eq!(edit.payload["content"], "Hello");
    }

    bob.send_json(insert(5, " World")).await;

    for peer in [&mut alice, &mut bob] {
        let edit = peer.next_of(MessageType::Edit).await;
        assert_eq!(edit.version, 2);
        assert_eq!(edit.user_id, BOB);
    }

    assert_eq!(store.content(doc).await.unwrap(), "Hello World");
    assert_eq!(server.server.coordinator().current_version(doc).await.unwrap(), 2);
}

#[tokio::test]
async fn test_delete_edit_applies_to_snapshot() {
    let (store, doc) = seeded_store().await;
    store.set_content(doc, "Hello World").await.unwrap();
    let server = start_server(test_config(), store.clone(), None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;

    alice
        .send_json(json!({
            "type": "edit",
            "payload": {"operation": "delete", "position": 5, "length": 6}
        }))
        .await;
    let edit = alice.next_of(MessageType::Edit).await;
    assert_eq!(edit.version, 1);

    assert_eq!(store.content(doc).await.unwrap(), "Hello");
}

#[tokio::test]
async fn test_client_supplied_identity_is_ignored() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store, None).await;

    let mut bob = server.connect(doc, "bob-token").await;
    bob.next_of(MessageType::Connected).await;

    bob.send_json(json!({
        "type": "edit",
        "document_id": 999,
        "user_id": ALICE,
        "version": 77,
        "payload": {"operation": "insert", "position": 0, "content": "x"}
    }))
    .await;

    let edit = bob.next_of(MessageType::Edit).await;
    assert_eq!(edit.document_id, doc);
    assert_eq!(edit.user_id, BOB);
    assert_eq!(edit.version, 1);
}

#[tokio::test]
async fn test_cursor_relayed_to_every_client() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store, None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;
    let mut carol = server.connect(doc, "carol-token").await;
    carol.next_of(MessageType::Connected).await;
    alice.next_of(MessageType::UserJoin).await;

    // View-only clients may still share their cursor
    carol
        .send_json(json!({"type": "cursor", "payload": {"line": 3, "column": 14}}))
        .await;

    for peer in [&mut alice, &mut carol] {
        let cursor = peer.next_of(MessageType::Cursor).await;
        assert_eq!(cursor.user_id, CAROL);
        assert_eq!(cursor.payload, json!({"line": 3, "column": 14}));
    }
}

#[tokio::test]
async fn test_view_only_edit_is_dropped() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store.clone(), None).await;

    let mut carol = server.connect(doc, "carol-token").await;
    let confirmation = carol.next_of(MessageType::Connected).await;
    let payload: ConnectedPayload = confirmation.payload_as().unwrap();
    assert_eq!(payload.permission, Permission::View);

    carol.send_json(insert(0, "vandalism")).await;
    assert!(carol.is_quiet(Duration::from_millis(200)).await);

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;
    alice.send_json(insert(0, "fine")).await;

    let edit = carol.next_of(MessageType::Edit).await;
    assert_eq!(edit.user_id, ALICE);
    assert_eq!(edit.version, 1);
    assert_eq!(store.content(doc).await.unwrap(), "fine");
}

#[tokio::test]
async fn test_bad_frames_do_not_close_the_connection() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store.clone(), None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;

    alice.send_text("this is not json").await;
    alice
        .send_json(json!({"type": "replace", "payload": {}}))
        .await;
    alice
        .send_json(json!({
            "type": "edit",
            "payload": {"operation": "uppercase", "position": 0}
        }))
        .await;
    alice.send_json(insert(0, "ok")).await;

    // Only the valid edit was versioned
    let edit = alice.next_of(MessageType::Edit).await;
    assert_eq!(edit.version, 1);
    assert_eq!(edit.payload["content"], "ok");
    assert_eq!(store.content(doc).await.unwrap(), "ok");
    assert_eq!(server.server.hub().client_count(doc).await, 1);
}

#[tokio::test]
async fn test_token_query_parameter() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store, None).await;

    let mut bob = Peer::connect_with_query(&server.url(&doc.to_string()), "bob-token").await;
    let confirmation = bob.next().await;
    assert_eq!(confirmation.kind, MessageType::Connected);
    assert_eq!(confirmation.user_id, BOB);
}

#[tokio::test]
async fn test_rejected_handshakes_never_register() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store, None).await;
    let url = server.url(&doc.to_string());

    assert_eq!(handshake_status(&url, None, None).await, 401);
    assert_eq!(handshake_status(&url, Some("forged"), None).await, 401);
    assert_eq!(handshake_status(&url, Some("mallory-token"), None).await, 403);
    assert_eq!(
        handshake_status(&server.url("not-a-number"), Some("alice-token"), None).await,
        400
    );
    assert_eq!(
        handshake_status(&server.url("424242"), Some("alice-token"), None).await,
        403
    );

    let stats = server.server.stats().await;
    assert_eq!(stats.rejected_handshakes, 5);
    assert_eq!(stats.total_connections, 0);
    assert_eq!(server.server.hub().stats().await.active_clients, 0);
}

#[tokio::test]
async fn test_origin_allow_list() {
    let (store, doc) = seeded_store().await;
    let config = ServerConfig {
        allowed_origins: vec!["https://app.example".to_string()],
        ..test_config()
    };
    let server = start_server(config, store, None).await;
    let url = server.url(&doc.to_string());

    assert_eq!(
        handshake_status(&url, Some("alice-token"), Some("https://evil.example")).await,
        403
    );

    let mut alice = server.connect(doc, "alice-token").await;
    assert_eq!(alice.next().await.kind, MessageType::Connected);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (store, doc) = seeded_store().await;
    let config = ServerConfig {
        max_message_size: 512,
        ..test_config()
    };
    let server = start_server(config, store, None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;
    server.wait_for_clients(doc, 1).await;

    let big = "x".repeat(2048);
    alice
        .send_json(json!({"type": "cursor", "payload": {"note": big}}))
        .await;

    assert!(alice.is_closed_within(Duration::from_secs(2)).await);
    server.wait_for_clients(doc, 0).await;
}

#[tokio::test]
async fn test_silent_client_is_timed_out() {
    let (store, doc) = seeded_store().await;
    let config = ServerConfig {
        ping_interval: Duration::from_secs(30),
        pong_wait: Duration::from_millis(300),
        ..test_config()
    };
    let server = start_server(config, store, None).await;

    let _idle = server.connect(doc, "alice-token").await;
    server.wait_for_clients(doc, 1).await;

    sleep(Duration::from_millis(600)).await;
    server.wait_for_clients(doc, 0).await;
    server.wait_for_connections(0).await;
}

#[tokio::test]
async fn test_heartbeat_keeps_responsive_client_alive() {
    let (store, doc) = seeded_store().await;
    let config = ServerConfig {
        ping_interval: Duration::from_millis(100),
        pong_wait: Duration::from_millis(800),
        ..test_config()
    };
    let server = start_server(config, store, None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;

    // Reading answers the server's pings
    assert!(alice.is_quiet(Duration::from_millis(1500)).await);
    assert_eq!(server.server.hub().client_count(doc).await, 1);
}

#[tokio::test]
async fn test_disconnect_updates_stats() {
    let (store, doc) = seeded_store().await;
    let server = start_server(test_config(), store, None).await;

    let mut alice = server.connect(doc, "alice-token").await;
    alice.next_of(MessageType::Connected).await;
    let mut bob = server.connect(doc, "bob-token").await;
    bob.next_of(MessageType::Connected).await;
    server.wait_for_clients(doc, 2).await;

    alice.close().await;
    bob.close().await;
    server.wait_for_clients(doc, 0).await;
    server.wait_for_connections(0).await;

    let stats = server.server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_documents, 0);
}
