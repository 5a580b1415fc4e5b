//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the handshake, fan-out, direct edits and close codes.

use futures_util::{SinkExt, StreamExt};
use scribe_sync::client::document_url;
use scribe_sync::protocol::{close_code, Message, SyncMessage};
use scribe_sync::{
    CrdtDocument, DocumentService, MemoryStore, NewDocument, ServerConfig, SyncClient, SyncEvent, SyncServer,
    TokenGrant,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    let mut tokens = HashMap::new();
    tokens.insert("tok-ann".to_string(), TokenGrant::new("ann", vec!["team".into()]));
    tokens.insert("tok-bob".to_string(), TokenGrant::new("bob", vec!["team".into()]));
    tokens.insert("tok-eve".to_string(), TokenGrant::new("eve", vec!["other".into()]));
    ServerConfig {
        persist_debounce: Duration::from_millis(50),
        auth_tokens: tokens,
        ..ServerConfig::default()
    }
}

/// Start a server on a free port, return the port and its service.
async fn start_test_server() -> (u16, Arc<DocumentService>, Arc<MemoryStore>) {
    start_server_with(test_config()).await
}

async fn start_server_with(config: ServerConfig) -> (u16, Arc<DocumentService>, Arc<MemoryStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(DocumentService::new(store.clone(), config));
    let server = SyncServer::with_static_tokens(service.clone());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, service, store)
}

async fn create_doc(service: &DocumentService, id: &str, content: &str) {
    service
        .create(NewDocument {
            id: Some(id.into()),
            name: format!("{id}.md"),
            content: Some(content.into()),
            scope_id: "team".into(),
        })
        .await
        .unwrap();
}

async fn connect(port: u16, doc_id: &str, token: &str) -> SyncClient {
    let base = format!("ws://127.0.0.1:{port}");
    SyncClient::connect(&document_url(&base, doc_id, token, "team"))
        .await
        .unwrap()
}

/// Poll until `check` holds or the wait runs out.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ─── Sync ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_receives_initial_state() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "# Notes\n").await;

    let client = connect(port, "d1", "tok-ann").await;
    client.wait_synced(WAIT).await.unwrap();
    client.wait_for_text("# Notes\n", WAIT).await.unwrap();
}

#[tokio::test]
async fn test_direct_edit_reaches_early_and_late_clients() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "Hello").await;

    let early = connect(port, "d1", "tok-ann").await;
    early.wait_for_text("Hello", WAIT).await.unwrap();

    let outcome = service.edit("d1", "Hello", "Hi").await.unwrap();
    assert!(outcome.applied);
    early.wait_for_text("Hi", WAIT).await.unwrap();

    let late = connect(port, "d1", "tok-bob").await;
    late.wait_for_text("Hi", WAIT).await.unwrap();
    assert_eq!(service.read("d1").await.unwrap(), "Hi");
}

#[tokio::test]
async fn test_client_edit_reaches_peer_and_service() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "").await;

    let alice = connect(port, "d1", "tok-ann").await;
    let bob = connect(port, "d1", "tok-bob").await;
    alice.wait_synced(WAIT).await.unwrap();
    bob.wait_synced(WAIT).await.unwrap();

    alice.insert(0, "from alice").await.unwrap();
    bob.wait_for_text("from alice", WAIT).await.unwrap();
    let service = &service;
    let persisted = eventually(move || async move {
        service.read("d1").await.unwrap() == "from alice"
    })
    .await;
    assert!(persisted);
}

#[tokio::test]
async fn test_update_not_echoed_to_sender() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "").await;

    let mut alice = connect(port, "d1", "tok-ann").await;
    let mut alice_events = alice.take_event_rx().unwrap();
    let bob = connect(port, "d1", "tok-bob").await;
    alice.wait_synced(WAIT).await.unwrap();
    bob.wait_synced(WAIT).await.unwrap();
    // Handshake traffic (bob's SyncStep2) may still be in flight
    tokio::time::sleep(Duration::from_millis(200)).await;
    while alice_events.try_recv().is_ok() {}

    alice.insert(0, "solo").await.unwrap();
    bob.wait_for_text("solo", WAIT).await.unwrap();
    // Round trip through the server so anything echoed would have arrived
    service.append("d1", "!").await.unwrap();
    alice.wait_for_text("solo!", WAIT).await.unwrap();

    let mut remote_updates = 0;
    while let Ok(event) = alice_events.try_recv() {
        if matches!(event, SyncEvent::RemoteUpdate(_)) {
            remote_updates += 1;
        }
    }
    assert_eq!(remote_updates, 1, "only the direct append reaches alice");
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "").await;

    let alice = connect(port, "d1", "tok-ann").await;
    let bob = connect(port, "d1", "tok-bob").await;
    alice.wait_synced(WAIT).await.unwrap();
    bob.wait_synced(WAIT).await.unwrap();

    let (a, b) = tokio::join!(alice.insert(0, "foo"), bob.insert(0, "bar"));
    a.unwrap();
    b.unwrap();

    let (service, alice, bob) = (&service, &alice, &bob);
    let converged = eventually(move || async move {
        let server = service.read("d1").await.unwrap();
        server.len() == 6 && alice.text().await == server && bob.text().await == server
    })
    .await;
    assert!(converged, "replicas did not converge");

    let text = service.read("d1").await.unwrap();
    assert!(text == "foobar" || text == "barfoo", "unexpected merge: {text}");
}

#[tokio::test]
async fn test_wire_edits_debounced_into_one_write() {
    let config = ServerConfig {
        persist_debounce: Duration::from_millis(300),
        ..test_config()
    };
    let (port, service, store) = start_server_with(config).await;
    create_doc(&service, "d1", "").await;

    let client = connect(port, "d1", "tok-ann").await;
    client.wait_synced(WAIT).await.unwrap();
    let service = &service;
    let idle = move || async move { !service.scheduler().is_pending("d1").await };
    // The handshake's SyncStep2 arms the timer too; let it fire first
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(eventually(idle).await);
    let writes_before = store.write_count();

    client.insert(0, "one ").await.unwrap();
    client.insert(4, "two ").await.unwrap();
    client.insert(8, "three").await.unwrap();
    let merged = eventually(move || async move {
        service.read("d1").await.unwrap() == "one two three"
    })
    .await;
    assert!(merged);

    assert!(eventually(idle).await);
    assert_eq!(store.write_count(), writes_before + 1);
}

#[tokio::test]
async fn test_no_update_before_own_handshake() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "Hello").await;

    let url = document_url(&format!("ws://127.0.0.1:{port}"), "d1", "tok-ann", "team");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let next_binary = |frame: Option<Result<WsMessage, _>>| match frame {
        Some(Ok(WsMessage::Binary(data))) => Message::decode(&data).unwrap(),
        other => panic!("expected a binary frame, got {other:?}"),
    };

    let first = next_binary(timeout(WAIT, ws.next()).await.unwrap());
    assert!(matches!(first, Message::Sync(SyncMessage::SyncStep1(_))));

    // Edit while this peer has not finished its handshake
    service.append("d1", " world").await.unwrap();
    assert!(
        timeout(Duration::from_millis(200), ws.next()).await.is_err(),
        "update delivered before the handshake completed"
    );

    let replica = CrdtDocument::new();
    let step1 = Message::sync_step1(replica.current_state_vector()).encode();
    ws.send(WsMessage::Binary(step1.into())).await.unwrap();

    let Message::Sync(SyncMessage::SyncStep2(diff)) =
        next_binary(timeout(WAIT, ws.next()).await.unwrap())
    else {
        panic!("expected SyncStep2 first");
    };
    replica.apply_remote_update(&diff).unwrap();
    assert_eq!(replica.materialize(), "Hello world");

    let Message::Sync(SyncMessage::Update(delta)) =
        next_binary(timeout(WAIT, ws.next()).await.unwrap())
    else {
        panic!("expected the held Update after the handshake");
    };
    replica.apply_remote_update(&delta).unwrap();
    assert_eq!(replica.materialize(), "Hello world");
}

// ─── Close codes ─────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_token_closed_4001() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "x").await;

    let url = format!("ws://127.0.0.1:{port}/documents/d1?scope=team");
    let client = SyncClient::connect(&url).await.unwrap();
    assert_eq!(
        client.wait_closed(WAIT).await.unwrap(),
        Some(close_code::MISSING_CREDENTIALS)
    );
}

#[tokio::test]
async fn test_bad_token_closed_4003() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "x").await;

    let client = connect(port, "d1", "tok-nobody").await;
    assert_eq!(
        client.wait_closed(WAIT).await.unwrap(),
        Some(close_code::UNAUTHORIZED)
    );

    // Valid token, but not a member of the requested scope
    let outsider = connect(port, "d1", "tok-eve").await;
    assert_eq!(
        outsider.wait_closed(WAIT).await.unwrap(),
        Some(close_code::UNAUTHORIZED)
    );
}

#[tokio::test]
async fn test_document_outside_scope_closed_4003() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "x").await;

    let url = document_url(&format!("ws://127.0.0.1:{port}"), "d1", "tok-eve", "other");
    let client = SyncClient::connect(&url).await.unwrap();
    assert_eq!(
        client.wait_closed(WAIT).await.unwrap(),
        Some(close_code::UNAUTHORIZED)
    );
}

#[tokio::test]
async fn test_unknown_document_closed_4004() {
    let (port, _service, _) = start_test_server().await;
    let client = connect(port, "missing", "tok-ann").await;
    assert_eq!(
        client.wait_closed(WAIT).await.unwrap(),
        Some(close_code::NOT_FOUND)
    );
}

#[tokio::test]
async fn test_delete_closes_connected_clients_4004() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "doomed").await;

    let client = connect(port, "d1", "tok-ann").await;
    client.wait_for_text("doomed", WAIT).await.unwrap();

    let outcome = service.delete("d1").await.unwrap();
    assert!(outcome.success);
    assert_eq!(
        client.wait_closed(WAIT).await.unwrap(),
        Some(close_code::NOT_FOUND)
    );
    assert!(service.read("d1").await.is_err());
}

#[tokio::test]
async fn test_malformed_frame_closed_1002() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "x").await;

    let client = connect(port, "d1", "tok-ann").await;
    client.wait_synced(WAIT).await.unwrap();
    client.send_raw(vec![7, 1, 2]).await.unwrap();
    assert_eq!(
        client.wait_closed(WAIT).await.unwrap(),
        Some(close_code::PROTOCOL_ERROR)
    );

    // The document is unaffected and other clients still work
    let other = connect(port, "d1", "tok-bob").await;
    other.wait_for_text("x", WAIT).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_sessions_going_away() {
    let (port, service, _) = start_test_server().await;
    create_doc(&service, "d1", "x").await;

    let client = connect(port, "d1", "tok-ann").await;
    client.wait_synced(WAIT).await.unwrap();
    service.shutdown().await.unwrap();
    assert_eq!(client.wait_closed(WAIT).await.unwrap(), Some(1001));
}

// ─── Events ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_endpoint_streams_scope_lifecycle() {
    let (port, service, _) = start_test_server().await;

    let url = format!("ws://127.0.0.1:{port}/events?token=tok-ann&scope=team");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    // Let the server subscribe before anything happens
    tokio::time::sleep(Duration::from_millis(100)).await;

    service
        .create(NewDocument {
            id: Some("elsewhere".into()),
            name: "Elsewhere".into(),
            content: None,
            scope_id: "other".into(),
        })
        .await
        .unwrap();
    create_doc(&service, "d1", "").await;
    service.delete("d1").await.unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let WsMessage::Text(text) = frame {
            let json: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            received.push(json);
        }
    }

    assert_eq!(received[0]["type"], "created");
    assert_eq!(received[0]["id"], "d1");
    assert_eq!(received[0]["name"], "d1.md");
    assert_eq!(received[1]["type"], "deleted");
    assert_eq!(received[1]["id"], "d1");
}

#[tokio::test]
async fn test_unknown_path_closed_4004() {
    let (port, _service, _) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/nowhere?token=tok-ann&scope=team");
    let client = SyncClient::connect(&url).await.unwrap();
    assert_eq!(
        client.wait_closed(WAIT).await.unwrap(),
        Some(close_code::NOT_FOUND)
    );
}
