//! Integration tests for end-to-end session coordination.
//!
//! These tests start a real server and connect real clients, verifying
//! join/roster flow, presence fan-out, and lock arbitration.

use audit_collab::client::{ConnectionState, SessionClient, SessionEvent};
use audit_collab::lock::LockRequest;
use audit_collab::protocol::{ResourceKey, ResourceType, SessionMessage, MessageType, UserInfo};
use audit_collab::server::{ServerConfig, SessionServer};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
///
/// The sweep runs every second so lease-expiry tests finish quickly.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_users_per_session: 10,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
        lease_sweep_interval_secs: 1,
    };
    let server = SessionServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Skip unrelated events until one matches, or time out.
async fn next_matching<F>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    pred: F,
) -> Option<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool,
{
    loop {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(ev)) if pred(&ev) => return Some(ev),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

async fn connected_client(
    name: &str,
    audit_id: Uuid,
    url: &str,
) -> (SessionClient, mpsc::Receiver<SessionEvent>) {
    let mut client = SessionClient::new(UserInfo::new(name), audit_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    // Connected, then the roster snapshot from the server
    next_matching(&mut events, |e| matches!(e, SessionEvent::Connected))
        .await
        .unwrap();
    next_matching(&mut events, |e| matches!(e, SessionEvent::RosterReplaced(_)))
        .await
        .unwrap();
    (client, events)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_and_receives_roster() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SessionClient::new(UserInfo::new("Alice"), Uuid::new_v4(), &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::Connected)).await;
    assert!(event.is_some(), "Should receive Connected event");

    let roster = next_matching(&mut events, |e| matches!(e, SessionEvent::RosterReplaced(_))).await;
    match roster {
        Some(SessionEvent::RosterReplaced(users)) => {
            assert_eq!(users.len(), 1, "Roster should contain the joiner");
            assert_eq!(users[0].user_name, "Alice");
        }
        other => panic!("Expected RosterReplaced, got {other:?}"),
    }

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_second_joiner_announced_to_first() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let audit_id = Uuid::new_v4();

    let (_alice, mut alice_events) = connected_client("Alice", audit_id, &url).await;
    let (_bob, _bob_events) = connected_client("Bob", audit_id, &url).await;

    let event = next_matching(&mut alice_events, |e| {
        matches!(e, SessionEvent::PresenceChanged(p) if p.user_name == "Bob")
    })
    .await;
    assert!(event.is_some(), "Alice should see Bob's presence");
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (_alice, mut alice_events) = connected_client("Alice", Uuid::new_v4(), &url).await;
    let (_bob, _bob_events) = connected_client("Bob", Uuid::new_v4(), &url).await;

    // Bob joined a different audit; Alice must hear nothing
    let event = timeout(Duration::from_millis(300), alice_events.recv()).await;
    assert!(event.is_err(), "Alice should not see joins to other sessions");
}

#[tokio::test]
async fn test_lock_granted_then_denied_to_second_requester() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let audit_id = Uuid::new_v4();
    let resource = ResourceKey::new(Uuid::new_v4(), ResourceType::Finding);

    let (alice, mut alice_events) = connected_client("Alice", audit_id, &url).await;
    let (bob, mut bob_events) = connected_client("Bob", audit_id, &url).await;

    alice.request_lock(resource, LockRequest::minutes(10)).await.unwrap();

    let grant = next_matching(&mut alice_events, |e| matches!(e, SessionEvent::LockGranted(_))).await;
    match grant {
        Some(SessionEvent::LockGranted(lease)) => {
            assert_eq!(lease.user_id, alice.user().user_id);
            assert_eq!(lease.resource, resource);
        }
        other => panic!("Expected LockGranted, got {other:?}"),
    }
    assert!(alice.has_valid_lock().await);

    // Bob sees the grant too, and his own request is denied
    next_matching(&mut bob_events, |e| matches!(e, SessionEvent::LockGranted(_)))
        .await
        .unwrap();

    bob.request_lock(resource, LockRequest::minutes(10)).await.unwrap();
    let deny = next_matching(&mut bob_events, |e| matches!(e, SessionEvent::LockDenied { .. })).await;
    match deny {
        Some(SessionEvent::LockDenied { denied, .. }) => {
            assert_eq!(denied.held_by.user_name, "Alice");
        }
        other => panic!("Expected LockDenied, got {other:?}"),
    }
    assert!(!bob.has_valid_lock().await);
    assert!(bob.is_locked_by_others().await);
}

#[tokio::test]
async fn test_release_lets_next_requester_in() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let audit_id = Uuid::new_v4();
    let resource = ResourceKey::new(Uuid::new_v4(), ResourceType::Area);

    let (alice, mut alice_events) = connected_client("Alice", audit_id, &url).await;
    let (bob, mut bob_events) = connected_client("Bob", audit_id, &url).await;

    alice.request_lock(resource, LockRequest::minutes(10)).await.unwrap();
    next_matching(&mut alice_events, |e| matches!(e, SessionEvent::LockGranted(_)))
        .await
        .unwrap();
    next_matching(&mut bob_events, |e| matches!(e, SessionEvent::LockGranted(_)))
        .await
        .unwrap();

    alice.release_lock().await.unwrap();
    next_matching(&mut bob_events, |e| matches!(e, SessionEvent::LockReleased { .. }))
        .await
        .unwrap();

    bob.request_lock(resource, LockRequest::minutes(10)).await.unwrap();
    let grant = next_matching(&mut bob_events, |e| {
        matches!(e, SessionEvent::LockGranted(l) if l.user_id == bob.user().user_id)
    })
    .await;
    assert!(grant.is_some(), "Bob should get the lock after Alice releases");
    assert!(bob.has_valid_lock().await);
}

#[tokio::test]
async fn test_force_unlock_revokes_holder() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let audit_id = Uuid::new_v4();
    let resource = ResourceKey::new(Uuid::new_v4(), ResourceType::DataPoint);

    let (alice, mut alice_events) = connected_client("Alice", audit_id, &url).await;
    let (bob, mut bob_events) = connected_client("Bob", audit_id, &url).await;

    alice.request_lock(resource, LockRequest::minutes(10)).await.unwrap();
    next_matching(&mut alice_events, |e| matches!(e, SessionEvent::LockGranted(_)))
        .await
        .unwrap();
    next_matching(&mut bob_events, |e| matches!(e, SessionEvent::LockGranted(_)))
        .await
        .unwrap();

    bob.force_unlock(resource).await.unwrap();

    let revoked = next_matching(&mut alice_events, |e| matches!(e, SessionEvent::LockRevoked { .. })).await;
    match revoked {
        Some(SessionEvent::LockRevoked { revoked, .. }) => {
            assert!(revoked.forced);
            assert_eq!(revoked.by, Some(bob.user().user_id));
        }
        other => panic!("Expected LockRevoked, got {other:?}"),
    }
    assert!(!alice.has_valid_lock().await);
}

#[tokio::test]
async fn test_expired_lease_is_swept_and_revoked() {
    use audit_collab::lock::LockRevoked;
    use audit_collab::protocol::MessageType;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let port = start_test_server().await;
    let audit_id = Uuid::new_v4();
    let resource = ResourceKey::new(Uuid::new_v4(), ResourceType::Comment);

    // Raw connection: SessionClient would refresh the lease and keep it alive
    let url = format!("ws://127.0.0.1:{port}/{audit_id}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let user = UserInfo::new("Alice");
    let join = SessionMessage::with_payload(
        MessageType::Join,
        user.user_id,
        ResourceKey::audit(audit_id),
        &user,
    )
    .unwrap();
    tx.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();

    let request = SessionMessage::with_payload(
        MessageType::LockRequest,
        user.user_id,
        resource,
        &LockRequest { duration_ms: 200 },
    )
    .unwrap();
    tx.send(Message::Binary(request.encode().unwrap().into())).await.unwrap();

    // The 1s test sweep should revoke the lapsed lease without a force flag
    let revoked = timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = rx.next().await {
            if let Message::Binary(data) = msg {
                let frame = SessionMessage::decode(&data).unwrap();
                if frame.msg_type == MessageType::LockRevoke {
                    return frame.decode_payload::<LockRevoked>().unwrap();
                }
            }
        }
        panic!("connection closed before revocation");
    })
    .await
    .expect("sweep should revoke the expired lease");

    assert!(!revoked.forced);
    assert_eq!(revoked.by, None);
}

#[tokio::test]
async fn test_leave_announced_on_disconnect() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let audit_id = Uuid::new_v4();

    let (_alice, mut alice_events) = connected_client("Alice", audit_id, &url).await;
    let (bob, _bob_events) = connected_client("Bob", audit_id, &url).await;
    let bob_id = bob.user().user_id;

    next_matching(&mut alice_events, |e| {
        matches!(e, SessionEvent::PresenceChanged(p) if p.user_id == bob_id)
    })
    .await
    .unwrap();

    drop(bob);
    drop(_bob_events);

    let event = next_matching(&mut alice_events, |e| {
        matches!(e, SessionEvent::UserLeft(id) if *id == bob_id)
    })
    .await;
    assert!(event.is_some(), "Alice should see Bob leave");
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (client, _events) = connected_client("PingUser", Uuid::new_v4(), &url).await;
    client.send_ping().await.unwrap();
}

#[tokio::test]
async fn test_protocol_message_size() {
    // Verify wire format efficiency
    let user = Uuid::new_v4();
    let resource = ResourceKey::audit(Uuid::new_v4());

    let bare = SessionMessage::new(MessageType::Ping, user, resource);
    let bare_bytes = bare.encode().unwrap();
    assert!(
        bare_bytes.len() < 50,
        "Bare message should be <50 bytes, got {}",
        bare_bytes.len()
    );

    let request = SessionMessage::with_payload(
        MessageType::LockRequest,
        user,
        resource,
        &LockRequest::minutes(10),
    )
    .unwrap();
    let request_bytes = request.encode().unwrap();
    assert!(
        request_bytes.len() < 100,
        "Lock request should be <100 bytes, got {}",
        request_bytes.len()
    );
}
