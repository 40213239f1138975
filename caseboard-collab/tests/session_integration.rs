//! Full-stack session tests: two sessions collaborating through a
//! real relay, end-to-end encrypted.

use std::time::Duration;

use std::sync::{Arc, RwLock};

use caseboard_collab::relay::{RelayConfig, RelayServer};
use caseboard_collab::session::{SessionConfig, SyncSession};
use caseboard_collab::share::ShareLink;
use caseboard_core::{Collection, Element, ReadModel};
use serde_json::json;
use tokio::time::timeout;
use uuid::Uuid;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay() -> String {
    let port = free_port().await;
    let config = RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::default()
    };
    let relay = RelayServer::new(config);
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

fn session_config(relay_url: &str, name: &str) -> SessionConfig {
    SessionConfig {
        relay_url: Some(relay_url.to_string()),
        participant_name: name.to_string(),
        debounce: Duration::from_millis(5),
        heartbeat: Duration::from_millis(500),
        handshake_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

/// Poll until `condition` holds or the deadline passes.
async fn wait_until(condition: impl Fn() -> bool, deadline: Duration) -> bool {
    let result = timeout(deadline, async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    result.is_ok()
}

#[tokio::test]
async fn test_offline_create_then_join_then_concurrent_edits_converge() {
    let url = start_relay().await;

    // Alice works offline first.
    let mut alice = SyncSession::open_local(Uuid::new_v4(), session_config(&url, "Alice"));
    let e1 = alice
        .create_element(Element::new("E1", "person", 0.0, 0.0))
        .unwrap();

    // Then shares; Bob joins through the link.
    let grant = alice.share(false).unwrap();
    let link = ShareLink::parse(&grant.share_url).unwrap();
    let bob = SyncSession::open_from_link(&link, session_config(&url, "Bob")).unwrap();

    // Bob converges on Alice's offline edit.
    let bob_model = bob.read_model();
    assert!(
        wait_until(
            || {
                let model = bob_model.read().unwrap();
                model
                    .elements
                    .get(&e1)
                    .map(|e| e.x == 0.0 && e.label == "E1")
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await,
        "Bob should receive E1 via the sync handshake"
    );

    // Concurrent field-disjoint edits: Alice moves, Bob renames.
    alice.move_element(e1, 10.0, 10.0).unwrap();
    let mut patch = serde_json::Map::new();
    patch.insert("label".into(), json!("Edward One"));
    bob.update_element(e1, patch).unwrap();

    let alice_model = alice.read_model();
    let converged = |model: &Arc<RwLock<ReadModel>>| {
        let model = model.read().unwrap();
        model
            .elements
            .get(&e1)
            .map(|e| e.x == 10.0 && e.y == 10.0 && e.label == "Edward One")
            .unwrap_or(false)
    };
    assert!(
        wait_until(|| converged(&alice_model) && converged(&bob_model), Duration::from_secs(5))
            .await,
        "both edits must survive on both replicas"
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_presence_exchanged_between_sessions() {
    let url = start_relay().await;

    let mut alice = SyncSession::open_local(Uuid::new_v4(), session_config(&url, "Alice"));
    let grant = alice.share(false).unwrap();
    let link = ShareLink::parse(&grant.share_url).unwrap();
    let bob = SyncSession::open_from_link(&link, session_config(&url, "Bob")).unwrap();

    assert!(
        wait_until(
            || alice.presence().iter().any(|r| r.state.name == "Bob"),
            Duration::from_secs(5)
        )
        .await,
        "Alice should see Bob's presence hello"
    );
    assert!(
        wait_until(
            || bob.presence().iter().any(|r| r.state.name == "Alice"),
            Duration::from_secs(5)
        )
        .await,
        "Bob should see Alice (heartbeat republish)"
    );

    // Presence never lands in the replica.
    assert_eq!(alice.replica().len(Collection::Elements), 0);
    assert!(alice.replica().meta_entries().is_empty());

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_remote_edit_lands_in_read_model() {
    let url = start_relay().await;

    let mut alice = SyncSession::open_local(Uuid::new_v4(), session_config(&url, "Alice"));
    let grant = alice.share(false).unwrap();
    let link = ShareLink::parse(&grant.share_url).unwrap();
    let bob = SyncSession::open_from_link(&link, session_config(&url, "Bob")).unwrap();

    // Wait for Bob's handshake to finish before writing.
    let bob_state = bob.sync_state();
    assert!(
        wait_until(|| bob_state.borrow().connected, Duration::from_secs(5)).await,
        "Bob connects"
    );

    let id = alice
        .create_element(Element::new("Dropsite", "location", 7.0, 7.0))
        .unwrap();

    let bob_model = bob.read_model();
    assert!(
        wait_until(
            || bob_model.read().unwrap().elements.contains_key(&id),
            Duration::from_secs(5)
        )
        .await,
        "incremental update reaches Bob's read model"
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_async_share_bootstraps_joiner_with_nobody_online() {
    let url = start_relay().await;

    let mut alice = SyncSession::open_local(Uuid::new_v4(), session_config(&url, "Alice"));
    let e1 = alice
        .create_element(Element::new("Dead drop", "location", -4.0, 9.0))
        .unwrap();
    let grant = alice.share(true).unwrap();
    let link = ShareLink::parse(&grant.share_url).unwrap();
    assert!(link.buffering);

    // Wait until Alice is connected so the snapshot has somewhere to go.
    let alice_state = alice.sync_state();
    assert!(
        wait_until(|| alice_state.borrow().connected, Duration::from_secs(5)).await,
        "Alice connects"
    );

    // Alice leaves; the relay keeps her final sealed snapshot.
    alice.unshare();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Bob joins an empty room and bootstraps from the buffer.
    let bob = SyncSession::open_from_link(&link, session_config(&url, "Bob")).unwrap();
    let bob_model = bob.read_model();
    assert!(
        wait_until(
            || {
                bob_model
                    .read()
                    .unwrap()
                    .elements
                    .get(&e1)
                    .map(|e| e.label == "Dead drop")
                    .unwrap_or(false)
            },
            Duration::from_secs(5)
        )
        .await,
        "Bob bootstraps from the buffered snapshot"
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_reshare_yields_fresh_room() {
    let url = start_relay().await;

    let mut alice = SyncSession::open_local(Uuid::new_v4(), session_config(&url, "Alice"));
    let first = alice.share(false).unwrap();
    let first_room = ShareLink::parse(&first.share_url).unwrap().room_id;

    alice.unshare();
    let second = alice.share(false).unwrap();
    let second_room = ShareLink::parse(&second.share_url).unwrap().room_id;

    assert_ne!(first_room, second_room, "re-sharing mints an unlinkable room");
    assert_ne!(first.secret, second.secret);

    alice.close().await;
}

#[tokio::test]
async fn test_sync_state_transitions() {
    let url = start_relay().await;

    let mut session = SyncSession::open_local(Uuid::new_v4(), session_config(&url, "Solo"));
    assert_eq!(
        session.current_state().mode,
        caseboard_collab::session::SessionMode::Local
    );

    session.share(false).unwrap();
    assert_eq!(
        session.current_state().mode,
        caseboard_collab::session::SessionMode::Shared
    );
    assert!(session.current_state().room_id.is_some());

    let state_rx = session.sync_state();
    assert!(
        wait_until(|| state_rx.borrow().connected, Duration::from_secs(5)).await,
        "session connects to the relay"
    );

    session.unshare();
    let state = session.current_state();
    assert_eq!(state.mode, caseboard_collab::session::SessionMode::Local);
    assert!(!state.connected);
    assert!(state.room_id.is_none());

    session.close().await;
}
