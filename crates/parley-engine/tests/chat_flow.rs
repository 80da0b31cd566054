//! Whole-stack test: two engines on loopback, from fresh identities to
//! an encrypted conversation.

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley_engine::Engine;
use parley_net::{NetworkConfig, NetworkEvent};
use parley_shared::protocol::{Message, MessageKind};
use parley_shared::types::UserId;
use parley_store::IdentityStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn engine(name: &str, tmp: &TempDir) -> Engine {
    init_tracing();
    Engine::setup(
        IdentityStore::open_at(tmp.path()),
        name,
        NetworkConfig::loopback(),
    )
    .await
    .expect("engine setup")
}

async fn next_event(rx: &mut mpsc::Receiver<NetworkEvent>) -> NetworkEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

async fn wait_established(rx: &mut mpsc::Receiver<NetworkEvent>) -> UserId {
    loop {
        if let NetworkEvent::SessionEstablished { peer, .. } = next_event(rx).await {
            return peer.user_id;
        }
    }
}

/// Next chat message, skipping locally generated system notes.
async fn next_text(rx: &mut mpsc::Receiver<NetworkEvent>) -> (UserId, Message) {
    loop {
        if let NetworkEvent::MessageReceived { peer_id, message } = next_event(rx).await {
            if message.kind == MessageKind::Text {
                return (peer_id, message);
            }
        }
    }
}

#[tokio::test]
async fn test_two_engines_full_conversation() {
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();

    let mut alice = engine("alice", &tmp_a).await;
    let mut bob = engine("bob", &tmp_b).await;
    let mut alice_events = alice.take_events().unwrap();
    let mut bob_events = bob.take_events().unwrap();

    // Bob dials Alice by her listen address.
    bob.connect_to_peer(&alice.local_addr().to_string())
        .await
        .unwrap();

    let alice_id = wait_established(&mut bob_events).await;
    let bob_id = wait_established(&mut alice_events).await;
    assert_eq!(alice_id, alice.local_id());
    assert_eq!(bob_id, bob.local_id());

    // Both sides see one established session carrying the peer's name.
    let sessions = alice.list_active_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].display_name.as_deref(), Some("bob"));

    // The message arrives decrypted and verbatim.
    bob.send_chat_message(alice_id, "hello").await.unwrap();
    let (peer_id, message) = next_text(&mut alice_events).await;
    assert_eq!(peer_id, bob_id);
    assert_eq!(message.content, "hello");
    assert_eq!(message.from, bob_id);
    assert_eq!(message.to, alice_id);

    // Replies flow over the same session.
    alice.send_chat_message(bob_id, "hi bob").await.unwrap();
    let (_, message) = next_text(&mut bob_events).await;
    assert_eq!(message.content, "hi bob");
}

#[tokio::test]
async fn test_renamed_identity_advertised_to_new_peers() {
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();

    let mut alice = engine("alice", &tmp_a).await;
    let mut bob = engine("bob", &tmp_b).await;
    let mut bob_events = bob.take_events().unwrap();

    // Rename before any session exists; the next handshake must carry it.
    alice.set_display_name("alicia").await.unwrap();

    bob.connect_to_peer(&alice.local_addr().to_string())
        .await
        .unwrap();
    wait_established(&mut bob_events).await;

    let sessions = bob.list_active_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].display_name.as_deref(), Some("alicia"));
}

#[tokio::test]
async fn test_disconnect_ends_session_on_both_engines() {
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();

    let mut alice = engine("alice", &tmp_a).await;
    let mut bob = engine("bob", &tmp_b).await;
    let mut alice_events = alice.take_events().unwrap();
    let mut bob_events = bob.take_events().unwrap();

    bob.connect_to_peer(&alice.local_addr().to_string())
        .await
        .unwrap();
    wait_established(&mut bob_events).await;
    wait_established(&mut alice_events).await;

    bob.disconnect_peer(alice.local_id()).await.unwrap();

    loop {
        if let NetworkEvent::SessionClosed { .. } = next_event(&mut bob_events).await {
            break;
        }
    }
    loop {
        if let NetworkEvent::SessionClosed { .. } = next_event(&mut alice_events).await {
            break;
        }
    }

    assert!(alice.list_active_sessions().await.unwrap().is_empty());
    assert!(bob.list_active_sessions().await.unwrap().is_empty());

    // Sending into the closed session is an error, not a hang.
    assert!(bob
        .send_chat_message(alice.local_id(), "anyone there?")
        .await
        .is_err());
}
