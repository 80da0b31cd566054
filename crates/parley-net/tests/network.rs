//! End-to-end tests over real loopback sockets: two network managers
//! handshake, exchange encrypted messages, and handle failing peers.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley_net::{
    spawn_network, spawn_writer, FailureKind, FrameReader, NetworkConfig, NetworkEvent,
    NetworkHandle, Session, SessionEvent,
};
use parley_shared::identity::Identity;
use parley_shared::protocol::{Message, MessageKind};
use parley_shared::types::{PeerStatus, Role, SessionPhase, UserId};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_node(name: &str) -> (NetworkHandle, mpsc::Receiver<NetworkEvent>) {
    init_tracing();
    spawn_network(
        Identity::generate(),
        name.to_string(),
        NetworkConfig::loopback(),
    )
    .await
    .expect("bind loopback listener")
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
async fn test_two_nodes_exchange_messages() {
    let (alice, mut alice_events) = spawn_node("alice").await;
    let (bob, mut bob_events) = spawn_node("bob").await;

    bob.connect(alice.local_addr()).await.unwrap();

    let alice_id = wait_established(&mut bob_events).await;
    let bob_id = wait_established(&mut alice_events).await;
    assert_eq!(alice_id, alice.local_id());
    assert_eq!(bob_id, bob.local_id());

    // Session setup is announced locally as a system note.
    match next_event(&mut alice_events).await {
        NetworkEvent::MessageReceived { message, .. } => {
            assert_eq!(message.kind, MessageKind::System);
            assert_eq!(message.content, "Connected to bob");
        }
        other => panic!("expected system note, got {other:?}"),
    }

    bob.send_message(alice_id, "hello".to_string()).await.unwrap();

    let (peer_id, message) = next_text(&mut alice_events).await;
    assert_eq!(peer_id, bob_id);
    assert_eq!(message.content, "hello");
    assert_eq!(message.from, bob_id);
    assert_eq!(message.to, alice_id);

    // And back the other way.
    alice.send_message(bob_id, "salut".to_string()).await.unwrap();
    let (_, message) = next_text(&mut bob_events).await;
    assert_eq!(message.content, "salut");
}

#[tokio::test]
async fn test_sessions_listed_after_handshake() {
    let (alice, mut alice_events) = spawn_node("alice").await;
    let (bob, mut bob_events) = spawn_node("bob").await;

    bob.connect(alice.local_addr()).await.unwrap();
    wait_established(&mut bob_events).await;
    wait_established(&mut alice_events).await;

    let sessions = alice.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].peer_id, bob.local_id());
    assert_eq!(sessions[0].phase, SessionPhase::Established);
    assert_eq!(sessions[0].display_name.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_peer() {
    // A listener that accepts and then says nothing.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut config = NetworkConfig::loopback();
    config.handshake_timeout = Duration::from_millis(300);
    let (handle, mut events) =
        spawn_network(Identity::generate(), "impatient".into(), config)
            .await
            .unwrap();

    handle.connect(silent_addr).await.unwrap();

    match next_event(&mut events).await {
        NetworkEvent::SessionFailed { kind, addr, .. } => {
            assert_eq!(kind, FailureKind::HandshakeTimeout);
            assert_eq!(addr, silent_addr);
        }
        other => panic!("expected handshake timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_to_dead_port_reports_failure() {
    // Bind and immediately drop to get a port nobody listens on.
    let addr = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let (handle, mut events) = spawn_node("alice").await;
    handle.connect(addr).await.unwrap();

    match next_event(&mut events).await {
        NetworkEvent::ConnectFailed { addr: failed, .. } => assert_eq!(failed, addr),
        other => panic!("expected connect failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_connect_keeps_one_session() {
    let (alice, mut alice_events) = spawn_node("alice").await;
    let (bob, mut bob_events) = spawn_node("bob").await;

    bob.connect(alice.local_addr()).await.unwrap();
    wait_established(&mut bob_events).await;
    wait_established(&mut alice_events).await;

    // A second dial while the first session is fresh must not displace it;
    // the surplus session is reported as failed, not silently dropped.
    bob.connect(alice.local_addr()).await.unwrap();
    loop {
        if let NetworkEvent::SessionFailed { peer_id, kind, .. } =
            next_event(&mut bob_events).await
        {
            assert_eq!(peer_id, Some(alice.local_id()));
            assert!(matches!(kind, FailureKind::Protocol(_)));
            break;
        }
    }

    assert_eq!(alice.list_sessions().await.unwrap().len(), 1);
    assert_eq!(bob.list_sessions().await.unwrap().len(), 1);

    // The surviving session still carries traffic.
    bob.send_message(alice.local_id(), "still here".into())
        .await
        .unwrap();
    let (_, message) = next_text(&mut alice_events).await;
    assert_eq!(message.content, "still here");
}

#[tokio::test]
async fn test_replayed_frame_reported_but_not_fatal() {
    let (alice, mut alice_events) = spawn_node("alice").await;

    // Drive the peer side by hand so the same data frame can be sent twice.
    let identity = Identity::generate();
    let my_id = identity.user_id();
    let stream = tokio::net::TcpStream::connect(alice.local_addr())
        .await
        .unwrap();
    let (read_half, write_half) = stream.into_split();
    let writer = spawn_writer(write_half, 8);
    let mut reader = FrameReader::new(read_half);

    let mut session = Session::new(identity, "mallory".into(), Role::Initiator);
    writer.send(session.initiate().unwrap()).unwrap();
    while session.phase() != SessionPhase::Established {
        let frame = reader.next_frame().await.unwrap().expect("handshake frame");
        for event in session.on_frame(frame).unwrap() {
            if let SessionEvent::Send(frame) = event {
                writer.send(frame).unwrap();
            }
        }
    }
    let alice_id = session.peer().unwrap().user_id;

    let msg = Message::text(my_id, alice_id, "one".into());
    let frame = session.send_message(&msg).unwrap();
    writer.send(frame.clone()).unwrap();

    let (_, delivered) = next_text(&mut alice_events).await;
    assert_eq!(delivered.content, "one");

    // Resend the exact same frame: rejected and reported, not fatal.
    writer.send(frame).unwrap();
    loop {
        if let NetworkEvent::FrameRejected { peer_id, kind } =
            next_event(&mut alice_events).await
        {
            assert_eq!(peer_id, my_id);
            assert_eq!(kind, FailureKind::ReplayDetected);
            break;
        }
    }

    // The legitimate nonce stream keeps working.
    let msg = Message::text(my_id, alice_id, "two".into());
    writer.send(session.send_message(&msg).unwrap()).unwrap();
    let (_, delivered) = next_text(&mut alice_events).await;
    assert_eq!(delivered.content, "two");

    assert_eq!(alice.list_sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_probe_status() {
    let (alice, mut alice_events) = spawn_node("alice").await;
    let (bob, mut bob_events) = spawn_node("bob").await;

    // Never seen: unknown.
    let status = alice.probe_status(bob.local_id()).await.unwrap();
    assert_eq!(status, PeerStatus::Unknown);

    bob.connect(alice.local_addr()).await.unwrap();
    wait_established(&mut bob_events).await;
    wait_established(&mut alice_events).await;

    let status = alice.probe_status(bob.local_id()).await.unwrap();
    assert_eq!(status, PeerStatus::Online);
}

#[tokio::test]
async fn test_disconnect_closes_both_sides() {
    let (alice, mut alice_events) = spawn_node("alice").await;
    let (bob, mut bob_events) = spawn_node("bob").await;

    bob.connect(alice.local_addr()).await.unwrap();
    wait_established(&mut bob_events).await;
    wait_established(&mut alice_events).await;

    bob.disconnect(alice.local_id()).await.unwrap();

    // Bob closes locally; Alice sees the stream end.
    loop {
        if let NetworkEvent::SessionClosed { peer_id } = next_event(&mut bob_events).await {
            assert_eq!(peer_id, alice.local_id());
            break;
        }
    }
    loop {
        if let NetworkEvent::SessionClosed { peer_id } = next_event(&mut alice_events).await {
            assert_eq!(peer_id, bob.local_id());
            break;
        }
    }

    assert!(alice.list_sessions().await.unwrap().is_empty());
    assert!(bob.list_sessions().await.unwrap().is_empty());
}
