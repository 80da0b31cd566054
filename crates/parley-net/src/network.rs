//! Network manager: listener, dialer, and per-connection tasks.
//!
//! One manager task owns the TCP listener and the command channel. Every
//! accepted or dialed connection gets its own task that drives a
//! [`Session`] state machine over a framed stream. Collaborators talk to
//! the manager through a [`NetworkHandle`] and observe it through a
//! stream of [`NetworkEvent`]s.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use parley_shared::identity::Identity;
use parley_shared::protocol::{Frame, Message};
use parley_shared::types::{PeerStatus, Role, SessionPhase, UserId};

use crate::config::NetworkConfig;
use crate::connection::{spawn_writer, FrameReader, FrameWriter};
use crate::registry::{PeerRegistry, SessionInfo};
use crate::session::{FailureKind, PeerInfo, Session, SessionError, SessionEvent};

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No established session with peer {0}")]
    NoSession(UserId),

    #[error("Outbound buffer full for peer {0}")]
    Backpressure(UserId),

    #[error("Network manager is not running")]
    Stopped,
}

/// Requests into the manager task.
#[derive(Debug)]
pub enum NetworkCommand {
    Connect {
        addr: SocketAddr,
    },
    SendMessage {
        peer_id: UserId,
        content: String,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    ProbeStatus {
        peer_id: UserId,
        reply: oneshot::Sender<PeerStatus>,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Disconnect {
        peer_id: UserId,
    },
    /// Change the display name advertised in future handshakes.
    SetDisplayName {
        name: String,
    },
    Shutdown,
}

/// Notifications out of the manager and its connection tasks.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A decrypted message arrived on an established session.
    MessageReceived { peer_id: UserId, message: Message },
    /// A handshake completed and the session was registered.
    SessionEstablished { peer: PeerInfo, addr: SocketAddr },
    /// An established session ended cleanly.
    SessionClosed { peer_id: UserId },
    /// A session ended abnormally. `peer_id` is absent when the failure
    /// happened before the peer identified itself.
    SessionFailed {
        peer_id: Option<UserId>,
        addr: SocketAddr,
        kind: FailureKind,
    },
    /// An inbound frame was rejected (e.g. as a replay) but the session
    /// survives.
    FrameRejected { peer_id: UserId, kind: FailureKind },
    /// An outbound dial never produced a connection.
    ConnectFailed { addr: SocketAddr, reason: String },
}

/// Commands into one connection task, routed via the registry.
#[derive(Debug)]
pub enum PeerCommand {
    SendMessage(Message),
    Close,
}

struct NetContext {
    identity: Identity,
    /// Advertised in handshake hellos; replaceable at runtime via
    /// `SetDisplayName`.
    display_name: RwLock<String>,
    config: NetworkConfig,
    registry: PeerRegistry,
    local_id: UserId,
    event_tx: mpsc::Sender<NetworkEvent>,
}

/// Cloneable handle to a running network manager.
#[derive(Clone)]
pub struct NetworkHandle {
    cmd_tx: mpsc::Sender<NetworkCommand>,
    local_addr: SocketAddr,
    local_id: UserId,
}

impl NetworkHandle {
    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    /// Dial a peer. The outcome arrives as a [`NetworkEvent`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        self.send_command(NetworkCommand::Connect { addr }).await
    }

    /// Encrypt and send a text message to an established peer.
    pub async fn send_message(
        &self,
        peer_id: UserId,
        content: String,
    ) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(NetworkCommand::SendMessage {
            peer_id,
            content,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NetworkError::Stopped)?
    }

    /// Best-effort liveness check for a peer.
    pub async fn probe_status(&self, peer_id: UserId) -> Result<PeerStatus, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(NetworkCommand::ProbeStatus { peer_id, reply })
            .await?;
        rx.await.map_err(|_| NetworkError::Stopped)
    }

    /// Snapshot of all live sessions.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(NetworkCommand::ListSessions { reply })
            .await?;
        rx.await.map_err(|_| NetworkError::Stopped)
    }

    /// Close the session with one peer, if any.
    pub async fn disconnect(&self, peer_id: UserId) -> Result<(), NetworkError> {
        self.send_command(NetworkCommand::Disconnect { peer_id })
            .await
    }

    /// Advertise a new display name in future handshakes. Established
    /// sessions keep the name the peer already learned.
    pub async fn set_display_name(&self, name: String) -> Result<(), NetworkError> {
        self.send_command(NetworkCommand::SetDisplayName { name })
            .await
    }

    /// Stop the manager and close every session.
    pub async fn shutdown(&self) -> Result<(), NetworkError> {
        self.send_command(NetworkCommand::Shutdown).await
    }

    async fn send_command(&self, cmd: NetworkCommand) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| NetworkError::Stopped)
    }
}

/// Bind the listener and start the manager task.
///
/// Returns the handle plus the event stream. Binding happens before this
/// returns, so `local_addr` is final even when the configuration asked
/// for port 0.
pub async fn spawn_network(
    identity: Identity,
    display_name: String,
    config: NetworkConfig,
) -> Result<(NetworkHandle, mpsc::Receiver<NetworkEvent>), NetworkError> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    let local_id = identity.user_id();

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);

    let ctx = Arc::new(NetContext {
        identity,
        display_name: RwLock::new(display_name),
        config,
        registry: PeerRegistry::new(),
        local_id,
        event_tx,
    });

    info!(addr = %local_addr, user = %local_id, "Listening for peers");
    tokio::spawn(manager_loop(listener, cmd_rx, ctx));

    Ok((
        NetworkHandle {
            cmd_tx,
            local_addr,
            local_id,
        },
        event_rx,
    ))
}

async fn manager_loop(
    listener: TcpListener,
    mut cmd_rx: mpsc::Receiver<NetworkCommand>,
    ctx: Arc<NetContext>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Inbound connection");
                    tokio::spawn(run_connection(stream, addr, Role::Responder, ctx.clone()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if handle_command(cmd, &ctx) {
                    break;
                }
            }
        }
    }

    ctx.registry.close_all();
    debug!("Network manager stopped");
}

/// Returns true on shutdown.
fn handle_command(cmd: NetworkCommand, ctx: &Arc<NetContext>) -> bool {
    match cmd {
        NetworkCommand::Connect { addr } => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                debug!(%addr, "Dialing peer");
                match timeout(ctx.config.handshake_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => {
                        run_connection(stream, addr, Role::Initiator, ctx).await;
                    }
                    Ok(Err(e)) => {
                        let _ = ctx
                            .event_tx
                            .send(NetworkEvent::ConnectFailed {
                                addr,
                                reason: e.to_string(),
                            })
                            .await;
                    }
                    Err(_) => {
                        let _ = ctx
                            .event_tx
                            .send(NetworkEvent::ConnectFailed {
                                addr,
                                reason: "connect timed out".into(),
                            })
                            .await;
                    }
                }
            });
        }
        NetworkCommand::SendMessage {
            peer_id,
            content,
            reply,
        } => {
            let result = match ctx.registry.sender(&peer_id) {
                Some(tx) => {
                    let message = Message::text(ctx.local_id, peer_id, content);
                    match tx.try_send(PeerCommand::SendMessage(message)) {
                        Ok(()) => Ok(()),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            Err(NetworkError::Backpressure(peer_id))
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            Err(NetworkError::NoSession(peer_id))
                        }
                    }
                }
                None => Err(NetworkError::NoSession(peer_id)),
            };
            let _ = reply.send(result);
        }
        NetworkCommand::ProbeStatus { peer_id, reply } => {
            if ctx.registry.is_live(&peer_id, ctx.config.stale_after) {
                let _ = reply.send(PeerStatus::Online);
            } else if let Some(record) = ctx.registry.record(&peer_id) {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let status = match timeout(
                        ctx.config.probe_timeout,
                        TcpStream::connect(record.address),
                    )
                    .await
                    {
                        Ok(Ok(_)) => PeerStatus::Online,
                        _ => PeerStatus::Offline,
                    };
                    ctx.registry.set_status(&peer_id, status);
                    let _ = reply.send(status);
                });
            } else {
                let _ = reply.send(PeerStatus::Unknown);
            }
        }
        NetworkCommand::ListSessions { reply } => {
            let _ = reply.send(ctx.registry.snapshot());
        }
        NetworkCommand::Disconnect { peer_id } => {
            if let Some(tx) = ctx.registry.sender(&peer_id) {
                let _ = tx.try_send(PeerCommand::Close);
            }
        }
        NetworkCommand::SetDisplayName { name } => {
            debug!(name = %name, "Display name updated");
            *ctx.display_name.write().expect("name lock") = name;
        }
        NetworkCommand::Shutdown => return true,
    }
    false
}

/// Drive one connection from raw socket to closed session.
async fn run_connection(stream: TcpStream, addr: SocketAddr, role: Role, ctx: Arc<NetContext>) {
    let (read_half, write_half) = stream.into_split();
    let writer = spawn_writer(write_half, ctx.config.write_buffer_frames);
    let mut reader = FrameReader::new(read_half);
    let display_name = ctx.display_name.read().expect("name lock").clone();
    let mut session = Session::new(ctx.identity.clone(), display_name, role);

    let peer = match timeout(
        ctx.config.handshake_timeout,
        run_handshake(&mut session, &mut reader, &writer, addr, &ctx),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err(kind)) => {
            session.fail(kind.clone());
            let _ = ctx
                .event_tx
                .send(NetworkEvent::SessionFailed {
                    peer_id: session.peer().map(|p| p.user_id),
                    addr,
                    kind,
                })
                .await;
            return;
        }
        Err(_) => {
            session.fail(FailureKind::HandshakeTimeout);
            let _ = ctx
                .event_tx
                .send(NetworkEvent::SessionFailed {
                    peer_id: session.peer().map(|p| p.user_id),
                    addr,
                    kind: FailureKind::HandshakeTimeout,
                })
                .await;
            return;
        }
    };

    let (peer_tx, mut peer_rx) = mpsc::channel(ctx.config.write_buffer_frames);
    if let Err(e) = ctx
        .registry
        .try_register(peer.user_id, peer_tx, ctx.config.stale_after)
    {
        debug!(peer = %peer.user_id, error = %e, "Dropping surplus session");
        session.close();
        let _ = ctx
            .event_tx
            .send(NetworkEvent::SessionFailed {
                peer_id: Some(peer.user_id),
                addr,
                kind: FailureKind::Protocol(e.to_string()),
            })
            .await;
        return;
    }

    info!(peer = %peer.user_id, name = %peer.display_name, %addr, "Session established");
    let _ = ctx
        .event_tx
        .send(NetworkEvent::SessionEstablished {
            peer: peer.clone(),
            addr,
        })
        .await;
    // Local note for the UI; never sent over the wire.
    let _ = ctx
        .event_tx
        .send(NetworkEvent::MessageReceived {
            peer_id: peer.user_id,
            message: Message::system(ctx.local_id, format!("Connected to {}", peer.display_name)),
        })
        .await;

    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    // The first tick resolves immediately; consume it.
    heartbeat.tick().await;

    let mut failure: Option<FailureKind> = None;

    'conn: loop {
        tokio::select! {
            frame = reader.next_frame() => match frame {
                Ok(Some(frame)) => {
                    ctx.registry.touch(&peer.user_id);
                    match session.on_frame(frame) {
                        Ok(events) => {
                            for event in events {
                                match event {
                                    SessionEvent::Deliver(message) => {
                                        let _ = ctx.event_tx.send(NetworkEvent::MessageReceived {
                                            peer_id: peer.user_id,
                                            message,
                                        }).await;
                                    }
                                    SessionEvent::Send(frame) => {
                                        if let Err(e) = writer.send(frame) {
                                            failure = Some(FailureKind::Connection(e.to_string()));
                                            break 'conn;
                                        }
                                    }
                                    SessionEvent::PhaseChanged(_)
                                    | SessionEvent::PeerIdentified(_) => {}
                                }
                            }
                        }
                        Err(SessionError::ReplayDetected { nonce, watermark }) => {
                            warn!(
                                peer = %peer.user_id,
                                nonce,
                                watermark,
                                "Replayed frame rejected"
                            );
                            let _ = ctx.event_tx.send(NetworkEvent::FrameRejected {
                                peer_id: peer.user_id,
                                kind: FailureKind::ReplayDetected,
                            }).await;
                        }
                        Err(SessionError::Failed(kind)) => {
                            failure = Some(kind);
                            break 'conn;
                        }
                        Err(e @ SessionError::NotEstablished) => {
                            failure = Some(FailureKind::Protocol(e.to_string()));
                            break 'conn;
                        }
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer.user_id, "Peer closed the connection");
                    session.close();
                    break 'conn;
                }
                Err(e) => {
                    failure = Some(FailureKind::Connection(e.to_string()));
                    break 'conn;
                }
            },
            cmd = peer_rx.recv() => match cmd {
                Some(PeerCommand::SendMessage(message)) => {
                    match session.send_message(&message) {
                        Ok(frame) => {
                            if let Err(e) = writer.send(frame) {
                                failure = Some(FailureKind::Connection(e.to_string()));
                                break 'conn;
                            }
                        }
                        Err(SessionError::Failed(kind)) => {
                            failure = Some(kind);
                            break 'conn;
                        }
                        Err(e) => {
                            warn!(peer = %peer.user_id, error = %e, "Dropping outbound message");
                        }
                    }
                }
                Some(PeerCommand::Close) | None => {
                    session.close();
                    break 'conn;
                }
            },
            _ = heartbeat.tick() => {
                trace!(peer = %peer.user_id, "Heartbeat");
                if let Err(e) = writer.send(Frame::Heartbeat) {
                    failure = Some(FailureKind::Connection(e.to_string()));
                    break 'conn;
                }
            }
        }
    }

    ctx.registry.remove_session(&peer.user_id);
    match failure {
        Some(kind) => {
            session.fail(kind.clone());
            let _ = ctx
                .event_tx
                .send(NetworkEvent::SessionFailed {
                    peer_id: Some(peer.user_id),
                    addr,
                    kind,
                })
                .await;
        }
        None => {
            let _ = ctx
                .event_tx
                .send(NetworkEvent::MessageReceived {
                    peer_id: peer.user_id,
                    message: Message::system(
                        ctx.local_id,
                        format!("Disconnected from {}", peer.display_name),
                    ),
                })
                .await;
            let _ = ctx
                .event_tx
                .send(NetworkEvent::SessionClosed {
                    peer_id: peer.user_id,
                })
                .await;
        }
    }
}

/// Exchange handshake frames until the session is established.
async fn run_handshake(
    session: &mut Session,
    reader: &mut FrameReader,
    writer: &FrameWriter,
    addr: SocketAddr,
    ctx: &NetContext,
) -> Result<PeerInfo, FailureKind> {
    if session.role() == Role::Initiator {
        let hello = session.initiate().map_err(session_failure)?;
        writer
            .send(hello)
            .map_err(|e| FailureKind::Connection(e.to_string()))?;
    }

    while session.phase() != SessionPhase::Established {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(FailureKind::Connection(
                    "peer closed during handshake".into(),
                ))
            }
            Err(e) => return Err(FailureKind::Connection(e.to_string())),
        };

        for event in session.on_frame(frame).map_err(session_failure)? {
            match event {
                SessionEvent::Send(frame) => writer
                    .send(frame)
                    .map_err(|e| FailureKind::Connection(e.to_string()))?,
                SessionEvent::PeerIdentified(info) => {
                    debug!(peer = %info.user_id, name = %info.display_name, "Peer identified");
                    ctx.registry.note_peer(
                        info.user_id,
                        addr,
                        Some(info.identity_key),
                        Some(info.display_name.clone()),
                    );
                }
                SessionEvent::PhaseChanged(phase) => {
                    trace!(?phase, "Handshake progressed");
                }
                SessionEvent::Deliver(_) => {}
            }
        }
    }

    session
        .peer()
        .cloned()
        .ok_or_else(|| FailureKind::Protocol("established without peer identity".into()))
}

fn session_failure(e: SessionError) -> FailureKind {
    match e {
        SessionError::Failed(kind) => kind,
        other => FailureKind::Protocol(other.to_string()),
    }
}
