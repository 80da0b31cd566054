//! Peer registry.
//!
//! Maintains the map from peer IDs to what is known about each peer and,
//! when a session is live, the command channel into its connection task.
//! The registry is shared by the accept loop and all outbound dial paths;
//! a mutex serializes inserts and removals. Records are never evicted
//! automatically, only their session handles come and go.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use parley_shared::error::ProtocolError;
use parley_shared::types::{PeerStatus, SessionPhase, UserId};

use crate::network::PeerCommand;

/// What is known about a remote party.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: UserId,
    pub address: SocketAddr,
    /// Identity key learned during the handshake.
    pub public_key: Option<[u8; 32]>,
    pub display_name: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub status: PeerStatus,
}

/// Snapshot of one active session, for collaborators.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer_id: UserId,
    pub display_name: Option<String>,
    pub address: SocketAddr,
    pub phase: SessionPhase,
    pub connected_at: DateTime<Utc>,
}

struct ActiveSession {
    tx: mpsc::Sender<PeerCommand>,
    phase: SessionPhase,
    connected_at: DateTime<Utc>,
}

struct PeerEntry {
    record: PeerRecord,
    session: Option<ActiveSession>,
}

/// Registry of peers and their live sessions.
pub struct PeerRegistry {
    inner: Mutex<HashMap<UserId, PeerEntry>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record (or refresh) what we know about a peer.
    pub fn note_peer(
        &self,
        peer_id: UserId,
        address: SocketAddr,
        public_key: Option<[u8; 32]>,
        display_name: Option<String>,
    ) {
        let mut inner = self.inner.lock().expect("registry lock");
        let entry = inner.entry(peer_id).or_insert_with(|| PeerEntry {
            record: PeerRecord {
                peer_id,
                address,
                public_key: None,
                display_name: None,
                last_seen: Utc::now(),
                status: PeerStatus::Unknown,
            },
            session: None,
        });

        entry.record.address = address;
        entry.record.last_seen = Utc::now();
        if public_key.is_some() {
            entry.record.public_key = public_key;
        }
        if display_name.is_some() {
            entry.record.display_name = display_name;
        }
    }

    /// Attach a session's command channel to a peer.
    ///
    /// Policy for a second handshake while one session is established:
    /// reject with [`ProtocolError::DuplicateSession`] unless the existing
    /// session has been inactive beyond `stale_after`, in which case the
    /// stale session is told to close and the new one takes its place.
    pub fn try_register(
        &self,
        peer_id: UserId,
        tx: mpsc::Sender<PeerCommand>,
        stale_after: Duration,
    ) -> Result<(), ProtocolError> {
        let mut inner = self.inner.lock().expect("registry lock");
        let entry = inner.entry(peer_id).or_insert_with(|| PeerEntry {
            record: PeerRecord {
                peer_id,
                address: SocketAddr::from(([0, 0, 0, 0], 0)),
                public_key: None,
                display_name: None,
                last_seen: Utc::now(),
                status: PeerStatus::Unknown,
            },
            session: None,
        });

        if let Some(existing) = &entry.session {
            let idle = (Utc::now() - entry.record.last_seen)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if existing.phase == SessionPhase::Established && idle < stale_after {
                return Err(ProtocolError::DuplicateSession);
            }
            debug!(peer = %peer_id, idle = ?idle, "Superseding stale session");
            let _ = existing.tx.try_send(PeerCommand::Close);
        }

        entry.session = Some(ActiveSession {
            tx,
            phase: SessionPhase::Established,
            connected_at: Utc::now(),
        });
        entry.record.status = PeerStatus::Online;
        entry.record.last_seen = Utc::now();
        Ok(())
    }

    /// Update the recorded phase of a peer's session.
    pub fn set_phase(&self, peer_id: &UserId, phase: SessionPhase) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(entry) = inner.get_mut(peer_id) {
            if let Some(session) = &mut entry.session {
                session.phase = phase;
            }
        }
    }

    /// Record inbound activity from a peer.
    pub fn touch(&self, peer_id: &UserId) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(entry) = inner.get_mut(peer_id) {
            entry.record.last_seen = Utc::now();
            entry.record.status = PeerStatus::Online;
        }
    }

    /// Detach a peer's session handle; the record survives.
    pub fn remove_session(&self, peer_id: &UserId) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(entry) = inner.get_mut(peer_id) {
            if entry.session.take().is_some() {
                debug!(peer = %peer_id, "Session deregistered");
            }
            entry.record.status = PeerStatus::Offline;
        }
    }

    /// Command channel into a peer's connection task, if a session is live.
    pub fn sender(&self, peer_id: &UserId) -> Option<mpsc::Sender<PeerCommand>> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .get(peer_id)
            .and_then(|entry| entry.session.as_ref())
            .map(|session| session.tx.clone())
    }

    /// The peer's record, if any.
    pub fn record(&self, peer_id: &UserId) -> Option<PeerRecord> {
        let inner = self.inner.lock().expect("registry lock");
        inner.get(peer_id).map(|entry| entry.record.clone())
    }

    /// Overwrite a peer's liveness status (probe outcome).
    pub fn set_status(&self, peer_id: &UserId, status: PeerStatus) {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(entry) = inner.get_mut(peer_id) {
            entry.record.status = status;
            if status == PeerStatus::Online {
                entry.record.last_seen = Utc::now();
            }
        }
    }

    /// Whether the peer has an established session with activity newer
    /// than `stale_after`.
    pub fn is_live(&self, peer_id: &UserId, stale_after: Duration) -> bool {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .get(peer_id)
            .map(|entry| {
                let fresh = (Utc::now() - entry.record.last_seen)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    < stale_after;
                let established = entry
                    .session
                    .as_ref()
                    .is_some_and(|s| s.phase == SessionPhase::Established);
                established && fresh
            })
            .unwrap_or(false)
    }

    /// Snapshot of all active sessions.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .values()
            .filter_map(|entry| {
                entry.session.as_ref().map(|session| SessionInfo {
                    peer_id: entry.record.peer_id,
                    display_name: entry.record.display_name.clone(),
                    address: entry.record.address,
                    phase: session.phase,
                    connected_at: session.connected_at,
                })
            })
            .collect()
    }

    /// Tell every live session to close (cooperative shutdown).
    pub fn close_all(&self) {
        let inner = self.inner.lock().expect("registry lock");
        for entry in inner.values() {
            if let Some(session) = &entry.session {
                let _ = session.tx.try_send(PeerCommand::Close);
            }
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
