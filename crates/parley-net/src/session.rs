//! Per-peer handshake and transport state machine.
//!
//! A [`Session`] is sans-IO: it consumes decoded frames and produces
//! frames to send plus events to surface, never touching a socket. The
//! connection task owns exactly one session, which serializes all state
//! transitions for that peer.
//!
//! Handshake flow (signed ephemeral Diffie-Hellman with key confirmation):
//!
//! 1. Initiator sends `Hello` with its identity key, an ephemeral X25519
//!    key, and a random transcript nonce, all Ed25519-signed.
//! 2. Responder verifies, answers with `HelloAck` of the same shape, and
//!    derives the session key from the ECDH secret bound to the BLAKE3
//!    hash of both hello payloads.
//! 3. Both sides exchange a `Confirm` frame: the AEAD over an empty
//!    payload at counter 0 with the transcript hash as associated data.
//!    Only a verified peer confirmation enters `Established`.
//!
//! Data counters start at 1; the receive watermark rejects any counter at
//! or below the highest accepted value.

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, trace};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use parley_shared::crypto::{self, SymmetricKey};
use parley_shared::error::ProtocolError;
use parley_shared::identity::Identity;
use parley_shared::protocol::{Frame, HandshakeHello, Message, SealedPayload, transcript_hash};
use parley_shared::types::{Role, SessionPhase, UserId};

/// Why a session ended up in the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Handshake confirmation did not authenticate")]
    HandshakeAuthenticationFailed,

    #[error("Frame failed authentication")]
    AuthenticationFailed,

    #[error("Replayed frame rejected")]
    ReplayDetected,

    #[error("Nonce counter exhausted")]
    NonceExhausted,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation is only legal in `Established`.
    #[error("Session not established")]
    NotEstablished,

    /// Inbound frame at or below the receive watermark. The frame is
    /// rejected but the session survives.
    #[error("Replay detected: nonce {nonce} <= watermark {watermark}")]
    ReplayDetected { nonce: u64, watermark: u64 },

    /// Fatal: the session has transitioned to `Failed`.
    #[error("Session failed: {0}")]
    Failed(FailureKind),
}

/// What was learned about the remote party during the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub identity_key: [u8; 32],
    pub display_name: String,
}

/// Output of feeding a frame (or sending a message) into the session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Write this frame to the peer connection.
    Send(Frame),
    /// Deliver this decrypted message to the application.
    Deliver(Message),
    /// The session moved to a new phase.
    PhaseChanged(SessionPhase),
    /// The peer's identity was verified from its hello.
    PeerIdentified(PeerInfo),
}

/// Key material and counters for one direction pair. Dropped (and the key
/// zeroized) whenever the session leaves a key-bearing state.
struct SessionKeys {
    key: Zeroizing<SymmetricKey>,
    transcript: [u8; 32],
    send_nonce: u64,
    recv_watermark: u64,
}

enum State {
    Idle,
    HandshakeInitiated {
        eph_secret: StaticSecret,
        hello_bytes: Vec<u8>,
    },
    HandshakeResponded {
        keys: SessionKeys,
    },
    Established {
        keys: SessionKeys,
    },
    Closed,
    Failed(FailureKind),
}

impl State {
    fn phase(&self) -> SessionPhase {
        match self {
            State::Idle => SessionPhase::Idle,
            State::HandshakeInitiated { .. } => SessionPhase::HandshakeInitiated,
            State::HandshakeResponded { .. } => SessionPhase::HandshakeResponded,
            State::Established { .. } => SessionPhase::Established,
            State::Closed => SessionPhase::Closed,
            State::Failed(_) => SessionPhase::Failed,
        }
    }
}

/// The live cryptographic and transport state for one peer.
pub struct Session {
    identity: Identity,
    display_name: String,
    role: Role,
    state: State,
    peer: Option<PeerInfo>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity, display_name: String, role: Role) -> Self {
        Self {
            identity,
            display_name,
            role,
            state: State::Idle,
            peer: None,
            created_at: Utc::now(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Start the handshake (initiator side). Returns the `Hello` frame to
    /// send.
    pub fn initiate(&mut self) -> Result<Frame, SessionError> {
        if self.role != Role::Initiator || !matches!(self.state, State::Idle) {
            return Err(self.fail(FailureKind::Protocol(
                "initiate is only legal from idle initiator state".into(),
            )));
        }

        let (eph_secret, eph_public) = crypto::generate_ephemeral();
        let mut transcript_nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut transcript_nonce);

        let hello = HandshakeHello::new_signed(
            &self.identity,
            eph_public.to_bytes(),
            transcript_nonce,
            self.display_name.clone(),
        );
        let hello_bytes = match hello.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(FailureKind::Protocol(format!("hello encode: {e}")))),
        };

        self.state = State::HandshakeInitiated {
            eph_secret,
            hello_bytes,
        };
        debug!(role = ?self.role, "Handshake initiated");
        Ok(Frame::Hello(hello))
    }

    /// Feed one inbound frame through the state machine.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Vec<SessionEvent>, SessionError> {
        match frame {
            Frame::Hello(hello) => self.on_hello(hello),
            Frame::HelloAck(ack) => self.on_hello_ack(ack),
            Frame::Confirm(sealed) => self.on_confirm(sealed),
            Frame::Data(sealed) => self.on_data(sealed),
            Frame::Heartbeat => {
                if matches!(self.state, State::Established { .. }) {
                    trace!("Heartbeat received");
                    Ok(Vec::new())
                } else {
                    Err(self.unexpected(0x05))
                }
            }
        }
    }

    /// Encrypt and frame an application message. Only legal in
    /// `Established`.
    pub fn send_message(&mut self, message: &Message) -> Result<Frame, SessionError> {
        let State::Established { keys } = &mut self.state else {
            return Err(SessionError::NotEstablished);
        };

        if keys.send_nonce == u64::MAX {
            return Err(self.fail(FailureKind::NonceExhausted));
        }

        let plaintext = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(self.fail(FailureKind::Protocol(format!("message encode: {e}"))))
            }
        };

        let counter = keys.send_nonce;
        let ciphertext = match crypto::seal(
            keys.key.as_ref(),
            self.role,
            counter,
            &plaintext,
            &keys.transcript,
        ) {
            Ok(ct) => ct,
            Err(e) => return Err(self.fail(FailureKind::Protocol(format!("seal: {e}")))),
        };
        keys.send_nonce += 1;

        Ok(Frame::Data(SealedPayload {
            counter,
            ciphertext,
        }))
    }

    /// Transition to `Closed` and discard key material. Legal from any
    /// state; terminal states are left as they are.
    pub fn close(&mut self) {
        if !matches!(self.state, State::Closed | State::Failed(_)) {
            self.state = State::Closed;
            debug!("Session closed");
        }
    }

    /// Force the session into `Failed` (e.g. handshake timeout, transport
    /// error). Key material, if any was derived, is discarded.
    pub fn fail(&mut self, kind: FailureKind) -> SessionError {
        debug!(kind = %kind, "Session failed");
        self.state = State::Failed(kind.clone());
        SessionError::Failed(kind)
    }

    // ---- handshake steps --------------------------------------------------

    fn on_hello(&mut self, hello: HandshakeHello) -> Result<Vec<SessionEvent>, SessionError> {
        if self.role != Role::Responder || !matches!(self.state, State::Idle) {
            return Err(self.unexpected(0x01));
        }

        // Validate before retaining any state.
        let peer_id = match hello.verify() {
            Ok(id) => id,
            Err(e) => return Err(self.fail(handshake_failure(e))),
        };
        let hello_bytes = match hello.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(FailureKind::Protocol(format!("hello encode: {e}")))),
        };

        let (eph_secret, eph_public) = crypto::generate_ephemeral();
        let mut transcript_nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut transcript_nonce);

        let ack = HandshakeHello::new_signed(
            &self.identity,
            eph_public.to_bytes(),
            transcript_nonce,
            self.display_name.clone(),
        );
        let ack_bytes = match ack.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(FailureKind::Protocol(format!("ack encode: {e}")))),
        };

        let transcript = transcript_hash(&hello_bytes, &ack_bytes);
        let keys = match self.derive_keys(&eph_secret, &hello.ephemeral_key, transcript) {
            Ok(keys) => keys,
            Err(e) => return Err(e),
        };

        let confirm = match self.make_confirm(&keys) {
            Ok(frame) => frame,
            Err(e) => return Err(e),
        };

        let info = PeerInfo {
            user_id: peer_id,
            identity_key: hello.identity_key,
            display_name: hello.display_name.clone(),
        };
        self.peer = Some(info.clone());
        self.state = State::HandshakeResponded { keys };
        debug!(peer = %peer_id, "Hello verified, key derived");

        Ok(vec![
            SessionEvent::PeerIdentified(info),
            SessionEvent::Send(Frame::HelloAck(ack)),
            SessionEvent::Send(confirm),
            SessionEvent::PhaseChanged(SessionPhase::HandshakeResponded),
        ])
    }

    fn on_hello_ack(&mut self, ack: HandshakeHello) -> Result<Vec<SessionEvent>, SessionError> {
        let State::HandshakeInitiated { .. } = &self.state else {
            return Err(self.unexpected(0x02));
        };

        let peer_id = match ack.verify() {
            Ok(id) => id,
            Err(e) => return Err(self.fail(handshake_failure(e))),
        };
        let ack_bytes = match ack.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(FailureKind::Protocol(format!("ack encode: {e}")))),
        };

        let State::HandshakeInitiated {
            eph_secret,
            hello_bytes,
        } = std::mem::replace(&mut self.state, State::Idle)
        else {
            unreachable!("state checked above");
        };

        let transcript = transcript_hash(&hello_bytes, &ack_bytes);
        let keys = match self.derive_keys(&eph_secret, &ack.ephemeral_key, transcript) {
            Ok(keys) => keys,
            Err(e) => return Err(e),
        };

        let confirm = match self.make_confirm(&keys) {
            Ok(frame) => frame,
            Err(e) => return Err(e),
        };

        let info = PeerInfo {
            user_id: peer_id,
            identity_key: ack.identity_key,
            display_name: ack.display_name.clone(),
        };
        self.peer = Some(info.clone());
        self.state = State::HandshakeResponded { keys };
        debug!(peer = %peer_id, "Hello-ack verified, key derived");

        Ok(vec![
            SessionEvent::PeerIdentified(info),
            SessionEvent::Send(confirm),
            SessionEvent::PhaseChanged(SessionPhase::HandshakeResponded),
        ])
    }

    fn on_confirm(&mut self, sealed: SealedPayload) -> Result<Vec<SessionEvent>, SessionError> {
        let State::HandshakeResponded { keys } = &self.state else {
            return Err(self.unexpected(0x03));
        };

        if sealed.counter != 0 {
            return Err(self.fail(FailureKind::Protocol(
                "confirmation must use nonce counter 0".into(),
            )));
        }

        let plaintext = crypto::open(
            keys.key.as_ref(),
            self.role.peer(),
            0,
            &sealed.ciphertext,
            &keys.transcript,
        );
        match plaintext {
            Ok(p) if p.is_empty() => {}
            Ok(_) => {
                return Err(self.fail(FailureKind::Protocol(
                    "confirmation carried unexpected payload".into(),
                )))
            }
            Err(_) => return Err(self.fail(FailureKind::HandshakeAuthenticationFailed)),
        }

        let State::HandshakeResponded { keys } =
            std::mem::replace(&mut self.state, State::Idle)
        else {
            unreachable!("state checked above");
        };
        self.state = State::Established { keys };
        debug!(peer = ?self.peer.as_ref().map(|p| p.user_id), "Session established");

        Ok(vec![SessionEvent::PhaseChanged(SessionPhase::Established)])
    }

    fn on_data(&mut self, sealed: SealedPayload) -> Result<Vec<SessionEvent>, SessionError> {
        let State::Established { keys } = &mut self.state else {
            return Err(self.unexpected(0x04));
        };

        // Replay protection: the watermark only ever moves forward.
        if sealed.counter <= keys.recv_watermark {
            return Err(SessionError::ReplayDetected {
                nonce: sealed.counter,
                watermark: keys.recv_watermark,
            });
        }

        let plaintext = match crypto::open(
            keys.key.as_ref(),
            self.role.peer(),
            sealed.counter,
            &sealed.ciphertext,
            &keys.transcript,
        ) {
            Ok(p) => p,
            Err(_) => return Err(self.fail(FailureKind::AuthenticationFailed)),
        };
        keys.recv_watermark = sealed.counter;

        let message = match Message::from_bytes(&plaintext) {
            Ok(m) => m,
            Err(e) => {
                return Err(self.fail(FailureKind::Protocol(format!("message decode: {e}"))))
            }
        };

        Ok(vec![SessionEvent::Deliver(message)])
    }

    // ---- helpers ----------------------------------------------------------

    fn derive_keys(
        &mut self,
        eph_secret: &StaticSecret,
        their_ephemeral: &[u8; 32],
        transcript: [u8; 32],
    ) -> Result<SessionKeys, SessionError> {
        let their_public = PublicKey::from(*their_ephemeral);
        let shared = match crypto::derive_shared_secret(eph_secret, &their_public) {
            Ok(shared) => shared,
            Err(_) => return Err(self.fail(FailureKind::HandshakeAuthenticationFailed)),
        };
        let key = crypto::derive_session_key(&shared, &transcript);

        Ok(SessionKeys {
            key: Zeroizing::new(key),
            transcript,
            // Counter 0 is consumed by our confirmation frame.
            send_nonce: 1,
            recv_watermark: 0,
        })
    }

    fn make_confirm(&mut self, keys: &SessionKeys) -> Result<Frame, SessionError> {
        match crypto::seal(keys.key.as_ref(), self.role, 0, b"", &keys.transcript) {
            Ok(ciphertext) => Ok(Frame::Confirm(SealedPayload {
                counter: 0,
                ciphertext,
            })),
            Err(e) => Err(self.fail(FailureKind::Protocol(format!("confirm seal: {e}")))),
        }
    }

    fn unexpected(&mut self, type_byte: u8) -> SessionError {
        let state = match self.state.phase() {
            SessionPhase::Idle => "idle",
            SessionPhase::HandshakeInitiated => "handshake-initiated",
            SessionPhase::HandshakeResponded => "handshake-responded",
            SessionPhase::Established => "established",
            SessionPhase::Closed => "closed",
            SessionPhase::Failed => "failed",
        };
        let err = ProtocolError::UnexpectedFrame {
            got: type_byte,
            state,
        };
        self.fail(FailureKind::Protocol(err.to_string()))
    }

    #[cfg(test)]
    fn session_key_bytes(&self) -> Option<SymmetricKey> {
        match &self.state {
            State::HandshakeResponded { keys } | State::Established { keys } => Some(*keys.key),
            _ => None,
        }
    }
}

fn handshake_failure(e: ProtocolError) -> FailureKind {
    match e {
        ProtocolError::BadSignature => FailureKind::HandshakeAuthenticationFailed,
        other => FailureKind::Protocol(other.to_string()),
    }
}
