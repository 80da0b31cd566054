use serde::{Deserialize, Serialize};

// User identity = BLAKE3 fingerprint of the Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub [u8; 32]);

impl UserId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// What the last liveness observation said about a peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Online,
    Offline,
}

/// Which side of the handshake this endpoint played.
///
/// The role also selects the AEAD nonce direction tag, so the two
/// directions of one session can never produce the same nonce under the
/// shared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// 4-byte tag prefixed to the 8-byte counter when building AEAD nonces.
    pub fn nonce_tag(&self) -> [u8; 4] {
        match self {
            Role::Initiator => *b"pi2r",
            Role::Responder => *b"pr2i",
        }
    }

    pub fn peer(&self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Coarse session lifecycle phase, as reported to collaborators.
///
/// The full state machine (with key material) lives in the session engine;
/// this is the data-free projection used in events and snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    HandshakeInitiated,
    HandshakeResponded,
    Established,
    Closed,
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::HandshakeInitiated => "handshake-initiated",
            SessionPhase::HandshakeResponded => "handshake-responded",
            SessionPhase::Established => "established",
            SessionPhase::Closed => "closed",
            SessionPhase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
