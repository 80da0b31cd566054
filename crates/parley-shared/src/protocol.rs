//! Wire protocol: framing, handshake payloads, and chat messages.
//!
//! Every frame on the wire is `[4-byte big-endian length][type byte][payload]`.
//! Handshake payloads are bincode-encoded structs; sealed payloads
//! (confirmation and data frames) are hand-packed as
//! `[8-byte big-endian nonce][ciphertext][16-byte tag]` so the layout is
//! bit-exact regardless of serializer defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{
    FRAME_HEADER_SIZE, HANDSHAKE_SIG_LABEL, KDF_CONTEXT_TRANSCRIPT, MAX_FRAME_SIZE,
    PROTOCOL_VERSION, SIGNATURE_SIZE, TAG_SIZE, WIRE_NONCE_SIZE,
};
use crate::error::ProtocolError;
use crate::identity::{self, Identity};
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Hello = 0x01,
    HelloAck = 0x02,
    Confirm = 0x03,
    Data = 0x04,
    Heartbeat = 0x05,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x03 => Some(Self::Confirm),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Handshake hello, sent by the initiator (`Hello`) and echoed in shape by
/// the responder (`HelloAck`). Carries the long-term identity key, the
/// per-session ephemeral key, a random transcript nonce, and an Ed25519
/// signature binding them together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeHello {
    pub version: u8,
    /// Long-term Ed25519 verifying key
    pub identity_key: [u8; 32],
    /// Ephemeral X25519 public key for this session
    pub ephemeral_key: [u8; 32],
    /// Random nonce mixed into the handshake transcript
    pub transcript_nonce: [u8; 32],
    /// Sender's display name, for UI labelling only
    pub display_name: String,
    /// Signature over the domain-separated handshake fields
    pub signature: Vec<u8>,
}

impl HandshakeHello {
    /// Build and sign a hello for this side of the handshake.
    pub fn new_signed(
        identity: &Identity,
        ephemeral_key: [u8; 32],
        transcript_nonce: [u8; 32],
        display_name: String,
    ) -> Self {
        let mut hello = Self {
            version: PROTOCOL_VERSION,
            identity_key: identity.public_key_bytes(),
            ephemeral_key,
            transcript_nonce,
            display_name,
            signature: Vec::new(),
        };
        let signature = identity.sign(&hello.signed_data());
        hello.signature = signature.to_bytes().to_vec();
        hello
    }

    /// The exact bytes covered by the signature.
    fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(HANDSHAKE_SIG_LABEL);
        data.push(self.version);
        data.extend_from_slice(&self.identity_key);
        data.extend_from_slice(&self.ephemeral_key);
        data.extend_from_slice(&self.transcript_nonce);
        data.extend_from_slice(self.display_name.as_bytes());
        data
    }

    /// Validate version and signature; returns the sender's user ID.
    pub fn verify(&self) -> Result<UserId, ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        let sig_bytes: [u8; SIGNATURE_SIZE] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::Malformed("bad signature length".into()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

        identity::verify_signature(&self.identity_key, &self.signed_data(), &signature)
            .map_err(|_| ProtocolError::BadSignature)?;

        Ok(identity::fingerprint(&self.identity_key))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// An AEAD-protected payload: the wire nonce counter plus
/// `ciphertext || tag`. Used by both confirmation and data frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

impl SealedPayload {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
    }

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < WIRE_NONCE_SIZE + TAG_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let mut counter_bytes = [0u8; WIRE_NONCE_SIZE];
        counter_bytes.copy_from_slice(&payload[..WIRE_NONCE_SIZE]);
        Ok(Self {
            counter: u64::from_be_bytes(counter_bytes),
            ciphertext: payload[WIRE_NONCE_SIZE..].to_vec(),
        })
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Hello(HandshakeHello),
    HelloAck(HandshakeHello),
    Confirm(SealedPayload),
    Data(SealedPayload),
    Heartbeat,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello(_) => FrameType::Hello,
            Frame::HelloAck(_) => FrameType::HelloAck,
            Frame::Confirm(_) => FrameType::Confirm,
            Frame::Data(_) => FrameType::Data,
            Frame::Heartbeat => FrameType::Heartbeat,
        }
    }

    /// Encode to full wire bytes, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::with_capacity(64);
        body.push(self.frame_type() as u8);

        match self {
            Frame::Hello(hello) | Frame::HelloAck(hello) => {
                let payload = hello
                    .to_bytes()
                    .map_err(|e| ProtocolError::Malformed(format!("hello encode: {e}")))?;
                body.extend_from_slice(&payload);
            }
            Frame::Confirm(sealed) | Frame::Data(sealed) => {
                sealed.encode_into(&mut body);
            }
            Frame::Heartbeat => {}
        }

        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(body.len()));
        }

        let mut wire = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(&body);
        Ok(wire)
    }

    /// Decode a frame body (type byte plus payload, length prefix already
    /// stripped by the reader).
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let (&type_byte, payload) = body.split_first().ok_or(ProtocolError::Truncated)?;
        let frame_type = FrameType::from_byte(type_byte)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown frame type {type_byte:#04x}")))?;

        match frame_type {
            FrameType::Hello => {
                let hello = HandshakeHello::from_bytes(payload)
                    .map_err(|e| ProtocolError::Malformed(format!("hello decode: {e}")))?;
                Ok(Frame::Hello(hello))
            }
            FrameType::HelloAck => {
                let hello = HandshakeHello::from_bytes(payload)
                    .map_err(|e| ProtocolError::Malformed(format!("hello-ack decode: {e}")))?;
                Ok(Frame::HelloAck(hello))
            }
            FrameType::Confirm => Ok(Frame::Confirm(SealedPayload::decode(payload)?)),
            FrameType::Data => Ok(Frame::Data(SealedPayload::decode(payload)?)),
            FrameType::Heartbeat => {
                if !payload.is_empty() {
                    return Err(ProtocolError::Malformed(
                        "heartbeat with payload".into(),
                    ));
                }
                Ok(Frame::Heartbeat)
            }
        }
    }
}

/// Hash of the ordered handshake bytes, bound into key derivation and used
/// as associated data for confirmation frames.
pub fn transcript_hash(hello_bytes: &[u8], hello_ack_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_TRANSCRIPT);
    hasher.update(hello_bytes);
    hasher.update(hello_ack_bytes);
    *hasher.finalize().as_bytes()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    System,
    Ack,
}

/// One application-level chat unit. Travels encrypted inside data frames;
/// never persisted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: uuid::Uuid,
    pub from: UserId,
    pub to: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn text(from: UserId, to: UserId, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            from,
            to,
            kind: MessageKind::Text,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn system(to: UserId, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            from: UserId([0u8; 32]),
            to,
            kind: MessageKind::System,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
