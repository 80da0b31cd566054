/// Wire protocol version carried in every handshake hello
pub const PROTOCOL_VERSION: u8 = 1;

/// Application name
pub const APP_NAME: &str = "Parley";

/// Ed25519 / X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric session key size in bytes (ChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// AEAD nonce size in bytes (4-byte direction tag + 8-byte counter)
pub const AEAD_NONCE_SIZE: usize = 12;

/// Nonce counter size as carried on the wire, in bytes
pub const WIRE_NONCE_SIZE: usize = 8;

/// Random transcript nonce size in each handshake hello, in bytes
pub const TRANSCRIPT_NONCE_SIZE: usize = 32;

/// Length prefix size for frames, in bytes (big-endian u32)
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum frame body size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Default TCP listen port
pub const DEFAULT_LISTEN_PORT: u16 = 5000;

/// Handshake must complete within this window
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Heartbeat interval on established sessions
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;

/// A session with no inbound activity for this long is considered stale
pub const DEFAULT_STALE_AFTER_SECS: u64 = 60;

/// Liveness probe connect timeout
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 3;

/// Outbound write buffer capacity, in frames
pub const WRITE_BUFFER_FRAMES: usize = 64;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SESSION_KEY: &str = "parley-session-key-v1";
pub const KDF_CONTEXT_TRANSCRIPT: &str = "parley-transcript-v1";

/// Domain separation label for handshake signatures
pub const HANDSHAKE_SIG_LABEL: &[u8] = b"parley-handshake-sig-v1";
