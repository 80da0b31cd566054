use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication failed: tag or associated data did not verify")]
    AuthenticationFailed,

    #[error("Nonce counter exhausted; session key must be rotated")]
    NonceExhausted,

    #[error("Key agreement produced a degenerate shared secret")]
    SharedSecretDegenerate,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Signature verification failed")]
    InvalidSignature,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unexpected frame type {got:#04x} in state {state}")]
    UnexpectedFrame { got: u8, state: &'static str },

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Frame truncated")]
    Truncated,

    #[error("Handshake signature did not verify")]
    BadSignature,

    #[error("Handshake rejected: an established session with this peer already exists")]
    DuplicateSession,
}
