use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{AEAD_NONCE_SIZE, KDF_CONTEXT_SESSION_KEY, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;
use crate::types::Role;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Generate a fresh ephemeral X25519 keypair for one handshake.
pub fn generate_ephemeral() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// X25519 key agreement. Both sides compute the same value given the
/// correct key pairing. The all-zero output (remote key was a low-order
/// point) is rejected.
pub fn derive_shared_secret(
    local_secret: &StaticSecret,
    remote_public: &PublicKey,
) -> Result<[u8; 32], CryptoError> {
    let shared = local_secret.diffie_hellman(remote_public);
    let bytes = *shared.as_bytes();
    if bytes == [0u8; 32] {
        return Err(CryptoError::SharedSecretDegenerate);
    }
    Ok(bytes)
}

// BLAKE3 KDF with domain separation; the transcript hash binds the key
// to this exact handshake, so equal shared secrets across negotiations
// still yield distinct session keys.
pub fn derive_session_key(shared_secret: &[u8; 32], transcript: &[u8; 32]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SESSION_KEY);
    hasher.update(shared_secret);
    hasher.update(transcript);
    let hash = hasher.finalize();
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&hash.as_bytes()[..SYMMETRIC_KEY_SIZE]);
    key
}

/// AEAD nonce: 4-byte direction tag of the *sender* plus the 8-byte
/// big-endian counter carried on the wire. One session key never sees the
/// same nonce from both directions.
pub fn build_nonce(sender: Role, counter: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[..4].copy_from_slice(&sender.nonce_tag());
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Authenticated encryption. Returns `ciphertext || 16-byte tag`.
pub fn seal(
    key: &[u8],
    sender: Role,
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let nonce_bytes = build_nonce(sender, counter);
    let nonce = Nonce::from_slice(&nonce_bytes);

    cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Authenticated decryption. The Poly1305 tag check inside the AEAD is
/// constant-time, so failures carry no information about how much of the
/// tag matched.
pub fn open(
    key: &[u8],
    sender: Role,
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let nonce_bytes = build_nonce(sender, counter);
    let nonce = Nonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_key() -> SymmetricKey {
        let (a_secret, _) = generate_ephemeral();
        let (_, b_public) = generate_ephemeral();
        let shared = derive_shared_secret(&a_secret, &b_public).unwrap();
        derive_session_key(&shared, &[9u8; 32])
    }

    #[test]
    fn test_shared_secret_symmetry() {
        let (a_secret, a_public) = generate_ephemeral();
        let (b_secret, b_public) = generate_ephemeral();

        let ab = derive_shared_secret(&a_secret, &b_public).unwrap();
        let ba = derive_shared_secret(&b_secret, &a_public).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_mismatched_keys_disagree() {
        let (a_secret, _) = generate_ephemeral();
        let (b_secret, b_public) = generate_ephemeral();
        let (_, c_public) = generate_ephemeral();

        let ac = derive_shared_secret(&a_secret, &c_public).unwrap();
        let ba = derive_shared_secret(&b_secret, &b_public).unwrap();
        assert_ne!(ac, ba);
    }

    #[test]
    fn test_degenerate_shared_secret_rejected() {
        let (a_secret, _) = generate_ephemeral();
        let zero_point = PublicKey::from([0u8; 32]);
        assert!(matches!(
            derive_shared_secret(&a_secret, &zero_point),
            Err(CryptoError::SharedSecretDegenerate)
        ));
    }

    #[test]
    fn test_session_key_bound_to_transcript() {
        let shared = [3u8; 32];
        let key1 = derive_session_key(&shared, &[1u8; 32]);
        let key2 = derive_session_key(&shared, &[2u8; 32]);
        let key1_again = derive_session_key(&shared, &[1u8; 32]);

        assert_ne!(key1, key2);
        assert_eq!(key1, key1_again);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = session_key();
        let aad = b"transcript-hash";
        let sealed = seal(&key, Role::Initiator, 1, b"hello", aad).unwrap();

        let opened = open(&key, Role::Initiator, 1, &sealed, aad).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = session_key();
        let mut sealed = seal(&key, Role::Initiator, 1, b"hello", b"ad").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(
            open(&key, Role::Initiator, 1, &sealed, b"ad"),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = session_key();
        let mut sealed = seal(&key, Role::Initiator, 1, b"hello", b"ad").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open(&key, Role::Initiator, 1, &sealed, b"ad").is_err());
    }

    #[test]
    fn test_mismatched_aad_fails() {
        let key = session_key();
        let sealed = seal(&key, Role::Initiator, 1, b"hello", b"ad-one").unwrap();
        assert!(matches!(
            open(&key, Role::Initiator, 1, &sealed, b"ad-two"),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_direction_separation() {
        let key = session_key();
        let sealed = seal(&key, Role::Initiator, 1, b"hello", b"ad").unwrap();
        // Same counter from the other direction is a different nonce.
        assert!(open(&key, Role::Responder, 1, &sealed, b"ad").is_err());
    }

    #[test]
    fn test_wrong_key_length() {
        assert!(matches!(
            seal(&[0u8; 16], Role::Initiator, 0, b"x", b""),
            Err(CryptoError::InvalidKeyLength)
        ));
        assert!(matches!(
            open(&[0u8; 16], Role::Initiator, 0, b"x", b""),
            Err(CryptoError::InvalidKeyLength)
        ));
    }

    #[test]
    fn test_sealed_length_includes_tag() {
        let key = session_key();
        let sealed = seal(&key, Role::Responder, 7, b"abcd", b"").unwrap();
        assert_eq!(sealed.len(), 4 + crate::constants::TAG_SIZE);
    }
}
