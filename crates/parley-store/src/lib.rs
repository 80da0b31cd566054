//! # parley-store
//!
//! Persistence for the local user's cryptographic identity.
//!
//! The store owns a single JSON record under the platform data directory
//! (or an explicit directory for tests). Writes are atomic (temp file plus
//! rename) so a crash never leaves a half-written record, and the key
//! material carries a BLAKE3 checksum that is validated on every load.
//! The private key never leaves this record except inside the returned
//! [`Identity`].

use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use parley_shared::identity::{fingerprint, Identity};

mod error;

pub use error::{Result, StoreError};

const RECORD_FILE: &str = "identity.json";
const CHECKSUM_CONTEXT: &str = "parley-identity-checksum-v1";

/// The on-disk identity record. The private key is stored sealed
/// (base64-encoded raw bytes, file readable only by the owning user).
#[derive(Debug, Serialize, Deserialize)]
struct IdentityRecord {
    user_id: String,
    public_key: String,
    private_key: String,
    display_name: String,
    created_at: DateTime<Utc>,
    checksum: String,
}

/// An identity loaded from the store, together with its profile metadata.
pub struct StoredIdentity {
    pub identity: Identity,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// File-backed store for the local user's identity.
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Open the store under the platform data directory.
    pub fn open_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "parley").ok_or(StoreError::NoDataDir)?;
        Ok(Self::open_at(dirs.data_dir()))
    }

    /// Open the store rooted at an explicit directory.
    pub fn open_at(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    /// Whether an identity record is present on disk.
    pub fn exists(&self) -> bool {
        self.record_path().exists()
    }

    /// Generate and persist a fresh identity.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if a record is present and
    /// `overwrite` is false.
    pub fn create(&self, display_name: &str, overwrite: bool) -> Result<StoredIdentity> {
        if self.exists() && !overwrite {
            return Err(StoreError::AlreadyExists);
        }

        let identity = Identity::generate();
        let created_at = Utc::now();
        let display_name = display_name.trim().to_string();

        self.write_record(&identity, &display_name, created_at)?;

        info!(user = %identity.user_id(), name = %display_name, "Created new identity");

        Ok(StoredIdentity {
            identity,
            display_name,
            created_at,
        })
    }

    /// Load the persisted identity, validating its integrity.
    pub fn load(&self) -> Result<StoredIdentity> {
        let path = self.record_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NoIdentity)
            }
            Err(e) => return Err(e.into()),
        };

        let record: IdentityRecord = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Corrupt(format!("unreadable record: {e}")))?;

        let secret = decode_key32_base64(&record.private_key, "private key")?;
        let public = decode_key32_hex(&record.public_key, "public key")?;

        let expected = checksum(&secret, &public);
        if record.checksum != expected {
            return Err(StoreError::Corrupt("checksum mismatch".into()));
        }

        let identity = Identity::from_secret_bytes(&secret);
        if identity.public_key_bytes() != public {
            return Err(StoreError::Corrupt(
                "public key does not match secret key".into(),
            ));
        }
        if fingerprint(&public).to_hex() != record.user_id {
            return Err(StoreError::Corrupt(
                "user id does not match public key".into(),
            ));
        }

        debug!(user = %identity.user_id(), "Loaded identity");

        Ok(StoredIdentity {
            identity,
            display_name: record.display_name,
            created_at: record.created_at,
        })
    }

    /// Change the persisted display name. Metadata only, no key material
    /// is touched.
    pub fn rotate_display_name(&self, name: &str) -> Result<()> {
        let stored = self.load()?;
        self.write_record(&stored.identity, name.trim(), stored.created_at)?;
        info!(name = %name.trim(), "Display name updated");
        Ok(())
    }

    /// Destroy the persisted identity. Explicit user action only.
    pub fn reset(&self) -> Result<()> {
        match fs::remove_file(self.record_path()) {
            Ok(()) => {
                info!("Identity record removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NoIdentity),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(
        &self,
        identity: &Identity,
        display_name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let export = identity.to_export();
        let record = IdentityRecord {
            user_id: identity.user_id().to_hex(),
            public_key: hex::encode(export.public_key),
            private_key: BASE64.encode(export.secret_key),
            display_name: display_name.to_string(),
            created_at,
            checksum: checksum(&export.secret_key, &export.public_key),
        };

        let json = serde_json::to_vec_pretty(&record)?;

        // Atomic replace: a concurrent reader sees either the old record
        // or the new one, never a partial write.
        let tmp_path = self.dir.join(format!("{RECORD_FILE}.tmp"));
        fs::write(&tmp_path, &json)?;
        restrict_permissions(&tmp_path)?;
        fs::rename(&tmp_path, self.record_path())?;

        Ok(())
    }
}

fn checksum(secret: &[u8; 32], public: &[u8; 32]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(CHECKSUM_CONTEXT);
    hasher.update(secret);
    hasher.update(public);
    hex::encode(hasher.finalize().as_bytes())
}

fn decode_key32_base64(encoded: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{what}: wrong length")))
}

fn decode_key32_hex(encoded: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(encoded).map_err(|e| StoreError::Corrupt(format!("{what}: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{what}: wrong length")))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
