use thiserror::Error;

/// Errors produced by the identity store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An identity is already persisted and overwrite was not requested.
    #[error("An identity already exists; pass overwrite to replace it")]
    AlreadyExists,

    /// No identity has been persisted yet.
    #[error("No identity found; run setup first")]
    NoIdentity,

    /// The persisted material failed integrity validation.
    #[error("Corrupt identity record: {0}")]
    Corrupt(String),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the store directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
