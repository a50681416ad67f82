use cardkit_keystore::KeyError;
use thiserror::Error;

/// Error outputs from the CardKit identity core.
#[derive(Debug, Error)]
pub enum Error {
    /// Key generation, retrieval, or signing failed after all fallback
    /// tiers were exhausted. Recoverable for the process; retry is safe.
    #[error("key_management: {0}")]
    KeyManagement(#[from] KeyError),

    /// Malformed payload, JSON, or JWT structure.
    #[error("invalid_data: {0}")]
    InvalidData(String),

    /// Unknown request state or missing record.
    #[error("not_found: {0}")]
    NotFound(String),

    /// Signature or encoding failure not tied to key access.
    #[error("cryptographic: {0}")]
    Cryptographic(String),

    /// A persistence collaborator failed.
    #[error("storage: {0}")]
    Storage(String),

    /// Unimplemented or unsupported protocol path.
    #[error("configuration: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidData(format!("json: {err}"))
    }
}

/// Result type alias for identity-core operations.
pub type Result<T> = std::result::Result<T, Error>;
