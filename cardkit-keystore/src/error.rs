use thiserror::Error;

use crate::vault::VaultError;

/// Errors surfaced by [`crate::SecureKeyStore`].
///
/// Tier fallback is handled internally; callers only see an error when the
/// store could not produce a usable key or signature at all. Every operation
/// is safe to retry.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key generation failed across fallback tiers. `details` combines the
    /// nested causes (hardware and software) in a human-readable form.
    #[error("key_generation: {details}")]
    Generation {
        /// Combined causes from each attempted tier.
        details: String,
    },

    /// An existing key could not be retrieved from the platform vault.
    #[error("key_retrieval: {0}")]
    Retrieval(String),

    /// The platform signing primitive failed.
    #[error("signing: {0}")]
    Signing(String),

    /// Public key material was malformed (wrong length, bad point encoding).
    #[error("invalid_key_material: {0}")]
    InvalidKeyMaterial(String),
}

impl From<VaultError> for KeyError {
    fn from(err: VaultError) -> Self {
        Self::Retrieval(err.to_string())
    }
}
