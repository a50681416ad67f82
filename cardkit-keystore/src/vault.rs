//! Platform vault traits for signing-key custody.
//!
//! The vault is the boundary between CardKit and the platform's key storage.
//! Real implementations wrap the OS facility:
//!
//! - iOS: Keychain Services, with secure-enclave generation for the
//!   [`KeyTier::Hardware`] tier
//! - Android: Android Keystore with hardware-backed keys
//! - Desktop/server hosts: a software vault such as [`crate::MemoryVault`]
//!
//! # Security Requirements
//!
//! - Hardware-tier private keys MUST be non-exportable; `sign` executes
//!   inside the secure element.
//! - `contains` MUST NOT trigger an interactive unlock prompt.
//! - `load` MUST return [`VaultError::AuthRequired`] instead of blocking
//!   when the item needs interactive unlock and no auth context was given.

use std::fmt;
use std::sync::Arc;

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{DerSignature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use thiserror::Error;

/// The storage tier a signing key was created at.
///
/// Ordered from most to least protected. The tier is diagnostic only;
/// calling code must never branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyTier {
    /// Generated inside the platform secure element; non-exportable.
    Hardware,
    /// Software key persisted in the platform vault under the session tag.
    SoftwarePersistent,
    /// Software key held by the vault for this process launch only.
    SoftwareSession,
    /// Key held in process memory, never written to the vault.
    InMemory,
}

impl KeyTier {
    /// Stable lowercase name for diagnostics and logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::SoftwarePersistent => "software-persistent",
            Self::SoftwareSession => "software-session",
            Self::InMemory => "in-memory",
        }
    }
}

impl fmt::Display for KeyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque capability token authorizing an interactive unlock.
///
/// Constructed at the composition root (where the platform prompt UI lives)
/// and threaded through calls that may need to unlock a protected item.
#[derive(Debug, Clone)]
pub struct AuthContext {
    reason: String,
}

impl AuthContext {
    /// Creates an auth context with a user-facing reason string.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    /// The reason shown to the user by the platform prompt.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Errors reported by platform vault implementations.
#[derive(Debug, Clone, Error)]
pub enum VaultError {
    /// The requested tier is not available on this device.
    #[error("tier_unsupported")]
    Unsupported,

    /// An item already exists under the tag (stale entry from a prior
    /// partial generation).
    #[error("duplicate_item")]
    DuplicateItem,

    /// No item exists under the tag.
    #[error("item_not_found")]
    NotFound,

    /// The item exists but requires an interactive unlock to read.
    #[error("interactive_auth_required")]
    AuthRequired,

    /// The platform denied access to the store.
    #[error("access_denied: {0}")]
    AccessDenied(String),

    /// Any other backend failure.
    #[error("backend: {0}")]
    Backend(String),
}

/// A handle to a signing key held by the vault (or in process memory).
///
/// The private half never crosses this interface.
pub trait VaultKey: Send + Sync {
    /// The tier this key was created at.
    fn tier(&self) -> KeyTier;

    /// The public half as an uncompressed SEC1 point (65 bytes, `0x04` tag).
    ///
    /// # Errors
    /// Returns an error if the platform cannot export the public key.
    fn public_key(&self) -> Result<Vec<u8>, VaultError>;

    /// Signs `message` with the private key.
    ///
    /// The returned bytes are in the platform's native encoding, commonly
    /// ASN.1 DER for ECDSA primitives. Callers canonicalize before use.
    ///
    /// # Errors
    /// Returns an error if the signing primitive fails or access is denied.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, VaultError>;
}

/// Platform key storage.
///
/// All methods are synchronous; `load` with an auth context may block on a
/// user prompt, so callers treat it as a long-latency operation.
pub trait KeyVault: Send + Sync {
    /// Non-interactive existence probe for `tag`.
    ///
    /// # Errors
    /// Returns an error only on backend failure, never for a missing item.
    fn contains(&self, tag: &str) -> Result<bool, VaultError>;

    /// Generates a new key under `tag` at the requested tier.
    ///
    /// # Errors
    /// Returns [`VaultError::Unsupported`] when the tier is unavailable and
    /// [`VaultError::DuplicateItem`] when a stale entry blocks creation.
    fn generate(&self, tag: &str, tier: KeyTier) -> Result<Arc<dyn VaultKey>, VaultError>;

    /// Loads the key stored under `tag`.
    ///
    /// # Errors
    /// Returns [`VaultError::AuthRequired`] when the item needs interactive
    /// unlock and `auth` is `None`.
    fn load(&self, tag: &str, auth: Option<&AuthContext>) -> Result<Arc<dyn VaultKey>, VaultError>;

    /// Removes the key stored under `tag`. Removing a missing tag is not an
    /// error.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    fn delete(&self, tag: &str) -> Result<(), VaultError>;
}

/// A process-memory P-256 signing key.
///
/// Used by software vaults that have no secure element, and directly by
/// [`crate::SecureKeyStore`] as the in-memory last resort. Signatures are
/// emitted DER-encoded, matching what hardware primitives produce, so both
/// paths exercise the same canonicalization downstream.
pub struct SoftwareKey {
    tier: KeyTier,
    signing_key: SigningKey,
}

impl SoftwareKey {
    /// Generates a fresh random key at `tier`.
    #[must_use]
    pub fn generate(tier: KeyTier) -> Self {
        Self { tier, signing_key: SigningKey::random(&mut OsRng) }
    }
}

impl VaultKey for SoftwareKey {
    fn tier(&self) -> KeyTier {
        self.tier
    }

    fn public_key(&self) -> Result<Vec<u8>, VaultError> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        Ok(point.as_bytes().to_vec())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, VaultError> {
        let signature: DerSignature = self.signing_key.sign(message);
        Ok(signature.as_bytes().to_vec())
    }
}

impl fmt::Debug for SoftwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKey").field("tier", &self.tier).finish_non_exhaustive()
    }
}
