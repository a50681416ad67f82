//! Signing-key custody for CardKit.
//!
//! This crate owns the P-256 identity key behind a uniform interface and
//! reconciles platform reality (missing secure elements, corrupted vault
//! entries, duplicate-item races) with the requirement for a stable
//! identity. See [`SecureKeyStore`] for the tiered acquisition chain and
//! [`vault`] for the platform integration traits.

mod error;
mod jwk;
mod memory;
mod store;
pub mod vault;

pub use error::KeyError;
pub use jwk::{PublicKeyJwk, ALG_ES256, CRV_P256, KTY_EC};
pub use memory::MemoryVault;
pub use store::SecureKeyStore;
pub use vault::{AuthContext, KeyTier, KeyVault, SoftwareKey, VaultError, VaultKey};
