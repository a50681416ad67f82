//! Collaborator capabilities injected at the composition root.
//!
//! The coordinator consumes these through narrow traits and never
//! inspects their internals; the ZK engine in particular is an opaque
//! capability: commitments in, proof blobs out. Each trait ships an
//! in-memory reference implementation usable by tests and by hosts
//! without a real backend.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use cardkit_keystore::PublicKeyJwk;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::did::DidDocument;
use crate::error::{Error, Result};

/// A zero-knowledge membership identity, reduced to what this core needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkIdentityBundle {
    /// Public commitment value, hex-encoded with `0x` prefix.
    pub commitment: String,
    /// When the bundle was created or imported.
    pub created_at: DateTime<Utc>,
}

/// Opaque zero-knowledge identity capability.
pub trait ZkIdentityProvider: Send + Sync {
    /// Returns the existing identity bundle, creating one lazily if absent.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] when the backing store fails.
    fn load_or_create(&self) -> Result<ZkIdentityBundle>;

    /// Replaces the identity with one derived from imported key bytes.
    ///
    /// # Errors
    /// Returns [`Error::InvalidData`] for unusable key material.
    fn import(&self, private_key: &[u8]) -> Result<ZkIdentityBundle>;

    /// Generates an opaque membership proof for `context`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when no identity exists yet.
    fn generate_proof(&self, context: &[u8]) -> Result<Vec<u8>>;

    /// Verifies an opaque proof for `context`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when no identity exists yet.
    fn verify_proof(&self, proof: &[u8], context: &[u8]) -> Result<bool>;
}

/// A group in the external roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Group id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Member commitments.
    pub members: Vec<String>,
}

/// Read-only view of the external group roster.
pub trait GroupRoster: Send + Sync {
    /// All known groups with their member commitments.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] when the roster backend fails.
    fn all_groups(&self) -> Result<Vec<Group>>;
}

/// Persistence for the coordinator's cached DID documents and JWKs.
pub trait CacheStore: Send + Sync {
    /// Loads the cached documents, keyed by DID.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on backend failure.
    fn load_documents(&self) -> Result<HashMap<String, DidDocument>>;

    /// Persists the cached documents.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on backend failure.
    fn save_documents(&self, documents: &HashMap<String, DidDocument>) -> Result<()>;

    /// Loads the cached JWKs, keyed by DID.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on backend failure.
    fn load_jwks(&self) -> Result<HashMap<String, PublicKeyJwk>>;

    /// Persists the cached JWKs.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on backend failure.
    fn save_jwks(&self, jwks: &HashMap<String, PublicKeyJwk>) -> Result<()>;
}

/// In-memory ZK identity provider.
///
/// Derives the commitment as `0x` + SHA-256 of the secret; proofs are a
/// digest over commitment and context. Stands in for a real proof engine
/// without leaking any of its shape into the coordinator.
#[derive(Default)]
pub struct MemoryZkProvider {
    identity: Mutex<Option<(Vec<u8>, ZkIdentityBundle)>>,
}

impl MemoryZkProvider {
    /// Creates a provider with no identity yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn commitment_of(secret: &[u8]) -> String {
        format!("0x{}", hex::encode(Sha256::digest(secret)))
    }
}

impl ZkIdentityProvider for MemoryZkProvider {
    fn load_or_create(&self) -> Result<ZkIdentityBundle> {
        let mut guard = self.identity.lock().unwrap();
        if let Some((_, bundle)) = guard.as_ref() {
            return Ok(bundle.clone());
        }
        let mut secret = vec![0_u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let bundle = ZkIdentityBundle {
            commitment: Self::commitment_of(&secret),
            created_at: Utc::now(),
        };
        *guard = Some((secret, bundle.clone()));
        Ok(bundle)
    }

    fn import(&self, private_key: &[u8]) -> Result<ZkIdentityBundle> {
        if private_key.len() != 32 && private_key.len() != 64 {
            return Err(Error::InvalidData(format!(
                "identity key must be 32 or 64 bytes, got {}",
                private_key.len()
            )));
        }
        let bundle = ZkIdentityBundle {
            commitment: Self::commitment_of(private_key),
            created_at: Utc::now(),
        };
        *self.identity.lock().unwrap() = Some((private_key.to_vec(), bundle.clone()));
        Ok(bundle)
    }

    fn generate_proof(&self, context: &[u8]) -> Result<Vec<u8>> {
        let guard = self.identity.lock().unwrap();
        let (_, bundle) = guard
            .as_ref()
            .ok_or_else(|| Error::Configuration("no identity loaded".to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(bundle.commitment.as_bytes());
        hasher.update(context);
        Ok(hasher.finalize().to_vec())
    }

    fn verify_proof(&self, proof: &[u8], context: &[u8]) -> Result<bool> {
        Ok(self.generate_proof(context)? == proof)
    }
}

/// In-memory group roster.
#[derive(Default)]
pub struct MemoryRoster {
    groups: RwLock<Vec<Group>>,
}

impl MemoryRoster {
    /// Creates an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the roster contents.
    pub fn set_groups(&self, groups: Vec<Group>) {
        *self.groups.write().unwrap() = groups;
    }
}

impl GroupRoster for MemoryRoster {
    fn all_groups(&self) -> Result<Vec<Group>> {
        Ok(self.groups.read().unwrap().clone())
    }
}

/// In-memory cache store.
#[derive(Default)]
pub struct MemoryCacheStore {
    documents: RwLock<HashMap<String, DidDocument>>,
    jwks: RwLock<HashMap<String, PublicKeyJwk>>,
}

impl MemoryCacheStore {
    /// Creates an empty cache store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load_documents(&self) -> Result<HashMap<String, DidDocument>> {
        Ok(self.documents.read().unwrap().clone())
    }

    fn save_documents(&self, documents: &HashMap<String, DidDocument>) -> Result<()> {
        *self.documents.write().unwrap() = documents.clone();
        Ok(())
    }

    fn load_jwks(&self) -> Result<HashMap<String, PublicKeyJwk>> {
        Ok(self.jwks.read().unwrap().clone())
    }

    fn save_jwks(&self, jwks: &HashMap<String, PublicKeyJwk>) -> Result<()> {
        *self.jwks.write().unwrap() = jwks.clone();
        Ok(())
    }
}
