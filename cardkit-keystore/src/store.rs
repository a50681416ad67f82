//! The secure key store and its tiered acquisition chain.
//!
//! # Architecture
//!
//! One P-256 signing key backs the whole identity. Acquisition walks an
//! ordered list of tiers until one succeeds, and the first success is
//! pinned for the rest of the session:
//!
//! 1. Reuse an existing entry under the session tag (non-interactive probe).
//! 2. Hardware-backed (secure element) generation.
//! 3. Software-backed persistent generation under the same tag.
//! 4. Session-scoped, non-persistent generation under an ephemeral tag.
//! 5. A key held only in process memory, never written to the vault.
//!
//! The store therefore never leaves the application without a signing key,
//! and never serves two different keys within one session. Retrieval
//! mirrors generation: pinned handle first, vault lookup without auth, an
//! auth-bearing retry when the platform demands interactive unlock, and a
//! single on-demand generate-and-retry when the item is missing entirely.

use std::sync::{Arc, Mutex};

use rand::RngCore;
use tracing::{debug, warn};

use crate::error::KeyError;
use crate::jwk::PublicKeyJwk;
use crate::vault::{AuthContext, KeyTier, KeyVault, SoftwareKey, VaultError, VaultKey};

#[derive(Clone)]
struct PinnedKey {
    tier: KeyTier,
    key: Arc<dyn VaultKey>,
}

/// Owns the signing key and hides tier fallback behind a uniform interface.
///
/// Construct one instance at the composition root and share it by `Arc`;
/// the session tag derives from a per-instance random session id, so a
/// fresh process (or a fresh instance in tests) never collides with stale
/// vault entries.
pub struct SecureKeyStore {
    vault: Arc<dyn KeyVault>,
    alias: String,
    legacy_aliases: Vec<String>,
    session_id: String,
    pinned: Mutex<Option<PinnedKey>>,
}

impl SecureKeyStore {
    /// Creates a store for `alias` backed by `vault`.
    #[must_use]
    pub fn new(vault: Arc<dyn KeyVault>, alias: impl Into<String>) -> Self {
        let mut suffix = [0_u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut suffix);
        Self {
            vault,
            alias: alias.into(),
            legacy_aliases: Vec::new(),
            session_id: hex::encode(suffix),
            pinned: Mutex::new(None),
        }
    }

    /// Registers aliases from earlier releases whose entries are purged,
    /// best-effort, on first acquisition.
    #[must_use]
    pub fn with_legacy_aliases(mut self, aliases: Vec<String>) -> Self {
        self.legacy_aliases = aliases;
        self
    }

    /// The tag the current session's key lives under.
    #[must_use]
    pub fn session_tag(&self) -> String {
        format!("{}.{}", self.alias, self.session_id)
    }

    fn ephemeral_tag(&self) -> String {
        format!("{}.{}.session", self.alias, self.session_id)
    }

    /// Ensures a signing key exists, walking the fallback chain if needed.
    ///
    /// Idempotent; safe to call repeatedly. Fails only when an existing
    /// entry demands interactive unlock and no auth context can be supplied
    /// through [`Self::signing_handle`].
    ///
    /// # Errors
    /// Returns [`KeyError::Retrieval`] when an existing entry cannot be
    /// read back non-interactively.
    pub fn ensure_key(&self) -> Result<(), KeyError> {
        self.acquire(None).map(|_| ())
    }

    /// Returns a signing handle, acquiring the key first if necessary.
    ///
    /// May block on a platform unlock prompt when `auth` is supplied and
    /// the stored item is protected; callers treat this as a long-latency
    /// operation.
    ///
    /// # Errors
    /// Returns [`KeyError::Retrieval`] when the key exists but cannot be
    /// unlocked with the given context.
    pub fn signing_handle(
        &self,
        auth: Option<&AuthContext>,
    ) -> Result<Arc<dyn VaultKey>, KeyError> {
        self.acquire(auth).map(|pinned| pinned.key)
    }

    /// Returns the public half as a canonical JWK.
    ///
    /// Stable across calls for a given key generation; changes only after
    /// [`Self::reset_key`].
    ///
    /// # Errors
    /// Returns [`KeyError::Retrieval`] if the key cannot be acquired or the
    /// platform cannot export the public point.
    pub fn public_jwk(&self, auth: Option<&AuthContext>) -> Result<PublicKeyJwk, KeyError> {
        let pinned = self.acquire(auth)?;
        let point = pinned.key.public_key().map_err(|e| KeyError::Retrieval(e.to_string()))?;
        PublicKeyJwk::from_sec1(&point)
    }

    /// The tier the session's key landed on, for diagnostics only.
    #[must_use]
    pub fn achieved_tier(&self) -> Option<KeyTier> {
        self.pinned.lock().unwrap().as_ref().map(|p| p.tier)
    }

    /// Removes all key material owned by this store. Best-effort: vault
    /// failures are logged, never raised.
    pub fn delete_key(&self) {
        *self.pinned.lock().unwrap() = None;
        for tag in [self.session_tag(), self.ephemeral_tag()] {
            if let Err(e) = self.vault.delete(&tag) {
                warn!(%tag, error = %e, "failed to delete key entry");
            }
        }
        self.cleanup_legacy();
    }

    /// Discards the current key and generates a fresh one.
    ///
    /// # Errors
    /// Returns an error if the replacement key cannot be acquired.
    pub fn reset_key(&self) -> Result<(), KeyError> {
        self.delete_key();
        self.acquire(None).map(|_| ())
    }

    fn cleanup_legacy(&self) {
        for alias in &self.legacy_aliases {
            if let Err(e) = self.vault.delete(alias) {
                warn!(%alias, error = %e, "failed to purge legacy key entry");
            }
        }
    }

    fn acquire(&self, auth: Option<&AuthContext>) -> Result<PinnedKey, KeyError> {
        let mut pinned = self.pinned.lock().unwrap();
        if let Some(existing) = pinned.as_ref() {
            return Ok(existing.clone());
        }

        self.cleanup_legacy();

        let tag = self.session_tag();
        if self.vault.contains(&tag).unwrap_or(false) {
            match self.load_existing(&tag, auth) {
                Ok(found) => {
                    *pinned = Some(found.clone());
                    return Ok(found);
                }
                Err(LoadFailure::Fatal(e)) => return Err(e),
                Err(LoadFailure::Recoverable(e)) => {
                    warn!(%tag, error = %e, "existing key entry unusable; regenerating");
                }
            }
        }

        let fresh = self.generate_chain(&tag);
        debug!(tier = %fresh.tier, "signing key acquired");
        *pinned = Some(fresh.clone());
        Ok(fresh)
    }

    fn load_existing(&self, tag: &str, auth: Option<&AuthContext>) -> Result<PinnedKey, LoadFailure> {
        match self.vault.load(tag, None) {
            Ok(key) => Ok(PinnedKey { tier: key.tier(), key }),
            Err(VaultError::AuthRequired) => match auth {
                Some(ctx) => match self.vault.load(tag, Some(ctx)) {
                    Ok(key) => Ok(PinnedKey { tier: key.tier(), key }),
                    Err(e) => Err(LoadFailure::Fatal(KeyError::Retrieval(format!(
                        "authenticated load failed: {e}"
                    )))),
                },
                None => Err(LoadFailure::Fatal(KeyError::Retrieval(
                    "signing key requires interactive unlock".to_string(),
                ))),
            },
            Err(VaultError::NotFound) => {
                Err(LoadFailure::Recoverable(VaultError::NotFound.to_string()))
            }
            Err(e) => Err(LoadFailure::Recoverable(e.to_string())),
        }
    }

    fn generate_chain(&self, tag: &str) -> PinnedKey {
        let hardware_cause = match self.vault.generate(tag, KeyTier::Hardware) {
            Ok(key) => return PinnedKey { tier: KeyTier::Hardware, key },
            Err(e) => e.to_string(),
        };

        let software_cause = match self.vault.generate(tag, KeyTier::SoftwarePersistent) {
            Ok(key) => {
                debug!(cause = %hardware_cause, "hardware key unavailable; using software key");
                return PinnedKey { tier: KeyTier::SoftwarePersistent, key };
            }
            Err(e) => e.to_string(),
        };

        let combined = format!("hardware: {hardware_cause}; software: {software_cause}");
        let session_cause = match self.vault.generate(&self.ephemeral_tag(), KeyTier::SoftwareSession) {
            Ok(key) => {
                warn!(causes = %combined, "persistent key tiers failed; using session key");
                return PinnedKey { tier: KeyTier::SoftwareSession, key };
            }
            Err(e) => e.to_string(),
        };

        // Last resort: the process keeps a usable identity even with the
        // platform store fully broken. Never written to the vault.
        warn!(
            causes = %format!("{combined}; session: {session_cause}"),
            "all vault tiers failed; holding signing key in process memory only"
        );
        PinnedKey { tier: KeyTier::InMemory, key: Arc::new(SoftwareKey::generate(KeyTier::InMemory)) }
    }
}

enum LoadFailure {
    /// Propagated to the caller (e.g. auth needed but absent).
    Fatal(KeyError),
    /// The entry is unusable; the generation chain recovers.
    Recoverable(String),
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::memory::MemoryVault;

    fn store_with(vault: &Arc<MemoryVault>) -> SecureKeyStore {
        let dyn_vault: Arc<dyn KeyVault> = Arc::clone(vault) as Arc<dyn KeyVault>;
        SecureKeyStore::new(dyn_vault, "com.cardkit.identity")
    }

    #[test_case(false, false, false, KeyTier::Hardware; "healthy device")]
    #[test_case(true, false, false, KeyTier::SoftwarePersistent; "no secure element")]
    #[test_case(true, true, false, KeyTier::SoftwareSession; "persistent store read-only")]
    #[test_case(true, true, true, KeyTier::InMemory; "vault fully broken")]
    fn test_fallback_chain_pins_expected_tier(
        no_hardware: bool,
        read_only: bool,
        no_session: bool,
        expected: KeyTier,
    ) {
        let vault = Arc::new(MemoryVault::new());
        vault.set_hardware_unavailable(no_hardware);
        vault.set_persistent_read_only(read_only);
        vault.set_session_unavailable(no_session);

        let store = store_with(&vault);
        store.ensure_key().unwrap();
        assert_eq!(store.achieved_tier(), Some(expected));
    }

    #[test]
    fn test_jwk_stable_until_reset() {
        let vault = Arc::new(MemoryVault::new());
        let store = store_with(&vault);
        store.ensure_key().unwrap();

        let first = store.public_jwk(None).unwrap();
        for _ in 0..5 {
            assert_eq!(store.public_jwk(None).unwrap(), first);
        }

        store.reset_key().unwrap();
        assert_ne!(store.public_jwk(None).unwrap(), first);
    }

    #[test]
    fn test_duplicate_item_falls_back_to_software() {
        let vault = Arc::new(MemoryVault::new());
        let store = store_with(&vault);
        // A stale secure-element reference under the session tag: the
        // existence probe sees it, the load reports corruption, hardware
        // generation reports a duplicate, software overwrites it.
        vault.poison(&store.session_tag());

        store.ensure_key().unwrap();
        assert_eq!(store.achieved_tier(), Some(KeyTier::SoftwarePersistent));
    }

    #[test]
    fn test_existing_entry_reused() {
        let vault = Arc::new(MemoryVault::new());
        let store = store_with(&vault);
        let tag = store.session_tag();
        let original = vault.generate(&tag, KeyTier::SoftwarePersistent).unwrap();

        store.ensure_key().unwrap();
        let handle = store.signing_handle(None).unwrap();
        assert_eq!(handle.public_key().unwrap(), original.public_key().unwrap());
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn test_auth_required_without_context_errors_then_succeeds_with_context() {
        let vault = Arc::new(MemoryVault::new());
        let store = store_with(&vault);
        let tag = store.session_tag();
        vault.generate(&tag, KeyTier::SoftwarePersistent).unwrap();
        vault.require_auth(&tag);

        assert!(matches!(store.ensure_key(), Err(KeyError::Retrieval(_))));

        let auth = AuthContext::new("unlock signing key");
        let handle = store.signing_handle(Some(&auth)).unwrap();
        assert_eq!(handle.tier(), KeyTier::SoftwarePersistent);
    }

    #[test]
    fn test_tier_pinned_across_calls() {
        let vault = Arc::new(MemoryVault::new());
        vault.set_hardware_unavailable(true);
        let store = store_with(&vault);

        store.ensure_key().unwrap();
        // Restoring hardware availability must not switch keys mid-session.
        vault.set_hardware_unavailable(false);
        store.ensure_key().unwrap();
        assert_eq!(store.achieved_tier(), Some(KeyTier::SoftwarePersistent));
    }

    #[test]
    fn test_delete_key_purges_legacy_aliases() {
        let vault = Arc::new(MemoryVault::new());
        vault.generate("legacy.identity", KeyTier::SoftwarePersistent).unwrap();
        let store = store_with(&vault).with_legacy_aliases(vec!["legacy.identity".to_string()]);

        store.ensure_key().unwrap();
        assert!(!vault.contains("legacy.identity").unwrap());

        store.delete_key();
        assert!(!vault.contains(&store.session_tag()).unwrap());
    }

    #[test]
    fn test_in_memory_key_signs() {
        let vault = Arc::new(MemoryVault::new());
        vault.set_hardware_unavailable(true);
        vault.set_persistent_read_only(true);
        vault.set_session_unavailable(true);
        let store = store_with(&vault);

        let handle = store.signing_handle(None).unwrap();
        assert_eq!(handle.tier(), KeyTier::InMemory);
        assert!(!handle.sign(b"payload").unwrap().is_empty());
        assert!(vault.is_empty());
    }
}
