//! In-memory vault implementation.
//!
//! Serves two purposes: the default vault on hosts without a platform key
//! store, and a scriptable double for exercising every edge of the
//! key-acquisition fallback chain in tests: hardware unavailability,
//! stale duplicate entries, unwritable persistent storage, and items that
//! demand interactive unlock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::vault::{AuthContext, KeyTier, KeyVault, SoftwareKey, VaultError, VaultKey};

/// Scriptable software vault backed by a `HashMap`.
///
/// By default it behaves like a device with a working secure element. The
/// `set_*`/`poison`/`require_auth` knobs inject the failure modes a real
/// platform store exhibits.
pub struct MemoryVault {
    entries: RwLock<HashMap<String, Arc<SoftwareKey>>>,
    behavior: Mutex<Behavior>,
}

#[derive(Default)]
struct Behavior {
    hardware_unavailable: bool,
    persistent_read_only: bool,
    session_unavailable: bool,
    poisoned: HashSet<String>,
    auth_required: HashSet<String>,
}

impl MemoryVault {
    /// Creates a vault simulating a healthy device.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()), behavior: Mutex::new(Behavior::default()) }
    }

    /// Simulates a device without a secure element (simulator, old hardware).
    pub fn set_hardware_unavailable(&self, unavailable: bool) {
        self.behavior.lock().unwrap().hardware_unavailable = unavailable;
    }

    /// Simulates a persistent store that rejects writes.
    pub fn set_persistent_read_only(&self, read_only: bool) {
        self.behavior.lock().unwrap().persistent_read_only = read_only;
    }

    /// Simulates a store too broken even for session-scoped entries.
    pub fn set_session_unavailable(&self, unavailable: bool) {
        self.behavior.lock().unwrap().session_unavailable = unavailable;
    }

    /// Plants a stale secure-element reference under `tag`, so hardware
    /// generation reports a duplicate item and loads report corruption.
    pub fn poison(&self, tag: &str) {
        self.behavior.lock().unwrap().poisoned.insert(tag.to_string());
    }

    /// Marks `tag` as requiring interactive unlock on load.
    pub fn require_auth(&self, tag: &str) {
        self.behavior.lock().unwrap().auth_required.insert(tag.to_string());
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the vault holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for MemoryVault {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyVault for MemoryVault {
    fn contains(&self, tag: &str) -> Result<bool, VaultError> {
        let poisoned = self.behavior.lock().unwrap().poisoned.contains(tag);
        Ok(poisoned || self.entries.read().unwrap().contains_key(tag))
    }

    fn generate(&self, tag: &str, tier: KeyTier) -> Result<Arc<dyn VaultKey>, VaultError> {
        let mut behavior = self.behavior.lock().unwrap();
        match tier {
            KeyTier::Hardware => {
                if behavior.hardware_unavailable {
                    return Err(VaultError::Unsupported);
                }
                if behavior.poisoned.contains(tag) {
                    return Err(VaultError::DuplicateItem);
                }
            }
            KeyTier::SoftwarePersistent => {
                if behavior.persistent_read_only {
                    return Err(VaultError::AccessDenied("persistent store is read-only".into()));
                }
                // A software write replaces whatever stale entry was there.
                behavior.poisoned.remove(tag);
            }
            KeyTier::SoftwareSession => {
                if behavior.session_unavailable {
                    return Err(VaultError::Backend("session store unavailable".into()));
                }
            }
            KeyTier::InMemory => return Err(VaultError::Unsupported),
        }
        drop(behavior);

        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(tag) {
            return Err(VaultError::DuplicateItem);
        }
        let key = Arc::new(SoftwareKey::generate(tier));
        entries.insert(tag.to_string(), Arc::clone(&key));
        Ok(key)
    }

    fn load(&self, tag: &str, auth: Option<&AuthContext>) -> Result<Arc<dyn VaultKey>, VaultError> {
        let behavior = self.behavior.lock().unwrap();
        if behavior.poisoned.contains(tag) {
            return Err(VaultError::Backend("entry is corrupted".into()));
        }
        if behavior.auth_required.contains(tag) && auth.is_none() {
            return Err(VaultError::AuthRequired);
        }
        drop(behavior);

        self.entries
            .read()
            .unwrap()
            .get(tag)
            .map(|key| Arc::clone(key) as Arc<dyn VaultKey>)
            .ok_or(VaultError::NotFound)
    }

    fn delete(&self, tag: &str) -> Result<(), VaultError> {
        let mut behavior = self.behavior.lock().unwrap();
        behavior.poisoned.remove(tag);
        behavior.auth_required.remove(tag);
        drop(behavior);
        self.entries.write().unwrap().remove(tag);
        Ok(())
    }
}
