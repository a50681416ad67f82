//! The coordinating state machine.
//!
//! Owns the published [`IdentityState`] snapshot and the discrete event
//! stream, drives the asynchronous import pipeline, and is the only API
//! the rest of the application talks to.
//!
//! # Concurrency
//!
//! All mutation funnels through one writer lock and follows a strict
//! copy-modify-replace discipline: read the last published snapshot,
//! build a derived copy, replace it atomically via a `watch` channel.
//! Readers are lock-free and never see interleaved partial writes;
//! concurrent writers to the same key get last-writer-wins. Key-store
//! work (which may block on a platform unlock prompt) always runs on
//! `spawn_blocking`, never on the publishing path.

mod import;
mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cardkit_keystore::AuthContext;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task;
use tracing::{debug, warn};
use url::Url;
use zeroize::Zeroize;

pub use import::{classify, ImportPayload};
pub use state::{
    CoordinatorEvent, CurrentProfile, GroupMembership, IdentityState, ImportEvent, ImportKind,
    MembershipStatus, OidcEvent, OidcEventKind, VerificationEvent,
};

use crate::credential::{CredentialEngine, VerificationStatus};
use crate::did::{DidMethod, DidResolver};
use crate::error::{Error, Result};
use crate::presentation::{
    CreatedRequest, PresentationProtocol, PresentationRequest, ProtocolConfig,
};
use crate::provider::{CacheStore, Group, GroupRoster, ZkIdentityProvider};

/// External capabilities the coordinator consumes.
pub struct Collaborators {
    /// Zero-knowledge identity engine.
    pub zk: Arc<dyn ZkIdentityProvider>,
    /// Group roster, read for membership-by-commitment.
    pub roster: Arc<dyn GroupRoster>,
    /// Persistence for cached documents and JWKs.
    pub cache: Arc<dyn CacheStore>,
}

/// The orchestrating state machine over the identity subsystem.
pub struct IdentityCoordinator {
    resolver: Arc<DidResolver>,
    engine: Arc<CredentialEngine>,
    protocol: Arc<PresentationProtocol>,
    collaborators: Collaborators,
    config: ProtocolConfig,
    method: DidMethod,
    writer: Mutex<()>,
    state_tx: watch::Sender<Arc<IdentityState>>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
}

impl IdentityCoordinator {
    /// Wires a coordinator at the composition root.
    #[must_use]
    pub fn new(
        resolver: Arc<DidResolver>,
        engine: Arc<CredentialEngine>,
        protocol: Arc<PresentationProtocol>,
        collaborators: Collaborators,
        config: ProtocolConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(Arc::new(IdentityState::default()));
        let (events_tx, _) = broadcast::channel(64);
        Self {
            resolver,
            engine,
            protocol,
            collaborators,
            config,
            method: DidMethod::Key,
            writer: Mutex::new(()),
            state_tx,
            events_tx,
        }
    }

    /// Switches the active DID method. The key is untouched; only the
    /// identifier derivation used by subsequent refreshes changes.
    #[must_use]
    pub const fn with_method(mut self, method: DidMethod) -> Self {
        self.method = method;
        self
    }

    /// The last published snapshot.
    #[must_use]
    pub fn state(&self) -> Arc<IdentityState> {
        self.state_tx.borrow().clone()
    }

    /// Subscribes to snapshot publications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<IdentityState>> {
        self.state_tx.subscribe()
    }

    /// Subscribes to the discrete event stream.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events_tx.subscribe()
    }

    /// Refreshes the published identity: DID descriptor and cached maps,
    /// then the lazily-created ZK bundle, then membership summaries.
    ///
    /// Each sub-step publishes its own partial update; `is_loading`
    /// clears once the DID step completes, while membership refresh may
    /// still be in flight. Errors land in `last_error`, never panic
    /// across the publish boundary.
    pub async fn refresh_identity(&self) {
        self.publish_with(|s| s.is_loading = true);

        let resolver = Arc::clone(&self.resolver);
        let cache = Arc::clone(&self.collaborators.cache);
        let method = self.method;
        let loaded = flatten_join(
            task::spawn_blocking(move || {
                let descriptor = resolver.current_descriptor(method, None)?;
                let documents = cache.load_documents()?;
                let jwks = cache.load_jwks()?;
                Ok::<_, Error>((descriptor, documents, jwks))
            })
            .await,
        );
        match loaded {
            Ok((descriptor, documents, jwks)) => {
                let document = DidResolver::document(&descriptor, &[]);
                self.publish_with(|s| {
                    s.cached_documents.extend(documents);
                    s.cached_documents.insert(descriptor.did.clone(), document.clone());
                    s.cached_jwks.extend(jwks);
                    s.cached_jwks.insert(descriptor.did.clone(), descriptor.jwk.clone());
                    s.profile.active_did = Some(descriptor.did.clone());
                    s.did_document = Some(document);
                    s.is_loading = false;
                    s.last_error = None;
                });
                self.persist_caches();
            }
            Err(e) => {
                self.publish_with(|s| {
                    s.is_loading = false;
                    s.last_error = Some(e.to_string());
                });
            }
        }

        let zk = Arc::clone(&self.collaborators.zk);
        let commitment = match flatten_join(task::spawn_blocking(move || zk.load_or_create()).await)
        {
            Ok(bundle) => {
                let commitment = bundle.commitment;
                self.publish_with(|s| s.profile.zk_commitment = Some(commitment.clone()));
                Some(commitment)
            }
            Err(e) => {
                self.publish_with(|s| s.last_error = Some(e.to_string()));
                None
            }
        };

        if let Some(commitment) = commitment {
            let roster = Arc::clone(&self.collaborators.roster);
            match flatten_join(task::spawn_blocking(move || roster.all_groups()).await) {
                Ok(groups) => {
                    let memberships = memberships_for(&groups, &commitment);
                    self.publish_with(|s| s.profile.memberships = memberships);
                }
                Err(e) => self.publish_with(|s| s.last_error = Some(e.to_string())),
            }
        }
    }

    /// Resolves a raw import payload and applies it.
    ///
    /// Classification runs off the publishing context; the result mutates
    /// state and is recorded as an [`ImportEvent`]. Failures set
    /// `last_error` without touching the cached maps.
    ///
    /// # Errors
    /// Returns the classification or application failure after recording
    /// it in published state.
    pub async fn import_identity(
        &self,
        source: impl Into<Vec<u8>>,
        auth: Option<AuthContext>,
    ) -> Result<ImportEvent> {
        let source = source.into();
        let config = self.config.clone();
        let classified =
            flatten_join(task::spawn_blocking(move || classify(&source, &config)).await);

        let payload = match classified {
            Ok(payload) => payload,
            Err(e) => {
                self.publish_with(|s| s.last_error = Some(e.to_string()));
                return Err(e);
            }
        };

        match self.apply_payload(payload, auth).await {
            Ok(event) => {
                debug!(kind = %event.kind, "import applied");
                self.publish_with(|s| {
                    s.last_import = Some(event.clone());
                    s.last_error = None;
                });
                let _ = self.events_tx.send(CoordinatorEvent::Import(event.clone()));
                Ok(event)
            }
            Err(e) => {
                self.publish_with(|s| s.last_error = Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Records a single credential's verification outcome and emits a
    /// discrete [`VerificationEvent`].
    pub fn update_status(&self, credential_id: &str, status: VerificationStatus) {
        let now = Utc::now();
        self.publish_with(|s| {
            s.verification_cache.insert(credential_id.to_string(), status);
            s.last_verification_update = Some(now);
        });
        let _ = self.events_tx.send(CoordinatorEvent::Verification(VerificationEvent {
            credential_id: credential_id.to_string(),
            status,
            timestamp: now,
        }));
    }

    /// Merges a batch of verification outcomes into the cache.
    ///
    /// Unlike [`Self::update_status`], merges publish a new snapshot but
    /// emit no discrete per-credential events; downstream observers rely
    /// on that asymmetry.
    pub fn merge_statuses(&self, statuses: HashMap<String, VerificationStatus>) {
        if statuses.is_empty() {
            return;
        }
        let now = Utc::now();
        self.publish_with(|s| {
            s.verification_cache.extend(statuses);
            s.last_verification_update = Some(now);
        });
    }

    /// Tracks an outbound presentation request at the state layer and
    /// emits [`OidcEventKind::RequestCreated`].
    pub fn register_request(&self, request: PresentationRequest) {
        let event = OidcEvent {
            kind: OidcEventKind::RequestCreated,
            state: request.state.clone(),
            timestamp: Utc::now(),
        };
        self.publish_with(|s| {
            s.active_requests.insert(request.state.clone(), request);
            s.last_oidc_event = Some(event.clone());
        });
        let _ = self.events_tx.send(CoordinatorEvent::Oidc(event));
    }

    /// Consumes a tracked request by its `state` token.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] when no request is tracked under
    /// `state`, including after a prior consumption.
    pub fn resolve_request(&self, state: &str) -> Result<PresentationRequest> {
        self.publish_with(|s| s.active_requests.remove(state))
            .ok_or_else(|| Error::NotFound(format!("no tracked request for state {state}")))
    }

    /// Creates a presentation request via the protocol layer and tracks
    /// it here.
    ///
    /// # Errors
    /// Propagates request-creation failures from the protocol.
    pub fn create_presentation_request(&self) -> Result<CreatedRequest> {
        let created = self.protocol.create_request()?;
        self.register_request(created.request.clone());
        Ok(created)
    }

    async fn apply_payload(
        &self,
        payload: ImportPayload,
        auth: Option<AuthContext>,
    ) -> Result<ImportEvent> {
        let (kind, summary) = match payload {
            ImportPayload::OidcCallback(uri) => {
                let imported = self.protocol.handle_response(&uri)?;
                if let Some(state) = query_param(&uri, "state") {
                    self.publish_with(|s| s.active_requests.remove(&state));
                }
                (
                    ImportKind::OidcResponse,
                    format!("Received contact card from {}", imported.card.display_name),
                )
            }
            ImportPayload::PresentationRequest(uri) => {
                let request = self.protocol.parse_request(&uri)?;
                (
                    ImportKind::OidcRequest,
                    format!("Presentation request from {}", request.client_id),
                )
            }
            ImportPayload::DidDocument(document) => {
                let id = document.id.clone();
                self.publish_with(|s| {
                    if s.profile.active_did.as_deref() == Some(id.as_str()) {
                        s.did_document = Some(*document.clone());
                    }
                    s.cached_documents.insert(id.clone(), *document);
                });
                self.persist_caches();
                (ImportKind::DidDocument, format!("Imported DID document for {id}"))
            }
            ImportPayload::PublicJwk { jwk, did_hint } => {
                let did = match did_hint.or_else(|| self.state().profile.active_did.clone()) {
                    Some(did) => did,
                    None => {
                        let resolver = Arc::clone(&self.resolver);
                        let method = self.method;
                        flatten_join(
                            task::spawn_blocking(move || {
                                resolver.current_descriptor(method, auth.as_ref())
                            })
                            .await,
                        )?
                        .did
                    }
                };
                self.publish_with(|s| {
                    s.cached_jwks.insert(did.clone(), *jwk);
                });
                self.persist_caches();
                (ImportKind::PublicJwk, format!("Cached public key for {did}"))
            }
            ImportPayload::ZkPrivateKey(mut bytes) => {
                let zk = Arc::clone(&self.collaborators.zk);
                let bundle = flatten_join(
                    task::spawn_blocking(move || {
                        let result = zk.import(&bytes);
                        bytes.zeroize();
                        result
                    })
                    .await,
                )?;
                let commitment = bundle.commitment;
                let memberships = self
                    .collaborators
                    .roster
                    .all_groups()
                    .map(|groups| memberships_for(&groups, &commitment))
                    .unwrap_or_default();
                self.publish_with(|s| {
                    s.profile.zk_commitment = Some(commitment);
                    s.profile.memberships = memberships;
                });
                (ImportKind::ZkPrivateKey, "Imported identity private key".to_string())
            }
            ImportPayload::CredentialJwt(jwt) => {
                let imported = self.engine.import_presented(&jwt)?;
                (
                    ImportKind::Credential,
                    format!("Imported contact card for {}", imported.card.display_name),
                )
            }
        };
        Ok(ImportEvent { kind, summary, timestamp: Utc::now() })
    }

    /// Writes the cached maps back to the persistence collaborator.
    /// Best-effort: a failed save is logged, never surfaced.
    fn persist_caches(&self) {
        let state = self.state();
        if let Err(e) = self.collaborators.cache.save_documents(&state.cached_documents) {
            warn!(error = %e, "failed to persist cached documents");
        }
        if let Err(e) = self.collaborators.cache.save_jwks(&state.cached_jwks) {
            warn!(error = %e, "failed to persist cached keys");
        }
    }

    /// Copy-modify-replace publication; the single writer lock serializes
    /// mutators, the `watch` channel hands readers a consistent snapshot.
    fn publish_with<R>(&self, mutate: impl FnOnce(&mut IdentityState) -> R) -> R {
        let _guard = self.writer.lock().unwrap();
        let mut next = (*self.state()).clone();
        let result = mutate(&mut next);
        self.state_tx.send_replace(Arc::new(next));
        result
    }
}

fn memberships_for(groups: &[Group], commitment: &str) -> Vec<GroupMembership> {
    groups
        .iter()
        .filter(|group| group.members.iter().any(|member| member == commitment))
        .map(|group| GroupMembership {
            group_id: group.id.clone(),
            name: group.name.clone(),
            // A present commitment is always `Active`; see DESIGN.md on the
            // unresolved `Outdated` production rule.
            status: MembershipStatus::Active,
        })
        .collect()
}

fn query_param(uri: &str, name: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    url.query_pairs().find(|(key, _)| key == name).map(|(_, value)| value.into_owned())
}

fn flatten_join<T>(joined: std::result::Result<Result<T>, task::JoinError>) -> Result<T> {
    joined.map_err(|e| Error::Configuration(format!("background task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use cardkit_keystore::{MemoryVault, SecureKeyStore};

    use super::*;
    use crate::credential::{CredentialLibrary, IssueOptions, MemoryLibrary};
    use crate::profile::ContactCard;
    use crate::provider::{MemoryCacheStore, MemoryRoster, MemoryZkProvider};

    struct Fixture {
        coordinator: Arc<IdentityCoordinator>,
        roster: Arc<MemoryRoster>,
        zk: Arc<MemoryZkProvider>,
        cache: Arc<MemoryCacheStore>,
    }

    fn fixture() -> Fixture {
        let vault = Arc::new(MemoryVault::new());
        let keys = Arc::new(SecureKeyStore::new(vault, "com.cardkit.identity"));
        let resolver = Arc::new(DidResolver::new(Arc::clone(&keys)));
        let library: Arc<dyn CredentialLibrary> = Arc::new(MemoryLibrary::new());
        let engine =
            Arc::new(CredentialEngine::new(keys, Arc::clone(&resolver), library));
        let protocol = Arc::new(PresentationProtocol::new(
            Arc::clone(&engine),
            ProtocolConfig::default(),
        ));
        let zk = Arc::new(MemoryZkProvider::new());
        let roster = Arc::new(MemoryRoster::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let collaborators = Collaborators {
            zk: Arc::clone(&zk) as Arc<dyn ZkIdentityProvider>,
            roster: Arc::clone(&roster) as Arc<dyn GroupRoster>,
            cache: Arc::clone(&cache) as Arc<dyn CacheStore>,
        };
        let coordinator = Arc::new(IdentityCoordinator::new(
            resolver,
            engine,
            protocol,
            collaborators,
            ProtocolConfig::default(),
        ));
        Fixture { coordinator, roster, zk, cache }
    }

    #[tokio::test]
    async fn test_refresh_publishes_identity() {
        let fixture = fixture();
        let commitment = fixture.zk.load_or_create().unwrap().commitment;
        fixture.roster.set_groups(vec![
            Group {
                id: "g1".to_string(),
                name: "Rust Meetup".to_string(),
                members: vec![commitment],
            },
            Group {
                id: "g2".to_string(),
                name: "Other".to_string(),
                members: vec!["0xnotus".to_string()],
            },
        ]);

        fixture.coordinator.refresh_identity().await;

        let state = fixture.coordinator.state();
        assert!(!state.is_loading);
        let did = state.profile.active_did.clone().unwrap();
        assert!(did.starts_with("did:key:z"));
        assert!(state.did_document.is_some());
        assert!(state.cached_documents.contains_key(&did));
        assert!(state.cached_jwks.contains_key(&did));
        assert!(state.profile.zk_commitment.is_some());
        assert_eq!(state.profile.memberships.len(), 1);
        assert_eq!(state.profile.memberships[0].group_id, "g1");
        assert_eq!(state.profile.memberships[0].status, MembershipStatus::Active);
    }

    #[tokio::test]
    async fn test_refresh_persists_caches() {
        let fixture = fixture();
        fixture.coordinator.refresh_identity().await;

        let did = fixture.coordinator.state().profile.active_did.clone().unwrap();
        assert!(fixture.cache.load_documents().unwrap().contains_key(&did));
        assert!(fixture.cache.load_jwks().unwrap().contains_key(&did));
    }

    #[tokio::test]
    async fn test_import_jwk_envelope_uses_hint() {
        let fixture = fixture();
        let payload = r#"{"did":"did:key:zPeer","jwk":{"kty":"EC","crv":"P-256","x":"EQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE","y":"IgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI"}}"#;

        let event = fixture.coordinator.import_identity(payload, None).await.unwrap();
        assert_eq!(event.kind, ImportKind::PublicJwk);

        let state = fixture.coordinator.state();
        assert!(state.cached_jwks.contains_key("did:key:zPeer"));
        assert_eq!(state.last_import.as_ref().unwrap().kind, ImportKind::PublicJwk);
    }

    #[tokio::test]
    async fn test_import_bare_jwk_falls_back_to_active_did() {
        let fixture = fixture();
        fixture.coordinator.refresh_identity().await;
        let active = fixture.coordinator.state().profile.active_did.clone().unwrap();

        let payload = r#"{"kty":"EC","crv":"P-256","x":"EQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE","y":"IgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI"}"#;
        fixture.coordinator.import_identity(payload, None).await.unwrap();

        assert!(fixture.coordinator.state().cached_jwks.contains_key(&active));
    }

    #[tokio::test]
    async fn test_import_zk_private_key() {
        let fixture = fixture();
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let encoded = STANDARD.encode([3_u8; 32]);

        let event = fixture.coordinator.import_identity(encoded, None).await.unwrap();
        assert_eq!(event.kind, ImportKind::ZkPrivateKey);
        assert!(fixture.coordinator.state().profile.zk_commitment.is_some());
    }

    #[tokio::test]
    async fn test_import_failure_sets_last_error() {
        let fixture = fixture();
        let err = fixture.coordinator.import_identity("hello world", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));

        let state = fixture.coordinator.state();
        assert!(state.last_error.is_some());
        assert!(state.last_import.is_none());
        assert!(state.cached_jwks.is_empty());
    }

    #[tokio::test]
    async fn test_oidc_round_trip_through_import() {
        let fixture = fixture();
        let created = fixture.coordinator.create_presentation_request().unwrap();
        assert!(fixture.coordinator.state().active_requests.contains_key(&created.request.state));

        let card = ContactCard { display_name: "Peer".to_string(), ..ContactCard::default() };
        let jwt = fixture.coordinator.engine.issue(&card, IssueOptions::default()).unwrap().jwt;
        let callback =
            fixture.coordinator.protocol.build_response_uri(&created.request, &jwt).unwrap();

        let event = fixture.coordinator.import_identity(callback, None).await.unwrap();
        assert_eq!(event.kind, ImportKind::OidcResponse);
        assert!(event.summary.contains("Peer"));
        assert!(!fixture
            .coordinator
            .state()
            .active_requests
            .contains_key(&created.request.state));
    }

    #[test]
    fn test_resolve_request_is_single_use() {
        let fixture = fixture();
        let created = fixture.coordinator.create_presentation_request().unwrap();

        assert!(fixture.coordinator.resolve_request(&created.request.state).is_ok());
        assert!(matches!(
            fixture.coordinator.resolve_request(&created.request.state),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_update_status_emits_event_merge_does_not() {
        let fixture = fixture();
        let mut events = fixture.coordinator.events();

        fixture.coordinator.update_status("cred-1", VerificationStatus::Verified);
        let Ok(CoordinatorEvent::Verification(event)) = events.try_recv() else {
            panic!("expected a discrete verification event");
        };
        assert_eq!(event.credential_id, "cred-1");

        let mut batch = HashMap::new();
        batch.insert("cred-2".to_string(), VerificationStatus::Failed);
        batch.insert("cred-3".to_string(), VerificationStatus::Verified);
        fixture.coordinator.merge_statuses(batch);

        assert!(events.try_recv().is_err());
        let state = fixture.coordinator.state();
        assert_eq!(state.verification_cache.len(), 3);
        assert!(state.last_verification_update.is_some());
    }

    #[test]
    fn test_concurrent_updates_lose_neither() {
        let fixture = fixture();
        let coordinator = Arc::clone(&fixture.coordinator);

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(std::thread::spawn(move || {
                coordinator.update_status(&format!("cred-{i}"), VerificationStatus::Verified);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fixture.coordinator.state().verification_cache.len(), 16);
    }

    #[test]
    fn test_memberships_only_for_matching_commitment() {
        let groups = vec![
            Group {
                id: "g1".to_string(),
                name: "A".to_string(),
                members: vec!["0xaa".to_string(), "0xbb".to_string()],
            },
            Group { id: "g2".to_string(), name: "B".to_string(), members: vec![] },
        ];
        let memberships = memberships_for(&groups, "0xbb");
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].group_id, "g1");
    }
}
