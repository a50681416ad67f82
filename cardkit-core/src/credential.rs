//! JWT credential issuance, verification, and import.
//!
//! Credentials are self-signed compact JWTs whose subject embeds a
//! normalized contact-card snapshot plus the issuer's public JWK, so a
//! recipient can verify offline with nothing but the token. A failed
//! cryptographic check is a normal verification *outcome* (`Failed`), not
//! an error; errors are reserved for malformed tokens and collaborator
//! failures.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cardkit_keystore::{AuthContext, KeyError, PublicKeyJwk, SecureKeyStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::did::{DidMethod, DidResolver};
use crate::error::{Error, Result};
use crate::jose::{
    decode_segment, decode_segment_bytes, encode_segment, normalize_signature, split_compact,
    verify_es256, Header,
};
use crate::profile::{ContactCard, ProfileSnapshot};

/// Verification state of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VerificationStatus {
    /// Imported or freshly issued; signature never checked.
    Unverified,
    /// Signature and validity window checked out.
    Verified,
    /// Signature mismatch, missing key material, or validity window
    /// violation.
    Failed,
}

/// The credential subject: the shared profile plus the issuer's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSubject {
    /// Shared profile fields, flattened into the subject object.
    #[serde(flatten)]
    pub profile: ProfileSnapshot,
    /// The issuer's public key, embedded for offline verification.
    #[serde(rename = "publicKeyJwk", skip_serializing_if = "Option::is_none")]
    pub public_key_jwk: Option<PublicKeyJwk>,
}

/// JWT claims carried by a contact-card credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    /// Issuer DID.
    pub iss: String,
    /// Holder DID.
    pub sub: String,
    /// Issued-at, UNIX seconds.
    pub iat: i64,
    /// Not-before, UNIX seconds.
    pub nbf: i64,
    /// Expiry, UNIX seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Unique credential id.
    #[serde(rename = "credentialId")]
    pub credential_id: String,
    /// The credential subject.
    #[serde(rename = "credentialSubject")]
    pub credential_subject: CredentialSubject,
}

/// A signed credential plus its decoded halves for inspection.
/// Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    /// The compact JWT.
    pub jwt: String,
    /// Decoded protected header.
    pub header: Header,
    /// Decoded claims.
    pub payload: CredentialClaims,
    /// The profile snapshot embedded at issuance.
    pub snapshot: ProfileSnapshot,
    /// Issuance time.
    pub issued_at: DateTime<Utc>,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Holder DID.
    pub holder_did: String,
    /// Issuer DID.
    pub issuer_did: String,
}

/// An issued credential with mutable verification state, owned by the
/// credential library collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    /// The immutable signed artifact.
    pub credential: IssuedCredential,
    /// Latest verification outcome.
    pub status: VerificationStatus,
    /// When verification last ran, pass or fail.
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// A credential imported from a peer, with the recovered editable card.
#[derive(Debug, Clone)]
pub struct ImportedCredential {
    /// The stored record, status `Unverified`.
    pub stored: StoredCredential,
    /// The contact card recovered from the subject.
    pub card: ContactCard,
}

/// Persistence collaborator for stored credentials. The core depends on
/// this but does not implement durable storage.
pub trait CredentialLibrary: Send + Sync {
    /// Stores a newly issued or imported credential.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on persistence failure.
    fn add(
        &self,
        credential: IssuedCredential,
        status: VerificationStatus,
    ) -> Result<StoredCredential>;

    /// Persists updated verification state.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on persistence failure or when the
    /// record is unknown.
    fn update(&self, stored: StoredCredential) -> Result<StoredCredential>;
}

/// In-memory credential library, for tests and hosts without durable
/// storage.
#[derive(Default)]
pub struct MemoryLibrary {
    records: RwLock<HashMap<String, StoredCredential>>,
}

impl MemoryLibrary {
    /// Creates an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a record by credential id.
    #[must_use]
    pub fn get(&self, credential_id: &str) -> Option<StoredCredential> {
        self.records.read().unwrap().get(credential_id).cloned()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the library is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// All stored records, in no particular order.
    #[must_use]
    pub fn all(&self) -> Vec<StoredCredential> {
        self.records.read().unwrap().values().cloned().collect()
    }
}

impl CredentialLibrary for MemoryLibrary {
    fn add(
        &self,
        credential: IssuedCredential,
        status: VerificationStatus,
    ) -> Result<StoredCredential> {
        let stored = StoredCredential { credential, status, last_verified_at: None };
        self.records
            .write()
            .unwrap()
            .insert(stored.credential.payload.credential_id.clone(), stored.clone());
        Ok(stored)
    }

    fn update(&self, stored: StoredCredential) -> Result<StoredCredential> {
        let mut records = self.records.write().unwrap();
        let id = stored.credential.payload.credential_id.clone();
        if !records.contains_key(&id) {
            return Err(Error::Storage(format!("credential not in library: {id}")));
        }
        records.insert(id, stored.clone());
        Ok(stored)
    }
}

/// Options for [`CredentialEngine::issue`].
#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    /// Holder DID; defaults to the issuer (self-signed).
    pub holder_did: Option<String>,
    /// Issuer DID; defaults to the current descriptor's DID.
    pub issuer_did: Option<String>,
    /// Absolute expiry; `None` issues a non-expiring credential.
    pub expires_at: Option<DateTime<Utc>>,
    /// Auth context for key access, if the platform item is protected.
    pub auth: Option<AuthContext>,
}

/// Issues and verifies contact-card credentials.
pub struct CredentialEngine {
    keys: Arc<SecureKeyStore>,
    resolver: Arc<DidResolver>,
    library: Arc<dyn CredentialLibrary>,
    method: DidMethod,
}

impl CredentialEngine {
    /// Creates an engine issuing under `did:key`.
    #[must_use]
    pub fn new(
        keys: Arc<SecureKeyStore>,
        resolver: Arc<DidResolver>,
        library: Arc<dyn CredentialLibrary>,
    ) -> Self {
        Self { keys, resolver, library, method: DidMethod::Key }
    }

    /// Switches the DID method used for issuance. Does not rotate the key.
    #[must_use]
    pub const fn with_method(mut self, method: DidMethod) -> Self {
        self.method = method;
        self
    }

    /// Issues a self-signed credential for `card`.
    ///
    /// # Errors
    /// Returns [`Error::KeyManagement`] when the signing key is
    /// unavailable and [`Error::Cryptographic`] when the produced token
    /// fails structural re-validation.
    pub fn issue(&self, card: &ContactCard, options: IssueOptions) -> Result<IssuedCredential> {
        let descriptor = self.resolver.current_descriptor(self.method, options.auth.as_ref())?;

        let issuer_did = options.issuer_did.unwrap_or_else(|| descriptor.did.clone());
        let holder_did = options.holder_did.unwrap_or_else(|| issuer_did.clone());
        let issued_at = Utc::now();
        let snapshot = ProfileSnapshot::from(card);

        let payload = CredentialClaims {
            iss: issuer_did.clone(),
            sub: holder_did.clone(),
            iat: issued_at.timestamp(),
            nbf: issued_at.timestamp(),
            exp: options.expires_at.map(|t| t.timestamp()),
            credential_id: Uuid::new_v4().to_string(),
            credential_subject: CredentialSubject {
                profile: snapshot.clone(),
                public_key_jwk: Some(descriptor.jwk.clone()),
            },
        };
        let header = Header::es256(descriptor.verification_method_id);

        let signing_input = format!("{}.{}", encode_segment(&header)?, encode_segment(&payload)?);
        let handle = self.keys.signing_handle(options.auth.as_ref())?;
        let signature = handle
            .sign(signing_input.as_bytes())
            .map_err(|e| Error::KeyManagement(KeyError::Signing(e.to_string())))?;
        let raw = normalize_signature(&signature)?;
        let jwt = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(raw));

        revalidate(&jwt)?;
        debug!(credential_id = %payload.credential_id, "issued credential");

        Ok(IssuedCredential {
            jwt,
            header,
            snapshot,
            issued_at,
            expires_at: options.expires_at,
            holder_did,
            issuer_did,
            payload,
        })
    }

    /// Verifies a stored credential and persists the outcome.
    ///
    /// Cryptographic failure, a missing embedded key, a future `nbf`, or a
    /// passed `exp` all yield status [`VerificationStatus::Failed`] as a
    /// *successful* result. Only malformed tokens and library failures are
    /// errors.
    ///
    /// # Errors
    /// Returns [`Error::InvalidData`] for a structurally malformed JWT and
    /// [`Error::Storage`] when persisting the outcome fails.
    pub fn verify(&self, stored: StoredCredential) -> Result<StoredCredential> {
        let (header_seg, payload_seg, signature_seg) = split_compact(&stored.credential.jwt)?;
        let _header: Header = decode_segment(header_seg)?;
        let payload: serde_json::Value =
            serde_json::from_slice(&decode_segment_bytes(payload_seg)?)?;
        let claims = unwrap_envelope(payload);

        let now = Utc::now();
        let status = evaluate(
            &claims,
            &format!("{header_seg}.{payload_seg}"),
            signature_seg,
            now.timestamp(),
        )?;

        let updated = StoredCredential {
            status,
            last_verified_at: Some(now),
            ..stored
        };
        self.library.update(updated)
    }

    /// Imports a credential presented by a peer.
    ///
    /// The subject is mapped back into a [`ContactCard`] tolerantly;
    /// the record is stored [`VerificationStatus::Unverified`]; imported
    /// credentials are never auto-trusted, verification is a separate
    /// caller-invoked step.
    ///
    /// # Errors
    /// Returns [`Error::InvalidData`] when the token or its subject cannot
    /// be decoded, and [`Error::Storage`] when the library rejects the
    /// record.
    pub fn import_presented(&self, jwt: &str) -> Result<ImportedCredential> {
        let (header_seg, payload_seg, _) = split_compact(jwt)?;
        let header: Header = decode_segment(header_seg)?;
        let payload: serde_json::Value =
            serde_json::from_slice(&decode_segment_bytes(payload_seg)?)?;
        let claims_value = unwrap_envelope(payload);

        let subject = claims_value
            .get("credentialSubject")
            .ok_or_else(|| Error::InvalidData("credential has no subject".to_string()))?;
        let snapshot = ProfileSnapshot::from_subject(subject)
            .ok_or_else(|| Error::InvalidData("unrecognized credential subject".to_string()))?;

        let claims: CredentialClaims = serde_json::from_value(claims_value)?;
        let issued_at = DateTime::from_timestamp(claims.iat, 0)
            .ok_or_else(|| Error::InvalidData("iat out of range".to_string()))?;
        let expires_at = claims.exp.and_then(|exp| DateTime::from_timestamp(exp, 0));

        let credential = IssuedCredential {
            jwt: jwt.to_string(),
            header,
            snapshot: snapshot.clone(),
            issued_at,
            expires_at,
            holder_did: claims.sub.clone(),
            issuer_did: claims.iss.clone(),
            payload: claims,
        };
        let stored = self.library.add(credential, VerificationStatus::Unverified)?;
        Ok(ImportedCredential { stored, card: snapshot.into_card() })
    }
}

/// Accepts both the flat claims object and the legacy nested
/// `{"payload": {...}}` envelope.
fn unwrap_envelope(value: serde_json::Value) -> serde_json::Value {
    if value.get("iss").is_none() {
        if let Some(inner) = value.get("payload").filter(|v| v.is_object()) {
            return inner.clone();
        }
    }
    value
}

/// Evaluates signature and validity window; returns a status, never a
/// cryptographic error.
fn evaluate(
    claims: &serde_json::Value,
    message: &str,
    signature_seg: &str,
    now: i64,
) -> Result<VerificationStatus> {
    let Some(jwk) = claims
        .get("credentialSubject")
        .and_then(|s| s.get("publicKeyJwk"))
        .and_then(|v| serde_json::from_value::<PublicKeyJwk>(v.clone()).ok())
    else {
        warn!("verification failed: missing public key");
        return Ok(VerificationStatus::Failed);
    };

    // Tampering with the signature segment may break its base64 or its
    // scalar encoding; both are verification failures, not errors.
    let Ok(bytes) = decode_segment_bytes(signature_seg) else {
        return Ok(VerificationStatus::Failed);
    };
    let Ok(raw) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return Ok(VerificationStatus::Failed);
    };
    match verify_es256(&jwk, message.as_bytes(), &raw) {
        Ok(true) => {}
        Ok(false) => return Ok(VerificationStatus::Failed),
        Err(e) => {
            warn!(error = %e, "verification failed: unusable embedded key");
            return Ok(VerificationStatus::Failed);
        }
    }

    if claims.get("nbf").and_then(serde_json::Value::as_i64).is_some_and(|nbf| nbf > now) {
        return Ok(VerificationStatus::Failed);
    }
    if claims.get("exp").and_then(serde_json::Value::as_i64).is_some_and(|exp| exp < now) {
        return Ok(VerificationStatus::Failed);
    }
    Ok(VerificationStatus::Verified)
}

/// Re-parses a freshly issued token. A claims-shape decode failure is
/// non-fatal (logged and ignored); structural failures abort issuance.
fn revalidate(jwt: &str) -> Result<()> {
    let (header_seg, payload_seg, signature_seg) = split_compact(jwt)
        .map_err(|e| Error::Cryptographic(format!("issued token malformed: {e}")))?;
    let _: Header = decode_segment(header_seg)
        .map_err(|e| Error::Cryptographic(format!("issued header malformed: {e}")))?;
    let bytes = decode_segment_bytes(payload_seg)
        .map_err(|e| Error::Cryptographic(format!("issued payload malformed: {e}")))?;
    decode_segment_bytes(signature_seg)
        .map_err(|e| Error::Cryptographic(format!("issued signature malformed: {e}")))?;

    if let Err(e) = serde_json::from_slice::<CredentialClaims>(&bytes) {
        warn!(error = %e, "issued claims failed shape check; proceeding");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cardkit_keystore::MemoryVault;
    use chrono::Duration;

    use super::*;
    use crate::profile::SocialAccount;

    fn engine() -> (CredentialEngine, Arc<MemoryLibrary>) {
        let vault = Arc::new(MemoryVault::new());
        let keys = Arc::new(SecureKeyStore::new(vault, "com.cardkit.identity"));
        let resolver = Arc::new(DidResolver::new(Arc::clone(&keys)));
        let library = Arc::new(MemoryLibrary::new());
        (
            CredentialEngine::new(keys, resolver, Arc::clone(&library) as Arc<dyn CredentialLibrary>),
            library,
        )
    }

    fn card() -> ContactCard {
        ContactCard {
            display_name: "Sam Reyes".to_string(),
            title: Some("Engineer".to_string()),
            organization: Some("Acme".to_string()),
            skills: vec!["rust".to_string(), "zk".to_string()],
            social_accounts: vec![SocialAccount {
                service: "mastodon".to_string(),
                handle: "@sam".to_string(),
                url: None,
            }],
            avatar: None,
        }
    }

    fn store(library: &MemoryLibrary, credential: IssuedCredential) -> StoredCredential {
        library.add(credential, VerificationStatus::Unverified).unwrap()
    }

    #[test]
    fn test_issue_then_verify_is_verified() {
        let (engine, library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();
        assert_eq!(issued.jwt.split('.').count(), 3);
        assert!(!issued.jwt.contains('='));

        let verified = engine.verify(store(&library, issued)).unwrap();
        assert_eq!(verified.status, VerificationStatus::Verified);
        assert!(verified.last_verified_at.is_some());
    }

    #[test]
    fn test_tampered_signature_yields_failed_not_error() {
        let (engine, library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();

        let mut parts: Vec<String> =
            issued.jwt.split('.').map(ToString::to_string).collect();
        let mut sig = parts[2].clone().into_bytes();
        sig[7] = if sig[7] == b'A' { b'B' } else { b'A' };
        parts[2] = String::from_utf8(sig).unwrap();

        let mut stored = store(&library, issued);
        stored.credential.jwt = parts.join(".");
        let outcome = engine.verify(stored).unwrap();
        assert_eq!(outcome.status, VerificationStatus::Failed);
    }

    #[test]
    fn test_expired_credential_fails() {
        let (engine, library) = engine();
        let options = IssueOptions {
            expires_at: Some(Utc::now() - Duration::seconds(1)),
            ..IssueOptions::default()
        };
        let issued = engine.issue(&card(), options).unwrap();
        let outcome = engine.verify(store(&library, issued)).unwrap();
        assert_eq!(outcome.status, VerificationStatus::Failed);
    }

    #[test]
    fn test_malformed_jwt_is_an_error() {
        let (engine, library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();
        let mut stored = store(&library, issued);
        stored.credential.jwt = "only.two".to_string();
        assert!(matches!(engine.verify(stored), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_nested_envelope_verifies() {
        let (engine, library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();

        // Re-wrap the payload in the legacy nested shape and re-sign.
        let (h, p, _) = split_compact(&issued.jwt).unwrap();
        let inner: serde_json::Value =
            serde_json::from_slice(&decode_segment_bytes(p).unwrap()).unwrap();
        let nested = serde_json::json!({ "payload": inner });
        let nested_seg = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&nested).unwrap());
        let signing_input = format!("{h}.{nested_seg}");
        let handle = engine.keys.signing_handle(None).unwrap();
        let raw = normalize_signature(&handle.sign(signing_input.as_bytes()).unwrap()).unwrap();

        let mut stored = store(&library, issued);
        stored.credential.jwt = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(raw));
        let outcome = engine.verify(stored).unwrap();
        assert_eq!(outcome.status, VerificationStatus::Verified);
    }

    #[test]
    fn test_missing_subject_key_fails_verification() {
        let (engine, library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();

        let jwt = issued.jwt.clone();
        let (h, p, s) = split_compact(&jwt).unwrap();
        let mut claims: serde_json::Value =
            serde_json::from_slice(&decode_segment_bytes(p).unwrap()).unwrap();
        claims["credentialSubject"].as_object_mut().unwrap().remove("publicKeyJwk");
        let stripped = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());

        let mut stored = store(&library, issued);
        stored.credential.jwt = format!("{h}.{stripped}.{s}");
        let outcome = engine.verify(stored).unwrap();
        assert_eq!(outcome.status, VerificationStatus::Failed);
    }

    #[test]
    fn test_verify_persists_outcome() {
        let (engine, library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();
        let id = issued.payload.credential_id.clone();

        engine.verify(store(&library, issued)).unwrap();
        assert_eq!(library.get(&id).unwrap().status, VerificationStatus::Verified);
    }

    #[test]
    fn test_update_unknown_record_is_storage_error() {
        let (engine, _library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();
        // Never added to the library, so persisting the outcome fails.
        let stored = StoredCredential {
            credential: issued,
            status: VerificationStatus::Unverified,
            last_verified_at: None,
        };
        assert!(matches!(engine.verify(stored), Err(Error::Storage(_))));
    }

    #[test]
    fn test_import_presented_round_trip() {
        let (engine, library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();

        let imported = engine.import_presented(&issued.jwt).unwrap();
        assert_eq!(imported.stored.status, VerificationStatus::Unverified);
        assert_eq!(imported.card.display_name, "Sam Reyes");
        assert_eq!(imported.card.skills, vec!["rust", "zk"]);
        assert!(library.get(&imported.stored.credential.payload.credential_id).is_some());
    }

    #[test]
    fn test_import_tolerates_sparse_subject() {
        let (engine, _library) = engine();
        let sparse = ContactCard { display_name: "Ada".to_string(), ..ContactCard::default() };
        let issued = engine.issue(&sparse, IssueOptions::default()).unwrap();

        let imported = engine.import_presented(&issued.jwt).unwrap();
        assert_eq!(imported.card.display_name, "Ada");
        assert!(imported.card.skills.is_empty());
        assert!(imported.card.organization.is_none());
    }

    #[test]
    fn test_holder_and_issuer_defaults() {
        let (engine, _library) = engine();
        let issued = engine.issue(&card(), IssueOptions::default()).unwrap();
        assert_eq!(issued.holder_did, issued.issuer_did);
        assert!(issued.issuer_did.starts_with("did:key:z"));

        let issued = engine
            .issue(
                &card(),
                IssueOptions {
                    holder_did: Some("did:key:zPeer".to_string()),
                    ..IssueOptions::default()
                },
            )
            .unwrap();
        assert_eq!(issued.holder_did, "did:key:zPeer");
        assert_ne!(issued.holder_did, issued.issuer_did);
    }
}
