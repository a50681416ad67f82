//! DID derivation and document building.
//!
//! Three identifier schemes derive from the *same* underlying key;
//! switching method never rotates the key, only the identifier:
//!
//! - `did:key` — the standard multicodec/multibase encoding of the P-256
//!   public key (`p256-pub` prefix, base58btc), with coordinates fixed by
//!   the canonical JWK encoding.
//! - `did:ethr` — a deterministic local-only placeholder: SHA-256 of the
//!   canonical JWK string, first 20 bytes, hex. Not a standard `did:ethr`
//!   registration and never resolved on-chain.
//! - `did:web` — a sanitized caller-supplied domain and path.
//!
//! Document construction is pure and stateless; documents are cached by
//! the coordinator, not here.

use std::sync::Arc;

use cardkit_keystore::{AuthContext, PublicKeyJwk, SecureKeyStore};
use multibase::Base;
use p256::EncodedPoint;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Multicodec varint prefix for `p256-pub` (0x1200).
const P256_CODEC: [u8; 2] = [0x80, 0x24];

/// Default verification-method fragment.
const KEY_FRAGMENT: &str = "key-0";

/// JSON-LD contexts for produced documents.
const CONTEXTS: [&str; 2] =
    ["https://www.w3.org/ns/did/v1", "https://w3id.org/security/suites/jws-2020/v1"];

/// Characters kept verbatim in `did:web` path segments (RFC 3986
/// unreserved set); everything else is percent-encoded.
const SEGMENT_KEEP: &AsciiSet =
    &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Supported DID methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DidMethod {
    /// `did:key`, derived from the public key alone.
    Key,
    /// `did:ethr`, the local deterministic placeholder scheme.
    Ethr,
    /// `did:web`, derived from a caller-supplied domain.
    Web,
}

/// One DID representation of the current key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidDescriptor {
    /// The identifier, e.g. `did:key:zDn…`.
    pub did: String,
    /// Verification-method id, `{did}#{fragment}`.
    pub verification_method_id: String,
    /// The public key backing the identifier.
    pub jwk: PublicKeyJwk,
}

/// A verification method entry in a DID document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// Method id, `{did}#{fragment}`.
    pub id: String,
    /// Suite type, per method.
    #[serde(rename = "type")]
    pub type_: String,
    /// The controlling DID.
    pub controller: String,
    /// Public key material.
    pub public_key_jwk: PublicKeyJwk,
}

/// A service endpoint advertised in a DID document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    /// Endpoint id.
    pub id: String,
    /// Endpoint type.
    #[serde(rename = "type")]
    pub type_: String,
    /// Endpoint URI.
    pub service_endpoint: String,
}

/// A DID document: a pure projection of a descriptor plus optional
/// service endpoints. Round-trips through JSON with the literal
/// `@context` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// JSON-LD contexts.
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    /// The document subject.
    pub id: String,
    /// Verification methods.
    pub verification_method: Vec<VerificationMethod>,
    /// Verification-method ids usable for authentication.
    pub authentication: Vec<String>,
    /// Verification-method ids usable for assertions.
    pub assertion_method: Vec<String>,
    /// Service endpoints, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<Vec<ServiceEndpoint>>,
}

/// Derives DID identifiers and documents from the key store's public key.
pub struct DidResolver {
    keys: Arc<SecureKeyStore>,
}

impl DidResolver {
    /// Creates a resolver over the given key store.
    #[must_use]
    pub const fn new(keys: Arc<SecureKeyStore>) -> Self {
        Self { keys }
    }

    /// Descriptor for the current key under `method`.
    ///
    /// # Errors
    /// Returns [`Error::KeyManagement`] when the key cannot be acquired,
    /// and [`Error::Configuration`] for [`DidMethod::Web`], which needs a
    /// domain; use [`Self::web_descriptor`].
    pub fn current_descriptor(
        &self,
        method: DidMethod,
        auth: Option<&AuthContext>,
    ) -> Result<DidDescriptor> {
        let jwk = self.keys.public_jwk(auth)?;
        let did = match method {
            DidMethod::Key => did_key(&jwk)?,
            DidMethod::Ethr => did_ethr(&jwk),
            DidMethod::Web => {
                return Err(Error::Configuration(
                    "did:web derivation requires a domain".to_string(),
                ))
            }
        };
        Ok(descriptor(did, jwk))
    }

    /// Descriptor for the current key as `did:web:{domain}[:{path}…]`.
    ///
    /// # Errors
    /// Returns [`Error::KeyManagement`] when the key cannot be acquired and
    /// [`Error::InvalidData`] when the domain sanitizes to nothing.
    pub fn web_descriptor(
        &self,
        domain: &str,
        path: &[&str],
        auth: Option<&AuthContext>,
    ) -> Result<DidDescriptor> {
        let jwk = self.keys.public_jwk(auth)?;
        Ok(descriptor(did_web(domain, path)?, jwk))
    }

    /// Builds the document for a descriptor. Pure and stateless.
    #[must_use]
    pub fn document(descriptor: &DidDescriptor, services: &[ServiceEndpoint]) -> DidDocument {
        let suite = if descriptor.did.starts_with("did:ethr:") {
            "EcdsaSecp256k1RecoveryMethod2020"
        } else {
            "JsonWebKey2020"
        };
        DidDocument {
            context: CONTEXTS.iter().map(ToString::to_string).collect(),
            id: descriptor.did.clone(),
            verification_method: vec![VerificationMethod {
                id: descriptor.verification_method_id.clone(),
                type_: suite.to_string(),
                controller: descriptor.did.clone(),
                public_key_jwk: descriptor.jwk.clone(),
            }],
            authentication: vec![descriptor.verification_method_id.clone()],
            assertion_method: vec![descriptor.verification_method_id.clone()],
            service: (!services.is_empty()).then(|| services.to_vec()),
        }
    }

    /// Document for the current key under `did:web`.
    ///
    /// # Errors
    /// As [`Self::web_descriptor`].
    pub fn did_web_document(
        &self,
        domain: &str,
        path: &[&str],
        services: &[ServiceEndpoint],
    ) -> Result<DidDocument> {
        let descriptor = self.web_descriptor(domain, path, None)?;
        Ok(Self::document(&descriptor, services))
    }
}

fn descriptor(did: String, jwk: PublicKeyJwk) -> DidDescriptor {
    DidDescriptor {
        verification_method_id: format!("{did}#{KEY_FRAGMENT}"),
        did,
        jwk,
    }
}

/// Standard `did:key` encoding: multicodec `p256-pub` prefix plus the
/// compressed SEC1 point (whose coordinates the canonical JWK fixes),
/// multibase base58btc.
fn did_key(jwk: &PublicKeyJwk) -> Result<String> {
    let (x, y) = jwk.coordinates().map_err(|e| Error::Cryptographic(e.to_string()))?;
    let point = EncodedPoint::from_affine_coordinates(&x.into(), &y.into(), true);

    let mut bytes = Vec::with_capacity(P256_CODEC.len() + point.len());
    bytes.extend_from_slice(&P256_CODEC);
    bytes.extend_from_slice(point.as_bytes());
    Ok(format!("did:key:{}", multibase::encode(Base::Base58Btc, &bytes)))
}

/// Local-only `did:ethr` placeholder: first 20 bytes of the SHA-256 of
/// the canonical JWK string, hex-encoded. Not resolvable on-chain.
fn did_ethr(jwk: &PublicKeyJwk) -> String {
    let digest = Sha256::digest(jwk.canonical_json().as_bytes());
    format!("did:ethr:0x{}", hex::encode(&digest[..20]))
}

/// Sanitizes domain and path into a `did:web` identifier.
fn did_web(domain: &str, path: &[&str]) -> Result<String> {
    let host = domain
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_matches('/')
        .to_lowercase();
    if host.is_empty() {
        return Err(Error::InvalidData("did:web domain is empty".to_string()));
    }

    let mut did = format!("did:web:{host}");
    for segment in path {
        let trimmed = segment.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        did.push(':');
        did.push_str(&utf8_percent_encode(trimmed, SEGMENT_KEEP).to_string());
    }
    Ok(did)
}
