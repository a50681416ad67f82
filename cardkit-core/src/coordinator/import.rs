//! Import payload classification.
//!
//! `classify` is a pure function over raw input bytes; each branch is
//! unit-testable without I/O. The cascade order is a contract: a payload
//! matching several shapes resolves to the *first* matching branch:
//!
//! 1. OIDC callback URI (by prefix)
//! 2. Presentation-request URI (by prefix)
//! 3. JSON DID document
//! 4. JSON bare JWK
//! 5. JSON envelope (`document` / `jwk` / `privateKey` /
//!    `semaphorePrivateKey` / `credential` keys)
//! 6. Three-segment dot-delimited credential JWT
//! 7. Base64 of 32 or 64 bytes → raw ZK private key
//! 8. Base64 of UTF-8 text → one retry of the cascade on the decoded text
//! 9. Unsupported
//!
//! The step-8 retry runs at most once so adversarial nesting cannot
//! recurse.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cardkit_keystore::{PublicKeyJwk, ALG_ES256};
use serde_json::Value;

use crate::did::DidDocument;
use crate::error::{Error, Result};
use crate::presentation::ProtocolConfig;

/// A classified import payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportPayload {
    /// An OIDC response callback URI, to be consumed against a pending
    /// request.
    OidcCallback(String),
    /// A peer's presentation-request URI.
    PresentationRequest(String),
    /// A DID document to cache.
    DidDocument(Box<DidDocument>),
    /// A bare public JWK, cached under `did_hint` when supplied.
    PublicJwk {
        /// The key.
        jwk: Box<PublicKeyJwk>,
        /// DID to cache the key under, when the envelope named one.
        did_hint: Option<String>,
    },
    /// Raw private-key bytes for the ZK identity.
    ZkPrivateKey(Vec<u8>),
    /// A credential JWT.
    CredentialJwt(String),
}

/// Classifies raw import bytes into a typed payload.
///
/// Byte input that is not UTF-8 can only be a raw private key.
///
/// # Errors
/// Returns [`Error::InvalidData`] when no branch matches.
pub fn classify(input: &[u8], config: &ProtocolConfig) -> Result<ImportPayload> {
    match std::str::from_utf8(input) {
        Ok(text) => classify_text(text.trim(), config, false),
        Err(_) => classify_binary(input),
    }
}

fn classify_text(text: &str, config: &ProtocolConfig, retried: bool) -> Result<ImportPayload> {
    if text.starts_with(&config.callback_prefix()) {
        return Ok(ImportPayload::OidcCallback(text.to_string()));
    }
    if text.starts_with(&config.request_prefix()) {
        return Ok(ImportPayload::PresentationRequest(text.to_string()));
    }

    // Only JSON objects participate in the document/JWK/envelope branches;
    // scalar JSON (a bare number, say) falls through to the later steps.
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() {
            return classify_json(&value);
        }
    }

    if is_compact_jwt(text) {
        return Ok(ImportPayload::CredentialJwt(text.to_string()));
    }

    if let Ok(bytes) = STANDARD.decode(text) {
        if bytes.len() == 32 || bytes.len() == 64 {
            return Ok(ImportPayload::ZkPrivateKey(bytes));
        }
        if !retried {
            if let Ok(decoded) = std::str::from_utf8(&bytes) {
                let decoded = decoded.trim();
                if decoded != text {
                    return classify_text(decoded, config, true);
                }
            }
        }
    }

    Err(Error::InvalidData("unsupported import format".to_string()))
}

fn classify_binary(input: &[u8]) -> Result<ImportPayload> {
    if input.len() == 32 || input.len() == 64 {
        return Ok(ImportPayload::ZkPrivateKey(input.to_vec()));
    }
    Err(Error::InvalidData("unsupported binary import".to_string()))
}

fn classify_json(value: &Value) -> Result<ImportPayload> {
    if looks_like_did_document(value) {
        if let Ok(document) = serde_json::from_value::<DidDocument>(value.clone()) {
            return Ok(ImportPayload::DidDocument(Box::new(document)));
        }
    }

    if let Some(jwk) = jwk_from_value(value) {
        return Ok(ImportPayload::PublicJwk { jwk: Box::new(jwk), did_hint: None });
    }

    classify_envelope(value)
}

/// Envelope keys are tried in a fixed order; a present-but-malformed
/// value fails the whole import rather than falling through.
fn classify_envelope(value: &Value) -> Result<ImportPayload> {
    if let Some(document) = value.get("document") {
        let document = serde_json::from_value::<DidDocument>(document.clone())
            .map_err(|e| Error::InvalidData(format!("envelope document: {e}")))?;
        return Ok(ImportPayload::DidDocument(Box::new(document)));
    }

    if let Some(jwk_value) = value.get("jwk") {
        let parsed = match jwk_value {
            Value::String(text) => serde_json::from_str::<Value>(text)
                .ok()
                .as_ref()
                .and_then(jwk_from_value),
            other => jwk_from_value(other),
        };
        let jwk =
            parsed.ok_or_else(|| Error::InvalidData("envelope jwk is malformed".to_string()))?;
        let did_hint =
            value.get("did").and_then(Value::as_str).map(ToString::to_string);
        return Ok(ImportPayload::PublicJwk { jwk: Box::new(jwk), did_hint });
    }

    for key in ["privateKey", "semaphorePrivateKey"] {
        if let Some(encoded) = value.get(key) {
            let encoded = encoded
                .as_str()
                .ok_or_else(|| Error::InvalidData(format!("envelope {key} is not a string")))?;
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| Error::InvalidData(format!("envelope {key}: {e}")))?;
            return Ok(ImportPayload::ZkPrivateKey(bytes));
        }
    }

    if let Some(credential) = value.get("credential") {
        let token = credential
            .as_str()
            .filter(|t| is_compact_jwt(t))
            .ok_or_else(|| Error::InvalidData("envelope credential is not a JWT".to_string()))?;
        return Ok(ImportPayload::CredentialJwt(token.to_string()));
    }

    Err(Error::InvalidData("unsupported JSON import".to_string()))
}

/// A DID document must at least carry a `did:`-prefixed id and a
/// verification-method list; anything less falls through the cascade.
fn looks_like_did_document(value: &Value) -> bool {
    value
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| id.starts_with("did:"))
        && value.get("verificationMethod").is_some()
}

/// Tolerant bare-JWK shape check: `kty`, `crv`, `x`, `y` are required,
/// `alg` defaults to ES256 when absent.
fn jwk_from_value(value: &Value) -> Option<PublicKeyJwk> {
    let field = |key: &str| value.get(key).and_then(Value::as_str).map(ToString::to_string);
    Some(PublicKeyJwk {
        alg: field("alg").unwrap_or_else(|| ALG_ES256.to_string()),
        crv: field("crv")?,
        kty: field("kty")?,
        x: field("x")?,
        y: field("y")?,
    })
}

fn is_compact_jwt(text: &str) -> bool {
    !text.contains(char::is_whitespace)
        && text.split('.').count() == 3
        && text.split('.').all(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn config() -> ProtocolConfig {
        ProtocolConfig::default()
    }

    fn sample_jwk_json() -> String {
        r#"{"kty":"EC","crv":"P-256","x":"EQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE","y":"IgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI"}"#
            .to_string()
    }

    fn sample_document_json() -> String {
        format!(
            r#"{{"@context":["https://www.w3.org/ns/did/v1"],"id":"did:key:zTest","verificationMethod":[{{"id":"did:key:zTest#key-0","type":"JsonWebKey2020","controller":"did:key:zTest","publicKeyJwk":{jwk}}}],"authentication":["did:key:zTest#key-0"],"assertionMethod":["did:key:zTest#key-0"]}}"#,
            jwk = sample_jwk_json()
        )
    }

    #[test]
    fn test_callback_uri_wins_first() {
        let payload =
            classify(b"cardkit://callback?state=ab&vp_token=a.b.c", &config()).unwrap();
        assert!(matches!(payload, ImportPayload::OidcCallback(_)));
    }

    #[test]
    fn test_request_uri_second() {
        let payload = classify(b"cardkit://?request=eyJhIjoxfQ", &config()).unwrap();
        assert!(matches!(payload, ImportPayload::PresentationRequest(_)));
    }

    #[test]
    fn test_did_document_branch() {
        let payload = classify(sample_document_json().as_bytes(), &config()).unwrap();
        let ImportPayload::DidDocument(document) = payload else {
            panic!("expected DID document");
        };
        assert_eq!(document.id, "did:key:zTest");
    }

    #[test]
    fn test_did_document_beats_jwt_shape() {
        // The compact document JSON happens to split into exactly three
        // non-empty dot-delimited segments (both dots live in the context
        // URL), so only branch order keeps it out of the JWT branch.
        let contrived = sample_document_json();
        assert!(is_compact_jwt(&contrived));
        let payload = classify(contrived.as_bytes(), &config()).unwrap();
        assert!(matches!(payload, ImportPayload::DidDocument(_)));
    }

    #[test]
    fn test_bare_jwk_branch() {
        let payload = classify(sample_jwk_json().as_bytes(), &config()).unwrap();
        let ImportPayload::PublicJwk { jwk, did_hint } = payload else {
            panic!("expected JWK");
        };
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.alg, "ES256");
        assert!(did_hint.is_none());
    }

    #[test]
    fn test_envelope_jwk_object_with_hint() {
        let envelope =
            format!(r#"{{"did":"did:key:zPeer","jwk":{}}}"#, sample_jwk_json());
        let payload = classify(envelope.as_bytes(), &config()).unwrap();
        let ImportPayload::PublicJwk { did_hint, .. } = payload else {
            panic!("expected JWK");
        };
        assert_eq!(did_hint.as_deref(), Some("did:key:zPeer"));
    }

    #[test]
    fn test_envelope_jwk_as_string() {
        let envelope = serde_json::json!({ "jwk": sample_jwk_json() }).to_string();
        let payload = classify(envelope.as_bytes(), &config()).unwrap();
        assert!(matches!(payload, ImportPayload::PublicJwk { .. }));
    }

    #[test]
    fn test_envelope_malformed_jwk_fails_whole_import() {
        let envelope = r#"{"jwk":{"kty":"EC"}}"#;
        assert!(matches!(
            classify(envelope.as_bytes(), &config()),
            Err(Error::InvalidData(_))
        ));
    }

    #[test_case("privateKey")]
    #[test_case("semaphorePrivateKey")]
    fn test_envelope_private_key(key: &str) {
        let encoded = STANDARD.encode([9_u8; 32]);
        let envelope = format!(r#"{{"{key}":"{encoded}"}}"#);
        let payload = classify(envelope.as_bytes(), &config()).unwrap();
        assert_eq!(payload, ImportPayload::ZkPrivateKey(vec![9_u8; 32]));
    }

    #[test]
    fn test_envelope_credential() {
        let envelope = r#"{"credential":"aaa.bbb.ccc"}"#;
        let payload = classify(envelope.as_bytes(), &config()).unwrap();
        assert_eq!(payload, ImportPayload::CredentialJwt("aaa.bbb.ccc".to_string()));
    }

    #[test]
    fn test_plain_jwt_branch() {
        let payload = classify(b"aaa.bbb.ccc", &config()).unwrap();
        assert_eq!(payload, ImportPayload::CredentialJwt("aaa.bbb.ccc".to_string()));
    }

    #[test_case(32)]
    #[test_case(64)]
    fn test_base64_key_lengths_are_zk_imports(len: usize) {
        let encoded = STANDARD.encode(vec![5_u8; len]);
        let payload = classify(encoded.as_bytes(), &config()).unwrap();
        assert_eq!(payload, ImportPayload::ZkPrivateKey(vec![5_u8; len]));
    }

    #[test]
    fn test_double_base64_retries_once() {
        let inner = "aaa.bbb.ccc";
        let once = STANDARD.encode(inner);
        let payload = classify(once.as_bytes(), &config()).unwrap();
        assert_eq!(payload, ImportPayload::CredentialJwt(inner.to_string()));

        // Two levels of encoding exceed the single-retry bound.
        let twice = STANDARD.encode(&once);
        assert!(classify(twice.as_bytes(), &config()).is_err());
    }

    #[test]
    fn test_raw_binary_key() {
        let payload = classify(&[0xFF_u8; 32], &config()).unwrap();
        assert_eq!(payload, ImportPayload::ZkPrivateKey(vec![0xFF_u8; 32]));
    }

    #[test]
    fn test_unsupported_binary() {
        assert!(classify(&[0xFF_u8; 33], &config()).is_err());
    }

    #[test]
    fn test_unsupported_text() {
        assert!(classify(b"hello world", &config()).is_err());
    }
}
